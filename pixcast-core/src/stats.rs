//! Append-only, age-trimmed statistics.
//!
//! Two levels: [`WindowStatistics`] per window and
//! [`ConnectionStatistics`] for everything shared by the connection
//! (client latency, packet queue, throughput). Both keep short rings of
//! `(when, value)` samples; the controller turns those into factors and
//! targets. [`Statistics`] is the read-only snapshot handed out by the
//! engine.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::control::average::{
    Factor, Smoothing, average_and_recent, calculate_for_target, logp, queue_inspect,
};
use crate::encoding::Encoding;
use crate::error::EngineError;
use crate::region::Rectangle;
use crate::subregion::SubregionInfo;
use crate::types::WindowId;

// ── TimedRing ────────────────────────────────────────────────────

/// Rolling buffer of timestamped samples, bounded by count and age.
#[derive(Debug, Clone)]
pub struct TimedRing<T> {
    samples: VecDeque<(Instant, T)>,
    max_len: usize,
    max_age: Duration,
}

impl<T> TimedRing<T> {
    pub fn new(max_len: usize, max_age: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_len.min(256)),
            max_len: max_len.max(1),
            max_age,
        }
    }

    /// Record with an explicit timestamp.
    pub fn push_at(&mut self, when: Instant, value: T) {
        if self.samples.len() == self.max_len {
            self.samples.pop_front();
        }
        self.samples.push_back((when, value));
        self.evict(when);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &(Instant, T)> + '_ {
        self.samples.iter()
    }

    /// Samples recorded at or after `since`.
    pub fn since(&self, since: Instant) -> impl Iterator<Item = &(Instant, T)> + '_ {
        self.samples.iter().filter(move |(t, _)| *t >= since)
    }

    pub fn last(&self) -> Option<&(Instant, T)> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some((ts, _)) = self.samples.front() {
            if now.saturating_duration_since(*ts) > self.max_age {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

const RING_LEN: usize = 250;
const RING_AGE: Duration = Duration::from_secs(60);

fn ring<T>() -> TimedRing<T> {
    TimedRing::new(RING_LEN, RING_AGE)
}

// ── ThroughputMeter ──────────────────────────────────────────────

/// Bytes sent over a rolling window plus a smoothed round-trip time.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
    smoothed_rtt_us: u64,
}

impl ThroughputMeter {
    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            window,
            total_bytes: 0,
            smoothed_rtt_us: 0,
        }
    }

    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        while let Some(&(ts, b)) = self.samples.front() {
            if when.saturating_duration_since(ts) > self.window {
                self.samples.pop_front();
                self.total_bytes = self.total_bytes.saturating_sub(b);
            } else {
                break;
            }
        }
    }

    /// EWMA with α = 1/8.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as u64;
        if self.smoothed_rtt_us == 0 {
            self.smoothed_rtt_us = rtt_us;
        } else {
            self.smoothed_rtt_us = self.smoothed_rtt_us * 7 / 8 + rtt_us / 8;
        }
    }

    /// Throughput in bytes/second over the rolling window.
    pub fn bytes_per_sec(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back()) else {
            return 0;
        };
        let elapsed = last.saturating_duration_since(*first).max(Duration::from_millis(1));
        (self.total_bytes as f64 / elapsed.as_secs_f64()) as u64
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.smoothed_rtt_us)
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

// ── PendingAck ───────────────────────────────────────────────────

/// A packet sent to the client and not acknowledged yet.
#[derive(Debug, Clone, Copy)]
pub struct PendingAck {
    pub damage_time: Instant,
    pub sent_at: Instant,
    pub pixels: u64,
    pub bytes: u64,
}

/// One completed encode.
#[derive(Debug, Clone, Copy)]
pub struct EncodeSample {
    pub encoding: Encoding,
    pub pixels: u64,
    /// Source bytes per pixel.
    pub bpp: u32,
    pub compressed: u64,
    pub elapsed: Duration,
}

// ── WindowStatistics ─────────────────────────────────────────────

/// Per-window history.
#[derive(Debug, Clone)]
pub struct WindowStatistics {
    pub damage_events: TimedRing<Rectangle>,
    pub damage_events_count: u64,
    /// Time from damage to the item being queued for encoding.
    pub damage_in_latency: TimedRing<f64>,
    /// Time from damage to the packet being ready.
    pub damage_out_latency: TimedRing<f64>,
    pub encodings: TimedRing<EncodeSample>,
    /// Client decode throughput, pixels per second.
    pub decode_speed: TimedRing<f64>,
    pub pending_acks: BTreeMap<u64, PendingAck>,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub decode_errors: u64,
    pub soft_expired_total: u64,
    pub hard_timeouts: u64,
    pub cancelled: u64,
    pub last_resized: Option<Instant>,
    pub last_recalculate: Option<Instant>,
    /// Latency the client should be able to ack within, in seconds.
    pub target_latency: f64,
    // averages, refreshed by `update_averages`
    pub avg_damage_in_latency: f64,
    pub recent_damage_in_latency: f64,
    pub avg_damage_out_latency: f64,
    pub recent_damage_out_latency: f64,
    pub avg_decode_speed: f64,
    pub recent_decode_speed: f64,
}

impl Default for WindowStatistics {
    fn default() -> Self {
        Self {
            damage_events: ring(),
            damage_events_count: 0,
            damage_in_latency: ring(),
            damage_out_latency: ring(),
            encodings: ring(),
            decode_speed: ring(),
            pending_acks: BTreeMap::new(),
            packets_sent: 0,
            bytes_sent: 0,
            decode_errors: 0,
            soft_expired_total: 0,
            hard_timeouts: 0,
            cancelled: 0,
            last_resized: None,
            last_recalculate: None,
            target_latency: 0.1,
            avg_damage_in_latency: 0.0,
            recent_damage_in_latency: 0.0,
            avg_damage_out_latency: 0.0,
            recent_damage_out_latency: 0.0,
            avg_decode_speed: 0.0,
            recent_decode_speed: 0.0,
        }
    }
}

impl WindowStatistics {
    pub fn record_damage(&mut self, now: Instant, rect: Rectangle) {
        self.damage_events.push_at(now, rect);
        self.damage_events_count += 1;
    }

    /// Pixels damaged in `[now - window, now]`.
    pub fn damaged_pixels_since(&self, since: Instant) -> u64 {
        self.damage_events.since(since).map(|(_, r)| r.area()).sum()
    }

    pub fn recently_resized(&self, now: Instant, within: Duration) -> bool {
        self.last_resized
            .is_some_and(|t| now.saturating_duration_since(t) < within)
    }

    pub fn record_sent(&mut self, sequence: u64, ack: PendingAck) {
        self.packets_sent += 1;
        self.bytes_sent += ack.bytes;
        self.damage_out_latency.push_at(
            ack.sent_at,
            ack.sent_at
                .saturating_duration_since(ack.damage_time)
                .as_secs_f64(),
        );
        self.pending_acks.insert(sequence, ack);
    }

    /// Packets sent longer ago than the client should need to ack them.
    pub fn packets_backlog(&self, now: Instant) -> usize {
        let grace = Duration::from_secs_f64(self.target_latency + 0.020);
        self.pending_acks
            .values()
            .filter(|a| now.saturating_duration_since(a.sent_at) >= grace)
            .count()
    }

    /// `(packets, pixels, bytes)` awaiting acknowledgement.
    pub fn client_backlog(&self) -> (usize, u64, u64) {
        self.pending_acks
            .values()
            .fold((0, 0, 0), |(n, px, b), a| (n + 1, px + a.pixels, b + a.bytes))
    }

    /// Refresh the cached averages.
    pub fn update_averages(&mut self, now: Instant) {
        let lat = |r: &TimedRing<f64>| average_and_recent(now, r.iter().map(|(t, v)| (*t, *v)));
        if let Some((a, r)) = lat(&self.damage_in_latency) {
            self.avg_damage_in_latency = a;
            self.recent_damage_in_latency = r;
        }
        if let Some((a, r)) = lat(&self.damage_out_latency) {
            self.avg_damage_out_latency = a;
            self.recent_damage_out_latency = r;
        }
        if let Some((a, r)) = lat(&self.decode_speed) {
            self.avg_decode_speed = a;
            self.recent_decode_speed = r;
        }
    }

    /// Target client latency: the best latency seen plus the time it
    /// takes to push this window's typical frame through the decoder.
    pub fn update_target_latency(&mut self, min_client_latency: f64, avg_client_latency: f64) {
        let decode = if self.avg_decode_speed > 0.0 {
            let avg_pixels = self
                .encodings
                .iter()
                .map(|(_, e)| e.pixels as f64)
                .sum::<f64>()
                / self.encodings.len().max(1) as f64;
            avg_pixels / self.avg_decode_speed
        } else {
            0.0
        };
        let base = min_client_latency.max(0.0) + avg_client_latency.max(0.0) * 0.2;
        self.target_latency = (base + decode).clamp(0.010, 1.0);
    }

    /// Window-level inputs to the batch-delay calculation.
    pub fn factors(&self, now: Instant) -> Vec<Factor> {
        let mut factors = Vec::new();
        if !self.damage_out_latency.is_empty() {
            // keep damage latency close to the target
            factors.push(calculate_for_target(
                "damage-latency",
                self.target_latency,
                self.avg_damage_out_latency,
                self.recent_damage_out_latency,
                0.5,
                0.05,
                Smoothing::Sqrt,
                1.0,
            ));
        }
        if self.avg_decode_speed > 0.0 && self.recent_decode_speed > 0.0 {
            // client getting slower at decoding: back off
            let ratio = self.avg_decode_speed / self.recent_decode_speed;
            factors.push(Factor::new(
                "client-decode-speed",
                logp(ratio),
                logp((ratio - 1.0).abs()),
            ));
        }
        let pending: Vec<(Instant, f64)> = self
            .pending_acks
            .values()
            .map(|a| (a.sent_at, 1.0))
            .collect();
        if !pending.is_empty() {
            factors.push(queue_inspect(
                "ack-pending",
                now,
                pending,
                1.0,
                1.0,
                Smoothing::Sqrt,
            ));
        }
        factors
    }

    pub fn snapshot(&self, window: WindowId, now: Instant) -> WindowSnapshot {
        let (packets_pending, pixels_pending, _) = self.client_backlog();
        WindowSnapshot {
            window,
            damage_events: self.damage_events_count,
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            packets_pending,
            pixels_pending,
            packets_backlog: self.packets_backlog(now),
            decode_errors: self.decode_errors,
            soft_expired: self.soft_expired_total,
            hard_timeouts: self.hard_timeouts,
            cancelled: self.cancelled,
            avg_damage_latency_ms: (self.avg_damage_out_latency * 1000.0) as u64,
            avg_decode_speed: self.avg_decode_speed as u64,
            target_latency_ms: (self.target_latency * 1000.0) as u64,
            encodings: self.encodings.iter().fold(BTreeMap::new(), |mut m, (_, e)| {
                *m.entry(e.encoding).or_insert(0) += 1;
                m
            }),
            ..WindowSnapshot::default()
        }
    }
}

// ── ConnectionStatistics ─────────────────────────────────────────

/// History shared by all windows of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionStatistics {
    /// Ack latency net of decode time, in seconds, with its pixel count.
    pub client_latency: TimedRing<(u64, f64)>,
    pub min_client_latency: Option<f64>,
    pub avg_client_latency: f64,
    pub recent_client_latency: f64,
    /// `(window, pixels)` of every damage event.
    pub damage_events: TimedRing<(WindowId, u64)>,
    /// Packets waiting for acks across the connection.
    pub packet_qsizes: TimedRing<f64>,
    /// Pixels waiting for acks across the connection.
    pub packet_qpixels: TimedRing<f64>,
    /// Items waiting in the encode queue.
    pub work_qsizes: TimedRing<f64>,
    /// Flushes deferred because the client was behind.
    pub congestion_events: TimedRing<()>,
    pub congestion_value: f64,
    pub throughput: ThroughputMeter,
    pub damage_events_count: u64,
    pub packet_count: u64,
}

impl Default for ConnectionStatistics {
    fn default() -> Self {
        Self {
            client_latency: ring(),
            min_client_latency: None,
            avg_client_latency: 0.0,
            recent_client_latency: 0.0,
            damage_events: TimedRing::new(1000, Duration::from_secs(10)),
            packet_qsizes: ring(),
            packet_qpixels: ring(),
            work_qsizes: ring(),
            congestion_events: TimedRing::new(100, Duration::from_secs(10)),
            congestion_value: 0.0,
            throughput: ThroughputMeter::default(),
            damage_events_count: 0,
            packet_count: 0,
        }
    }
}

impl ConnectionStatistics {
    pub fn record_client_latency(&mut self, now: Instant, pixels: u64, latency: f64) {
        let latency = latency.max(0.0);
        self.client_latency.push_at(now, (pixels, latency));
        self.min_client_latency = Some(self.min_client_latency.map_or(latency, |m| m.min(latency)));
        self.throughput.record_rtt(Duration::from_secs_f64(latency));
    }

    pub fn record_congestion(&mut self, now: Instant) {
        self.congestion_events.push_at(now, ());
    }

    /// Events and pixels recorded within `time_unit` of `now`.
    pub fn recent_damage(&self, now: Instant, time_unit: Duration) -> (usize, u64) {
        let since = now.checked_sub(time_unit).unwrap_or(now);
        self.damage_events
            .since(since)
            .fold((0, 0), |(n, px), (_, (_, p))| (n + 1, px + p))
    }

    pub fn update_averages(&mut self, now: Instant) {
        if let Some((a, r)) =
            average_and_recent(now, self.client_latency.iter().map(|(t, (_, l))| (*t, *l)))
        {
            self.avg_client_latency = a;
            self.recent_client_latency = r;
        }
        let since = now.checked_sub(Duration::from_secs(10)).unwrap_or(now);
        let events = self.congestion_events.since(since).count() as f64;
        self.congestion_value = (events / 10.0).min(1.0);
    }

    /// Connection-level inputs to the batch-delay calculation.
    pub fn factors(&self, now: Instant, low_limit: u64) -> Vec<Factor> {
        let mut factors = Vec::new();
        if let Some(min) = self.min_client_latency {
            let l = 0.005 + min;
            factors.push(calculate_for_target(
                "client-latency",
                l,
                self.avg_client_latency,
                self.recent_client_latency,
                0.8,
                0.005,
                Smoothing::Sqrt,
                logp(l / 0.020),
            ));
        }
        let series = |r: &TimedRing<f64>| r.iter().map(|(t, v)| (*t, *v)).collect::<Vec<_>>();
        factors.push(queue_inspect(
            "packet-queue-size",
            now,
            series(&self.packet_qsizes),
            1.0,
            1.0,
            Smoothing::Sqrt,
        ));
        factors.push(queue_inspect(
            "packet-queue-pixels",
            now,
            series(&self.packet_qpixels),
            1.0,
            low_limit as f64,
            Smoothing::Sqrt,
        ));
        factors.push(queue_inspect(
            "encode-work-queue",
            now,
            series(&self.work_qsizes),
            1.0,
            1.0,
            Smoothing::Logp,
        ));
        if self.congestion_value > 0.0 {
            factors.push(Factor::new(
                "congestion",
                1.0 + self.congestion_value,
                self.congestion_value * 10.0,
            ));
        }
        factors
    }
}

// ── Snapshots ────────────────────────────────────────────────────

/// Serialisable per-window statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowSnapshot {
    pub window: WindowId,
    pub width: u32,
    pub height: u32,
    pub encoding: Option<Encoding>,
    pub batch_delay_ms: u64,
    pub quality: u8,
    pub speed: u8,
    pub damage_events: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_pending: usize,
    pub pixels_pending: u64,
    pub packets_backlog: usize,
    pub decode_errors: u64,
    pub soft_expired: u64,
    pub hard_timeouts: u64,
    pub cancelled: u64,
    pub avg_damage_latency_ms: u64,
    pub avg_decode_speed: u64,
    pub target_latency_ms: u64,
    pub refresh_pending: bool,
    pub av_sync_delay_ms: u32,
    pub suspended: bool,
    pub video_region: Option<SubregionInfo>,
    pub factors: Vec<Factor>,
    pub encodings: BTreeMap<Encoding, u64>,
}

/// Read-only view of the whole engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub damage_events: u64,
    pub packets_sent: u64,
    pub min_client_latency_ms: Option<u64>,
    pub avg_client_latency_ms: u64,
    pub congestion: f64,
    pub throughput_bps: u64,
    pub baseline_delay_per_megapixel: u64,
    pub encode_queue: usize,
    pub live_buffers: usize,
    pub windows: Vec<WindowSnapshot>,
}

impl Statistics {
    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn window(&self, id: WindowId) -> Option<&WindowSnapshot> {
        self.windows.iter().find(|w| w.window == id)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_bounds_length_and_age() {
        let mut r = TimedRing::new(3, Duration::from_secs(1));
        let t0 = Instant::now();
        for i in 0..5 {
            r.push_at(t0, i);
        }
        assert_eq!(r.len(), 3);
        r.push_at(t0 + Duration::from_secs(5), 9);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn throughput_two_samples() {
        let mut m = ThroughputMeter::with_window(Duration::from_secs(5));
        let t0 = Instant::now();
        m.record_at(t0, 1_000_000);
        m.record_at(t0 + Duration::from_secs(1), 1_000_000);
        let bps = m.bytes_per_sec();
        assert!((1_900_000..=2_100_000).contains(&bps), "bps = {bps}");
    }

    #[test]
    fn smoothed_rtt() {
        let mut m = ThroughputMeter::default();
        m.record_rtt(Duration::from_millis(10));
        m.record_rtt(Duration::from_millis(2));
        let us = m.rtt().as_micros();
        assert!(us > 8000 && us < 10000);
    }

    #[test]
    fn backlog_counts_only_overdue_packets() {
        let mut s = WindowStatistics::default();
        let t0 = Instant::now();
        let ack = PendingAck {
            damage_time: t0,
            sent_at: t0,
            pixels: 100,
            bytes: 10,
        };
        s.record_sent(1, ack);
        assert_eq!(s.packets_backlog(t0), 0);
        assert_eq!(s.packets_backlog(t0 + Duration::from_secs(1)), 1);
        assert_eq!(s.client_backlog(), (1, 100, 10));
    }

    #[test]
    fn recent_damage_window() {
        let mut c = ConnectionStatistics::default();
        let t0 = Instant::now();
        c.damage_events.push_at(t0, (1, 100));
        c.damage_events.push_at(t0 + Duration::from_secs(2), (1, 50));
        let (n, px) = c.recent_damage(t0 + Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!((n, px), (1, 50));
    }

    #[test]
    fn snapshot_serializes() {
        let stats = Statistics {
            windows: vec![WindowStatistics::default().snapshot(3, Instant::now())],
            ..Default::default()
        };
        let json = stats.to_json().unwrap();
        assert!(json.contains("\"window\": 3"));
    }
}
