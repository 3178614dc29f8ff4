//! Feedback control of encoding quality and speed.
//!
//! Targets are computed from latency, backlog, decode speed, damage
//! volume, compression efficiency, bandwidth and congestion; the value
//! actually used is a time-weighted average of past values and the new
//! target, which damps oscillation. Values are clamped to `[min, 99]`;
//! 100 is only ever used when explicitly forced.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::config::BatchConfig;
use crate::config::ControllerSettings;
use crate::control::average::{logp, size_weighted_average_and_recent, time_weighted_average};
use crate::control::delay::low_limit;
use crate::stats::{ConnectionStatistics, TimedRing, WindowStatistics};

// ── ReconfigureTargets ───────────────────────────────────────────

/// Explicit control commands from the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfigureTargets {
    /// Fixed quality (`Some(0)` returns to automatic).
    pub quality: Option<u8>,
    pub min_quality: Option<u8>,
    /// Fixed speed (`Some(0)` returns to automatic).
    pub speed: Option<u8>,
    pub min_speed: Option<u8>,
    /// Pin the batch delay (`Some(0)` unlocks).
    pub batch_delay_ms: Option<u64>,
}

// ── ControlInputs ────────────────────────────────────────────────

/// Everything the controller reads for one window.
pub struct ControlInputs<'a> {
    pub now: Instant,
    pub width: u32,
    pub height: u32,
    pub batch: &'a BatchConfig,
    pub window: &'a WindowStatistics,
    pub connection: &'a ConnectionStatistics,
    /// Bits per second, 0 when unknown.
    pub bandwidth_limit: u64,
    pub mmap: bool,
    /// Client decode throughput floor, pixels per second.
    pub min_decode_speed: f64,
}

/// Reference damage latency for a backlog of `mpixels`.
fn reference_latency(mpixels: f64) -> f64 {
    0.010 + 0.025 * (1.0 + mpixels.max(1.0).ln())
}

fn bandwidth_cap(limit: u64) -> f64 {
    if limit > 0 {
        (limit as f64 / 10_000_000.0).sqrt()
    } else {
        1.0
    }
}

/// Target speed in `[min_speed, 100]`.
pub fn target_speed(inp: &ControlInputs<'_>, min_speed: u8, speed_history: &TimedRing<f64>) -> f64 {
    let low = low_limit(inp.mmap, inp.width, inp.height);
    let ref_latency = reference_latency(low as f64 / 1024.0 / 1024.0);
    let stats = inp.window;

    // never go much above 5 times the reference latency
    let dam_lat_abs = ((stats.avg_damage_in_latency - ref_latency) / (ref_latency * 4.0)).max(0.0);

    let dam_lat_rel = if inp.batch.locked {
        0.0
    } else {
        let avg_delay = time_weighted_average(
            inp.now,
            inp.batch.last_actual_delays.iter().map(|(t, d)| (*t, *d as f64)),
            0.1,
            2.0,
        )
        .unwrap_or(inp.batch.delay as f64);
        let frame_delay = (avg_delay + inp.batch.delay as f64) / 2.0;
        // spend at least as long encoding as batching
        let target_latency = ref_latency.max(frame_delay / 1000.0);
        let speed = time_weighted_average(
            inp.now,
            speed_history.iter().map(|(t, s)| (*t, *s)),
            0.1,
            2.0,
        )
        .map_or(min_speed as f64, |s| s.max(min_speed as f64));
        speed / 100.0 * stats.avg_damage_in_latency / target_latency
    };

    // slow decoders need faster (lighter) encodings
    let ads = stats.avg_decode_speed;
    let dec_lat = if ads > 0.0 && ads < 4.0 * inp.min_decode_speed {
        inp.min_decode_speed / ads
    } else {
        0.0
    };

    // lots of pixels in the last second: go faster
    let since = inp.now.checked_sub(Duration::from_secs(1)).unwrap_or(inp.now);
    let recent: Vec<u64> = stats.damage_events.since(since).map(|(_, r)| r.area()).collect();
    let mpixels_per_s = recent.iter().sum::<u64>() as f64 / 1024.0 / 1024.0;
    let pps = if recent.len() > 5 { mpixels_per_s / 50.0 } else { 0.0 };

    let max_speed = bandwidth_cap(inp.bandwidth_limit);
    let mut target = dam_lat_abs.max(dam_lat_rel).max(dec_lat).max(pps).max(0.0);
    target = target.min(1.0).min(max_speed);
    target /= 1.0 + inp.connection.congestion_value * 20.0;

    let ms = (min_speed as f64).clamp(0.0, 100.0);
    ms + (100.0 - ms) * target
}

/// Target quality in `[min_quality, 100]`.
pub fn target_quality(inp: &ControlInputs<'_>, min_quality: u8, min_speed: u8) -> f64 {
    let low = low_limit(inp.mmap, inp.width, inp.height);
    let stats = inp.window;
    let (packets_backlog, pixels_backlog, _) = stats.client_backlog();
    let pb_ratio = pixels_backlog as f64 / low as f64;
    // four frames behind: minimum quality
    let mut target = 1.0 - logp((pb_ratio / 4.0).floor());

    let recs = inp.batch.last_actual_delays.len() as f64;
    if recs > 0.0 && !inp.batch.locked {
        let start = inp.batch.start_delay as f64;
        let min = inp.batch.min_delay as f64;
        let ref_delay = (start * 10.0 / recs + min * recs) / (recs + 10.0 / recs);
        let batch_q = 4.0 * ref_delay / (inp.batch.delay.max(inp.batch.min_delay).max(1) as f64);
        target = target.min(1.0).min(batch_q);
    }

    // compression ratio, per-1000 of the raw 32bpp size
    let es: Vec<(Instant, f64, f64)> = stats
        .encodings
        .iter()
        .filter(|(_, e)| e.pixels >= 4096)
        .map(|(t, e)| {
            let ratio = 1000.0 * e.compressed as f64 * e.bpp as f64 / e.pixels as f64 / 32.0;
            (*t, e.pixels as f64, ratio)
        })
        .collect();
    if es.len() >= 2 {
        if let Some((ascore, rscore)) = size_weighted_average_and_recent(inp.now, es) {
            let bump = if ascore > rscore {
                // compressing better than usual: raise quality, unless behind
                if packets_backlog == 0 {
                    logp((150.0 + ascore) / (150.0 + rscore)) - 1.0
                } else {
                    0.0
                }
            } else {
                let mult = (1000.0 + rscore) / 2000.0;
                -logp((50.0 + rscore) / (50.0 + ascore) - 1.0) * mult
            };
            target += bump;
        }
    }

    let conn = inp.connection;
    if !conn.client_latency.is_empty() && conn.recent_client_latency > 0.0 {
        let latency_q = 3.0 * stats.target_latency / conn.recent_client_latency;
        target = target.min(latency_q);
    }

    target = target.max(0.0).min(bandwidth_cap(inp.bandwidth_limit));
    if min_speed > 0 {
        target = target.powf((100.0 + 4.0 * min_speed as f64) / 100.0);
    }

    // raise quality when little of the window changed recently
    if inp.width > 0 && inp.height > 0 {
        let area = inp.width as f64 * inp.height as f64;
        let at = |secs: u64| inp.now.checked_sub(Duration::from_secs(secs)).unwrap_or(inp.now);
        let last5 = stats.damaged_pixels_since(at(5)) as f64;
        let last10 = stats.damaged_pixels_since(at(10)) as f64;
        let older5 = (last10 - last5).max(0.0);
        let pct = last5 / area;
        if pct <= 0.5 {
            target = (target + (1.0 - pct * 2.0)).min(1.0);
        }
        if last5 < older5 {
            target = target.sqrt();
        }
    }

    target /= 1.0 + conn.congestion_value * 10.0;
    let mq = (min_quality as f64).clamp(0.0, 100.0);
    mq + (100.0 - mq) * target
}

// ── QualitySpeedController ───────────────────────────────────────

/// Per-window quality/speed state.
#[derive(Debug, Clone)]
pub struct QualitySpeedController {
    settings: ControllerSettings,
    speed_history: TimedRing<f64>,
    quality_history: TimedRing<f64>,
    pub speed: u8,
    pub quality: u8,
    pub min_speed: u8,
    pub min_quality: u8,
    pub fixed_speed: Option<u8>,
    pub fixed_quality: Option<u8>,
}

impl QualitySpeedController {
    pub fn new(settings: &ControllerSettings) -> Self {
        let history = settings.history;
        Self {
            settings: settings.clone(),
            speed_history: TimedRing::new(history, Duration::from_secs(3600)),
            quality_history: TimedRing::new(history, Duration::from_secs(3600)),
            speed: 50,
            quality: 50,
            min_speed: settings.min_speed,
            min_quality: settings.min_quality,
            fixed_speed: None,
            fixed_quality: None,
        }
    }

    /// Apply explicit overrides.
    pub fn reconfigure(&mut self, targets: &ReconfigureTargets) {
        if let Some(q) = targets.quality {
            self.fixed_quality = (q > 0).then_some(q.min(100));
        }
        if let Some(s) = targets.speed {
            self.fixed_speed = (s > 0).then_some(s.min(100));
        }
        if let Some(q) = targets.min_quality {
            self.min_quality = q.min(100);
        }
        if let Some(s) = targets.min_speed {
            self.min_speed = s.min(100);
        }
        if let Some(q) = self.fixed_quality {
            self.quality = q;
        }
        if let Some(s) = self.fixed_speed {
            self.speed = s;
        }
    }

    pub fn update(&mut self, inputs: &ControlInputs<'_>) {
        self.update_speed(inputs);
        self.update_quality(inputs);
        debug!(
            speed = self.speed,
            quality = self.quality,
            "updated encoding targets"
        );
    }

    pub fn update_speed(&mut self, inputs: &ControlInputs<'_>) {
        let speed = match self.fixed_speed {
            Some(s) => s.min(100) as f64,
            None => {
                let target = target_speed(inputs, self.min_speed, &self.speed_history);
                let data = self
                    .speed_history
                    .iter()
                    .map(|(t, v)| (*t, *v))
                    .chain(std::iter::once((inputs.now, target)));
                let avg = time_weighted_average(
                    inputs.now,
                    data,
                    self.settings.speed_twa_offset,
                    self.settings.speed_twa_power,
                )
                .unwrap_or(target);
                avg.max(self.min_speed as f64).min(99.0)
            }
        };
        self.speed = speed as u8;
        self.speed_history.push_at(inputs.now, self.speed as f64);
    }

    pub fn update_quality(&mut self, inputs: &ControlInputs<'_>) {
        let quality = match self.fixed_quality {
            Some(q) => q.min(100) as f64,
            None => {
                let target = target_quality(inputs, self.min_quality, self.min_speed);
                let data = self
                    .quality_history
                    .iter()
                    .map(|(t, v)| (*t, *v))
                    .chain(std::iter::once((inputs.now, target)));
                let avg = time_weighted_average(
                    inputs.now,
                    data,
                    self.settings.quality_twa_offset,
                    self.settings.quality_twa_power,
                )
                .unwrap_or(target);
                avg.max(self.min_quality as f64).min(99.0)
            }
        };
        self.quality = quality as u8;
        self.quality_history.push_at(inputs.now, self.quality as f64);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchSettings;
    use crate::region::Rectangle;
    use crate::stats::PendingAck;

    struct Fixture {
        batch: BatchConfig,
        window: WindowStatistics,
        connection: ConnectionStatistics,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                batch: BatchConfig::template(&BatchSettings::default()).for_window(800, 600),
                window: WindowStatistics::default(),
                connection: ConnectionStatistics::default(),
            }
        }

        fn inputs(&self, now: Instant) -> ControlInputs<'_> {
            ControlInputs {
                now,
                width: 800,
                height: 600,
                batch: &self.batch,
                window: &self.window,
                connection: &self.connection,
                bandwidth_limit: 0,
                mmap: false,
                min_decode_speed: 1_000_000.0,
            }
        }
    }

    #[test]
    fn idle_window_gets_high_quality() {
        let f = Fixture::new();
        let q = target_quality(&f.inputs(Instant::now()), 0, 0);
        assert!(q > 90.0, "q = {q}");
    }

    #[test]
    fn pixel_backlog_lowers_quality() {
        let mut f = Fixture::new();
        let now = Instant::now();
        for seq in 0..10 {
            f.window.record_sent(
                seq,
                PendingAck {
                    damage_time: now,
                    sent_at: now,
                    pixels: 800 * 600,
                    bytes: 1000,
                },
            );
        }
        // keep the window busy so the idle boost does not apply
        for _ in 0..20 {
            f.window.record_damage(now, Rectangle::sized(800, 600));
        }
        let q = target_quality(&f.inputs(now), 0, 0);
        assert!(q < 50.0, "q = {q}");
    }

    #[test]
    fn congestion_lowers_speed_target() {
        let mut f = Fixture::new();
        let now = Instant::now();
        f.window.avg_damage_in_latency = 0.5;
        let history = TimedRing::new(10, Duration::from_secs(60));
        let fast = target_speed(&f.inputs(now), 0, &history);
        f.connection.congestion_value = 1.0;
        let slow = target_speed(&f.inputs(now), 0, &history);
        assert!(slow < fast);
    }

    #[test]
    fn fixed_values_override() {
        let f = Fixture::new();
        let mut c = QualitySpeedController::new(&ControllerSettings::default());
        c.reconfigure(&ReconfigureTargets {
            quality: Some(100),
            speed: Some(20),
            ..Default::default()
        });
        c.update(&f.inputs(Instant::now()));
        assert_eq!((c.quality, c.speed), (100, 20));
        c.reconfigure(&ReconfigureTargets {
            quality: Some(0),
            ..Default::default()
        });
        assert!(c.fixed_quality.is_none());
    }

    #[test]
    fn automatic_values_stay_below_100() {
        let f = Fixture::new();
        let mut c = QualitySpeedController::new(&ControllerSettings::default());
        c.min_speed = 30;
        for _ in 0..5 {
            c.update(&f.inputs(Instant::now()));
        }
        assert!(c.quality <= 99);
        assert!(c.speed >= 30 && c.speed <= 99);
    }
}
