//! The capture-context side of the engine.
//!
//! [`WindowEncodeEngine`] owns every window's geometry, batching state,
//! quality/speed controller, refresh and av-sync state, and all timers.
//! It is single-threaded and clock-driven: callers pass `now` into every
//! operation, poll [`next_deadline`](WindowEncodeEngine::next_deadline)
//! and call [`fire_timers`](WindowEncodeEngine::fire_timers) when it
//! passes. Captured regions leave through [`take_work`] and come back as
//! [`EncodeOutcome`]s through [`complete`]; finished packets are drained
//! with [`take_packets`].
//!
//! [`take_work`]: WindowEncodeEngine::take_work
//! [`complete`]: WindowEncodeEngine::complete
//! [`take_packets`]: WindowEncodeEngine::take_packets

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::avsync::AvSync;
use crate::batch::{
    BatchConfig, BatchScheduler, DamageOptions, Flush, PackingInput, SchedulerContext, TimerOutcome, plan_regions,
};
use crate::config::{BatchSettings, EngineConfig};
use crate::control::{
    ControlInputs, DelayInputs, QualitySpeedController, ReconfigureTargets, WindowDelay, baseline_delay,
    calculate_batch_delay, low_limit, may_skip_recalculation,
};
use crate::delta::DeltaEpoch;
use crate::encoding::{ClientCapabilities, Encoding, PREFERRED_ORDER, WindowFlags};
use crate::error::{CaptureError, EngineError};
use crate::packet::DrawPacket;
use crate::pipeline::{CodecRegistry, ScalingHint};
use crate::refresh::{RefreshScheduler, SentRegion, is_lossless};
use crate::region::Rectangle;
use crate::selector::{SelectionInput, SelectionThresholds, VideoContext, best_still, select_encoding};
use crate::stats::{ConnectionStatistics, PendingAck, Statistics, WindowStatistics};
use crate::subregion::{DamageHistory, VideoSubregion, find_in_regions};
use crate::timer::{TimerEvent, TimerHandle, TimerKind, TimerSlot, Timers};
use crate::types::{BufferTracker, ImageBuffer, WindowId};
use crate::window::{
    CancelWatermark, EncodeEvent, EncodeItem, EncodeOutcome, EncoderSettings, VideoStatus, WindowEncoder, WorkItem,
};

// ── External interfaces ──────────────────────────────────────────

/// Source of window pixels.
pub trait CaptureBackend: Send {
    /// Copy the pixels of `rect` out of `window`.
    fn get_pixels(&mut self, window: WindowId, rect: Rectangle) -> Result<ImageBuffer, CaptureError>;
}

/// What the client reported for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// Painted after spending this long decoding.
    Decoded(Duration),
    Failed,
}

// ── WindowState ──────────────────────────────────────────────────

/// Connection-wide load, sampled before touching a window.
#[derive(Debug, Clone, Copy)]
struct LinkState {
    queue_size: usize,
    recent_events: usize,
    recent_pixels: u64,
    bandwidth_limited: bool,
}

#[derive(Debug)]
struct WindowState {
    width: u32,
    height: u32,
    flags: WindowFlags,
    encoding: Encoding,
    strict: bool,
    scheduler: BatchScheduler,
    controller: QualitySpeedController,
    stats: WindowStatistics,
    refresh: RefreshScheduler,
    subregion: VideoSubregion,
    av_sync: AvSync,
    watermark: CancelWatermark,
    delta_epoch: DeltaEpoch,
    suspended: bool,
    /// Last item sequence handed out.
    sequence: u64,
    items_encoding: usize,
    pixels_encoding: u64,
    video: VideoStatus,
    /// Video encodings no pipeline could be built for.
    video_unavailable: Vec<Encoding>,
    video_flush: TimerSlot,
    flush_frame: u64,
    decode_refresh: TimerSlot,
    pixels_since_update: u64,
}

impl WindowState {
    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn full_rect(&self) -> Rectangle {
        Rectangle::sized(self.width, self.height)
    }

    fn context(&self, id: WindowId, now: Instant, link: LinkState, settings: &BatchSettings) -> SchedulerContext {
        SchedulerContext {
            now,
            window: id,
            width: self.width,
            height: self.height,
            packets_backlog: self.stats.packets_backlog(now),
            acks_pending: self.stats.pending_acks.len(),
            pixels_encoding: self.pixels_encoding,
            items_encoding: self.items_encoding,
            recently_resized: self
                .stats
                .recently_resized(now, Duration::from_millis(settings.resize_window_ms)),
            queue_size: link.queue_size,
            recent_events: link.recent_events,
            recent_pixels: link.recent_pixels,
            bandwidth_limited: link.bandwidth_limited,
            video_region: self.subregion.rectangle().is_some(),
        }
    }

    fn scaling_hint(&self, now: Instant) -> ScalingHint {
        let since = now.checked_sub(Duration::from_secs(5)).unwrap_or(now);
        let frames = self.stats.damaged_pixels_since(since) / self.area().max(1);
        ScalingHint {
            fullscreen: self.flags.contains(WindowFlags::FULLSCREEN),
            maximized: self.flags.contains(WindowFlags::MAXIMIZED),
            shadow: self.flags.contains(WindowFlags::SHADOW),
            damage_events: self.stats.damage_events_count,
            settled: !self.stats.recently_resized(now, Duration::from_millis(500)),
            ffps: Some((frames / 5) as u32),
        }
    }

    /// Cancel every timer this window owns.
    fn cancel_timers(&mut self, timers: &mut Timers) {
        self.scheduler.cancel(timers);
        self.refresh.cancel(timers);
        self.subregion.cancel_refresh(timers);
        self.av_sync.cancel(timers);
        self.video_flush.cancel(timers);
        self.decode_refresh.cancel(timers);
    }

    /// Refresh bookkeeping for a sent packet.
    ///
    /// Lossy pixels inside the video region wait for the region's own
    /// refresh; only the rest reaches the regular refresh scheduler.
    fn track_refresh(&mut self, id: WindowId, sent: SentRegion, batch_delay: u64, now: Instant, timers: &mut Timers) {
        let area = self.area();
        let video = self
            .subregion
            .rectangle()
            .filter(|vr| !sent.lossless && vr.intersects(&sent.rect));
        let Some(vr) = video else {
            if sent.lossless {
                self.subregion.remove_refresh_region(&sent.rect);
            }
            self.refresh.on_sent(id, sent, area, batch_delay, now, timers);
            return;
        };
        let mut rest = sent.rect.subtract(&vr);
        if let Some(inside) = sent.rect.intersection(&vr) {
            rest.extend(self.subregion.add_video_refresh(id, inside, now, timers));
        }
        for rect in rest {
            self.refresh
                .on_sent(id, SentRegion { rect, ..sent }, area, batch_delay, now, timers);
        }
    }
}

/// One capture + encode request of a flush.
struct Job {
    rect: Rectangle,
    encoding: Encoding,
    quality: u8,
    speed: u8,
}

// ── WindowEncodeEngine ───────────────────────────────────────────

pub struct WindowEncodeEngine {
    config: EngineConfig,
    caps: ClientCapabilities,
    capture: Box<dyn CaptureBackend>,
    tracker: BufferTracker,
    windows: BTreeMap<WindowId, WindowState>,
    timers: Timers,
    /// Batch template new windows start from.
    template: BatchConfig,
    connection: ConnectionStatistics,
    work: VecDeque<WorkItem>,
    packets: VecDeque<DrawPacket>,
    packet_sequence: u64,
    recalc: TimerSlot,
    last_recalculate: Option<Instant>,
    /// Encodings both sides support, best first.
    common: Vec<Encoding>,
    /// Latest instant handed to the engine.
    clock: Option<Instant>,
}

impl WindowEncodeEngine {
    pub fn new(config: EngineConfig, caps: ClientCapabilities, capture: Box<dyn CaptureBackend>) -> Self {
        let config = config.sanitized();
        let mut common = Vec::new();
        if caps.mmap {
            common.push(Encoding::Mmap);
        }
        common.extend(PREFERRED_ORDER.iter().copied().filter(|e| caps.supports(*e)));
        info!(encodings = ?common, mmap = caps.mmap, "encoding engine ready");
        Self {
            template: BatchConfig::template(&config.batch),
            config,
            caps,
            capture,
            tracker: BufferTracker::new(),
            windows: BTreeMap::new(),
            timers: Timers::new(),
            connection: ConnectionStatistics::default(),
            work: VecDeque::new(),
            packets: VecDeque::new(),
            packet_sequence: 0,
            recalc: TimerSlot::default(),
            last_recalculate: None,
            common,
            clock: None,
        }
    }

    /// Counter of captured buffers still alive.
    pub fn buffers(&self) -> &BufferTracker {
        &self.tracker
    }

    fn tick(&mut self, now: Instant) {
        self.clock = Some(self.clock.map_or(now, |c| c.max(now)));
    }

    fn window_mut(&mut self, id: WindowId) -> Result<&mut WindowState, EngineError> {
        self.windows.get_mut(&id).ok_or(EngineError::UnknownWindow(id))
    }

    fn link_state(&self, now: Instant) -> LinkState {
        let (recent_events, recent_pixels) = self.connection.recent_damage(now, self.template.time_unit);
        let limit = self.caps.bandwidth_limit;
        LinkState {
            queue_size: self.work.len(),
            recent_events,
            recent_pixels,
            bandwidth_limited: limit > 0 && self.connection.throughput.bytes_per_sec() * 8 >= limit,
        }
    }

    // ── Window lifecycle ─────────────────────────────────────────

    pub fn add_window(
        &mut self,
        id: WindowId,
        width: u32,
        height: u32,
        flags: WindowFlags,
        now: Instant,
    ) -> Result<(), EngineError> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidDimensions { width, height });
        }
        self.tick(now);
        if self.windows.contains_key(&id) {
            self.remove_window(id)?;
        }
        let encoding = PREFERRED_ORDER
            .iter()
            .copied()
            .find(|e| self.caps.supports(*e))
            .unwrap_or(Encoding::Rgb24);
        let batch = self.template.for_window(width, height);
        debug!(window = id, width, height, delay = batch.delay, %encoding, "window added");
        let state = WindowState {
            width,
            height,
            flags,
            encoding,
            strict: false,
            scheduler: BatchScheduler::new(batch, &self.config.batch),
            controller: QualitySpeedController::new(&self.config.controller),
            stats: WindowStatistics::default(),
            refresh: RefreshScheduler::new(&self.config.refresh),
            subregion: VideoSubregion::new(&self.config.subregion, self.config.refresh.delay_ms),
            av_sync: AvSync::new(&self.config.av_sync, self.caps.av_sync_delay_ms),
            watermark: CancelWatermark::new(),
            delta_epoch: DeltaEpoch::new(),
            suspended: false,
            sequence: 0,
            items_encoding: 0,
            pixels_encoding: 0,
            video: VideoStatus::default(),
            video_unavailable: Vec::new(),
            video_flush: TimerSlot::default(),
            flush_frame: 0,
            decode_refresh: TimerSlot::default(),
            pixels_since_update: 0,
        };
        self.windows.insert(id, state);
        Ok(())
    }

    /// Forget a window: timers, queued work and its encoder go with it.
    pub fn remove_window(&mut self, id: WindowId) -> Result<(), EngineError> {
        let mut window = self.windows.remove(&id).ok_or(EngineError::UnknownWindow(id))?;
        window.watermark.raise(window.sequence);
        window.cancel_timers(&mut self.timers);
        self.timers.cancel_window(id);
        self.work.retain(|item| item.window() != id);
        self.work.push_back(WorkItem::Close { window: id });
        debug!(window = id, "window removed");
        Ok(())
    }

    pub fn resize(&mut self, id: WindowId, width: u32, height: u32, now: Instant) -> Result<(), EngineError> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidDimensions { width, height });
        }
        self.cancel(id)?;
        let window = self.window_mut(id)?;
        debug!(window = id, from = ?(window.width, window.height), to = ?(width, height), "window resized");
        window.width = width;
        window.height = height;
        window.stats.last_resized = Some(now);
        let rect = window.full_rect();
        self.damage(id, rect, DamageOptions::default(), now)
    }

    pub fn set_window_flags(&mut self, id: WindowId, flags: WindowFlags) -> Result<(), EngineError> {
        self.window_mut(id)?.flags = flags;
        Ok(())
    }

    // ── Damage ───────────────────────────────────────────────────

    /// A rectangle of the window changed.
    pub fn damage(
        &mut self,
        id: WindowId,
        rect: Rectangle,
        options: DamageOptions,
        now: Instant,
    ) -> Result<(), EngineError> {
        if !self.windows.contains_key(&id) {
            return Err(EngineError::UnknownWindow(id));
        }
        self.damage_rect(id, rect, &options, now);
        Ok(())
    }

    fn damage_rect(&mut self, id: WindowId, rect: Rectangle, options: &DamageOptions, now: Instant) {
        self.tick(now);
        let link = self.link_state(now);
        let Some(window) = self.windows.get_mut(&id) else {
            return;
        };
        let Some(rect) = rect.clip_to(window.width, window.height) else {
            trace!(window = id, ?rect, "damage outside the window");
            return;
        };
        window.stats.record_damage(now, rect);
        window.pixels_since_update += rect.area();
        self.connection.damage_events.push_at(now, (id, rect.area()));
        self.connection.damage_events_count += 1;
        if window.suspended {
            trace!(window = id, "suspended, damage deferred to resume");
            return;
        }
        let ctx = window.context(id, now, link, &self.config.batch);
        if let Some(flush) = window.scheduler.damage(&ctx, rect, options, &mut self.timers) {
            self.process_flush(id, flush, now);
        }
    }

    /// Turn released damage into capture + encode requests.
    ///
    /// With a video region detected, the part of the flush that repaints
    /// it goes to the video encoder first and the rest is planned as
    /// stills around it.
    fn process_flush(&mut self, id: WindowId, flush: Flush, now: Instant) {
        let Self {
            windows,
            config,
            caps,
            capture,
            tracker,
            work,
            common,
            ..
        } = self;
        let Some(window) = windows.get_mut(&id) else {
            return;
        };
        if flush.regions.is_empty() {
            return;
        }
        let quality = flush.options.quality.unwrap_or(window.controller.quality);
        let speed = flush.options.speed.unwrap_or(window.controller.speed);
        let configured = flush.options.encoding.unwrap_or(window.encoding);
        let usable_video =
            configured.is_video() && common.contains(&configured) && !window.video_unavailable.contains(&configured);
        let subregion = window
            .subregion
            .rectangle()
            .filter(|_| usable_video && !flush.options.novideo);
        let mut regions = flush.regions;
        let video_rect = subregion.and_then(|vr| find_in_regions(&vr, &regions));
        if let Some(actual) = video_rect {
            regions = regions.iter().flat_map(|r| r.subtract(&actual)).collect();
        }
        let (still_quality, still_speed) = match subregion {
            Some(_) => window.subregion.boost(quality, speed),
            None => (quality, speed),
        };

        let sel = &config.selector;
        let sustain_since = now
            .checked_sub(Duration::from_millis(sel.video_sustain_ms))
            .unwrap_or(now);
        let thresholds = SelectionThresholds::compute(
            sel,
            still_speed,
            still_quality,
            window.flags,
            window.video.active || subregion.is_some(),
        );
        let input = SelectionInput {
            pixel_count: 0,
            window_width: window.width,
            window_height: window.height,
            speed: still_speed,
            quality: still_quality,
            current_speed: window.controller.speed,
            current_quality: window.controller.quality,
            configured,
            strict: window.strict || flush.options.encoding.is_some(),
            flags: window.flags,
            want_alpha: window.flags.contains(WindowFlags::ALPHA),
            allow_video: !flush.options.novideo && !window.video_unavailable.contains(&configured) && subregion.is_none(),
            allow_mmap: caps.mmap,
            video: VideoContext {
                limits: window.video.limits,
                active: window.video.active,
                recently_resized: window
                    .stats
                    .recently_resized(now, Duration::from_millis(sel.video_resize_ms)),
                recent_pixels: window.stats.damaged_pixels_since(sustain_since),
                sequence: window.sequence,
                region: window.subregion.rectangle(),
            },
            common: common.as_slice(),
        };
        let planned = plan_regions(
            &regions,
            &PackingInput {
                width: window.width,
                height: window.height,
                full_frames_only: window.flags.contains(WindowFlags::FULL_FRAMES_ONLY),
                exclude: video_rect,
            },
            &config.batch,
            |pixel_count| select_encoding(&SelectionInput { pixel_count, ..input }, &thresholds),
            Encoding::is_video,
        );
        trace!(
            window = id,
            regions = regions.len(),
            planned = planned.len(),
            video = ?video_rect,
            waited_ms = flush.waited.as_millis() as u64,
            "flushing damage"
        );
        let mut jobs = Vec::with_capacity(planned.len() + 1);
        if let Some(rect) = video_rect {
            jobs.push(Job {
                rect,
                encoding: configured,
                quality,
                speed,
            });
        }
        jobs.extend(planned.into_iter().map(|p| Job {
            rect: p.rect,
            encoding: p.encoding,
            quality: still_quality,
            speed: still_speed,
        }));

        let hint = window.scaling_hint(now);
        let last = jobs.len().saturating_sub(1);
        for (i, job) in jobs.into_iter().enumerate() {
            let area = job.rect.area();
            let fallback = best_still(
                &SelectionInput { pixel_count: area, ..input },
                &thresholds,
                area,
                job.speed,
                job.quality,
            );
            let image = match capture.get_pixels(id, job.rect) {
                Ok(image) => image.tracked(tracker),
                Err(e) => {
                    // the window went away under us, nothing to retry
                    debug!(window = id, rect = ?job.rect, error = %e, "capture failed, dropping region");
                    continue;
                }
            };
            window.sequence += 1;
            window.items_encoding += 1;
            window.pixels_encoding += area;
            window
                .stats
                .damage_in_latency
                .push_at(now, now.saturating_duration_since(flush.damage_time).as_secs_f64());
            work.push_back(WorkItem::Encode(EncodeItem {
                window: id,
                sequence: window.sequence,
                damage_time: flush.damage_time,
                image,
                encoding: job.encoding,
                fallback,
                window_width: window.width,
                window_height: window.height,
                quality: job.quality,
                speed: job.speed,
                min_quality: window.controller.min_quality,
                min_speed: window.controller.min_speed,
                // packets still to follow in this flush
                flush: (last - i) as u32,
                options: flush.options.clone(),
                hint,
            }));
        }
    }

    fn refresh_window(&mut self, id: WindowId, now: Instant) {
        let Some(window) = self.windows.get_mut(&id) else {
            return;
        };
        // detection starts over from the refreshed frame
        window.subregion.reset(&mut self.timers);
        let rect = window.full_rect();
        let options = window.refresh.options();
        debug!(window = id, "full refresh");
        self.damage_rect(id, rect, &options, now);
    }

    // ── Control ──────────────────────────────────────────────────

    /// Drop pending damage and everything queued for the window.
    ///
    /// Items already being encoded are dropped by the worker, which
    /// checks the watermark before and after encoding.
    pub fn cancel(&mut self, id: WindowId) -> Result<(), EngineError> {
        let window = self.windows.get_mut(&id).ok_or(EngineError::UnknownWindow(id))?;
        window.watermark.raise(window.sequence);
        window.scheduler.cancel(&mut self.timers);
        window.refresh.cancel(&mut self.timers);
        window.subregion.cancel_refresh(&mut self.timers);
        window.video_flush.cancel(&mut self.timers);
        let (dropped, kept): (Vec<WorkItem>, Vec<WorkItem>) = self
            .work
            .drain(..)
            .partition(|item| matches!(item, WorkItem::Encode(e) if e.window == id));
        self.work = kept.into();
        for item in &dropped {
            window.items_encoding = window.items_encoding.saturating_sub(1);
            window.pixels_encoding = window.pixels_encoding.saturating_sub(item.pixels());
        }
        window.stats.cancelled += dropped.len() as u64;
        debug!(window = id, watermark = window.watermark.current(), dropped = dropped.len(), "cancelled");
        Ok(())
    }

    pub fn reconfigure(&mut self, id: WindowId, targets: ReconfigureTargets, now: Instant) -> Result<(), EngineError> {
        self.tick(now);
        let window = self.window_mut(id)?;
        window.controller.reconfigure(&targets);
        match targets.batch_delay_ms {
            Some(0) => window.scheduler.config.unlock(),
            Some(delay) => window.scheduler.config.lock(delay),
            None => {}
        }
        debug!(
            window = id,
            quality = window.controller.quality,
            speed = window.controller.speed,
            delay = window.scheduler.config.delay,
            locked = window.scheduler.config.locked,
            "reconfigured"
        );
        Ok(())
    }

    pub fn suspend(&mut self, id: WindowId) -> Result<(), EngineError> {
        let window = self.windows.get_mut(&id).ok_or(EngineError::UnknownWindow(id))?;
        window.suspended = true;
        window.scheduler.cancel(&mut self.timers);
        window.refresh.cancel(&mut self.timers);
        window.subregion.cancel_refresh(&mut self.timers);
        debug!(window = id, "suspended");
        Ok(())
    }

    /// Resume sending; the whole window is re-sent.
    pub fn resume(&mut self, id: WindowId, now: Instant) -> Result<(), EngineError> {
        let window = self.window_mut(id)?;
        if !window.suspended {
            return Ok(());
        }
        window.suspended = false;
        let rect = window.full_rect();
        debug!(window = id, "resumed");
        self.damage(id, rect, DamageOptions::default(), now)
    }

    /// Select the window's encoding by name; `strict` pins it.
    pub fn set_encoding(&mut self, id: WindowId, name: &str, strict: bool) -> Result<(), EngineError> {
        let parsed: Encoding = name.parse()?;
        let caps_ok = |e: Encoding| self.caps.supports(e);
        let window = self.windows.get(&id).ok_or(EngineError::UnknownWindow(id))?;
        let encoding = if name == "rgb" && window.flags.contains(WindowFlags::ALPHA) {
            Encoding::Rgb32
        } else {
            parsed
        };
        if !caps_ok(encoding) {
            return Err(EngineError::UnknownEncoding(name.to_string()));
        }
        let window = self.window_mut(id)?;
        window.encoding = encoding;
        window.strict = strict;
        info!(window = id, %encoding, strict, "encoding changed");
        Ok(())
    }

    // ── Acks ─────────────────────────────────────────────────────

    /// The client acknowledged packet `sequence`.
    pub fn client_ack(
        &mut self,
        id: WindowId,
        sequence: u64,
        width: u32,
        height: u32,
        result: DecodeResult,
        now: Instant,
    ) -> Result<(), EngineError> {
        self.tick(now);
        let link = self.link_state(now);
        let window = self.windows.get_mut(&id).ok_or(EngineError::UnknownWindow(id))?;
        let Some(ack) = window.stats.pending_acks.remove(&sequence) else {
            trace!(window = id, sequence, "ack for unknown packet");
            return Ok(());
        };
        match result {
            DecodeResult::Decoded(decode_time) => {
                let elapsed = now.saturating_duration_since(ack.sent_at).as_secs_f64();
                let latency = (elapsed - decode_time.as_secs_f64()).max(0.0);
                self.connection.record_client_latency(now, ack.pixels, latency);
                let pixels = width as u64 * height as u64;
                if pixels > 0 && !decode_time.is_zero() {
                    window
                        .stats
                        .decode_speed
                        .push_at(now, pixels as f64 / decode_time.as_secs_f64());
                }
            }
            DecodeResult::Failed => {
                warn!(window = id, sequence, "client failed to decode a packet, resetting delta and video state");
                window.stats.decode_errors += 1;
                window.delta_epoch.bump();
                self.work.push_back(WorkItem::ResetPipeline { window: id });
                let delay = Duration::from_millis(self.config.refresh.decode_error_delay_ms);
                window.decode_refresh.arm(
                    &mut self.timers,
                    now + delay,
                    TimerEvent::Window(id, TimerKind::DecodeErrorRefresh),
                );
            }
        }
        let ctx = window.context(id, now, link, &self.config.batch);
        if let Some(flush) = window.scheduler.on_ack(&ctx, &mut self.timers) {
            self.process_flush(id, flush, now);
        }
        Ok(())
    }

    // ── Completion ───────────────────────────────────────────────

    /// Take the result of an encode back into the capture context.
    pub fn complete(&mut self, outcome: EncodeOutcome, now: Instant) {
        self.tick(now);
        let id = outcome.window;
        let Some(window) = self.windows.get_mut(&id) else {
            trace!(window = id, "completion for a removed window");
            return;
        };
        if outcome.counted {
            window.items_encoding = window.items_encoding.saturating_sub(1);
            window.pixels_encoding = window.pixels_encoding.saturating_sub(outcome.pixels);
        }
        window.video = outcome.video;
        if outcome.cancelled || (outcome.sequence > 0 && window.watermark.is_cancelled(outcome.sequence)) {
            window.stats.cancelled += 1;
            return;
        }
        for sample in outcome.samples {
            window.stats.encodings.push_at(now, sample);
        }

        let batch_delay = window.scheduler.config.delay;
        let mut sent_video = false;
        for mut packet in outcome.packets {
            self.packet_sequence += 1;
            packet.sequence = self.packet_sequence;
            window.av_sync.annotate(packet.encoding, &mut packet.codec_options);
            sent_video |= packet.encoding.is_video();
            let lossless = is_lossless(packet.encoding, &packet.codec_options);
            let sent = SentRegion {
                rect: Rectangle::new(packet.x, packet.y, packet.width, packet.height),
                lossless,
                quality: packet.codec_options.quality.unwrap_or(window.controller.quality),
                speed: window.controller.speed,
            };
            window.track_refresh(id, sent, batch_delay, now, &mut self.timers);
            let bytes = packet.payload.len() as u64;
            window.stats.record_sent(
                packet.sequence,
                PendingAck {
                    damage_time: outcome.damage_time.unwrap_or(now),
                    sent_at: now,
                    pixels: packet.pixel_count(),
                    bytes,
                },
            );
            self.connection.throughput.record_at(now, bytes);
            self.connection.packet_count += 1;
            trace!(
                window = id,
                sequence = packet.sequence,
                encoding = %packet.encoding,
                bytes,
                "packet ready"
            );
            self.packets.push_back(packet);
        }

        let mut refresh = false;
        let mut delayed = false;
        for event in outcome.events {
            match event {
                EncodeEvent::DelayedFrames { delayed: frames, frame } => {
                    delayed = true;
                    window.av_sync.set_delayed_frames(id, frames, now, &mut self.timers);
                    let v = &self.config.video;
                    let wait = (batch_delay * v.flush_multiplier).clamp(v.flush_min_ms, v.flush_max_ms);
                    window.flush_frame = frame;
                    window.video_flush.arm(
                        &mut self.timers,
                        now + Duration::from_millis(wait),
                        TimerEvent::Window(id, TimerKind::VideoFlush),
                    );
                }
                EncodeEvent::RefreshWithoutVideo => refresh = true,
                EncodeEvent::VideoUnavailable { encoding } => {
                    if !window.video_unavailable.contains(&encoding) {
                        warn!(window = id, %encoding, "no video pipeline, using still encodings");
                        window.video_unavailable.push(encoding);
                    }
                }
            }
        }
        if sent_video && !delayed {
            window.video_flush.cancel(&mut self.timers);
        }
        if refresh {
            self.refresh_window(id, now);
        }
        self.schedule_recalculate(now);
    }

    // ── Timers ───────────────────────────────────────────────────

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run every timer due at `now`.
    pub fn fire_timers(&mut self, now: Instant) {
        self.tick(now);
        for (handle, event) in self.timers.pop_due(now) {
            match event {
                TimerEvent::Recalculate => {
                    if self.recalc.fired(handle) {
                        self.recalculate(now);
                    }
                }
                TimerEvent::Window(id, kind) => self.on_window_timer(id, kind, handle, now),
            }
        }
    }

    fn on_window_timer(&mut self, id: WindowId, kind: TimerKind, handle: TimerHandle, now: Instant) {
        let link = self.link_state(now);
        let Some(window) = self.windows.get_mut(&id) else {
            return;
        };
        match kind {
            TimerKind::BatchExpiry | TimerKind::SoftExpiry | TimerKind::HardTimeout | TimerKind::Recheck => {
                let ctx = window.context(id, now, link, &self.config.batch);
                match window.scheduler.on_timer(kind, handle, &ctx, &mut self.timers) {
                    TimerOutcome::Idle => {
                        if window.scheduler.has_pending() && ctx.packets_backlog > 0 {
                            self.connection.record_congestion(now);
                        }
                    }
                    TimerOutcome::Send(flush) => self.process_flush(id, flush, now),
                    TimerOutcome::GiveUp(_) => {
                        window.stats.hard_timeouts += 1;
                        // stale items must not land after the refresh
                        if self.cancel(id).is_ok() {
                            self.refresh_window(id, now);
                        }
                    }
                }
            }
            TimerKind::Refresh => {
                if let Some(regions) = window.refresh.on_timer(id, handle, now, &mut self.timers) {
                    let options = window.refresh.options();
                    for rect in regions.iter() {
                        self.damage_rect(id, *rect, &options, now);
                    }
                }
            }
            TimerKind::SubregionRefresh => {
                if let Some(regions) = window.subregion.on_refresh_timer(id, handle) {
                    let options = window.refresh.options();
                    for rect in regions {
                        self.damage_rect(id, rect, &options, now);
                    }
                }
            }
            TimerKind::AvSyncTick => {
                window.av_sync.on_tick(id, handle, now, &mut self.timers);
            }
            TimerKind::VideoFlush => {
                if window.video_flush.fired(handle) {
                    window.sequence += 1;
                    self.work.push_back(WorkItem::FlushVideo {
                        window: id,
                        sequence: window.sequence,
                        frame: window.flush_frame,
                    });
                }
            }
            TimerKind::DecodeErrorRefresh => {
                if window.decode_refresh.fired(handle) {
                    self.refresh_window(id, now);
                }
            }
        }
    }

    // ── Recalculation ────────────────────────────────────────────

    /// Ask for a recalculation once a window has seen enough new pixels.
    fn schedule_recalculate(&mut self, now: Instant) {
        if self.recalc.is_armed() {
            return;
        }
        let threshold = self.config.controller.min_pixels_recalculate;
        if !self.windows.values().any(|w| w.pixels_since_update >= threshold) {
            return;
        }
        let interval = Duration::from_millis(self.config.controller.recalculate_interval_ms);
        let at = self.last_recalculate.map_or(now, |t| (t + interval).max(now));
        self.recalc.arm(&mut self.timers, at, TimerEvent::Recalculate);
    }

    fn recalculate(&mut self, now: Instant) {
        self.last_recalculate = Some(now);
        let (packets, pixels) = self.windows.values().fold((0, 0), |(n, px), w| {
            let (wn, wpx, _) = w.stats.client_backlog();
            (n + wn, px + wpx)
        });
        self.connection.packet_qsizes.push_at(now, packets as f64);
        self.connection.packet_qpixels.push_at(now, pixels as f64);
        self.connection.work_qsizes.push_at(now, self.work.len() as f64);
        self.connection.update_averages(now);

        let states: Vec<(WindowId, WindowFlags)> = self.windows.iter().map(|(id, w)| (*id, w.flags)).collect();
        let has_stills = self
            .common
            .iter()
            .any(|e| !e.is_video() && !matches!(e, Encoding::Mmap | Encoding::Scroll));
        let settings = &self.config.controller;
        let min_latency = self.connection.min_client_latency.unwrap_or(0.0);
        let avg_latency = self.connection.avg_client_latency;
        let mut updated = 0;
        for (id, window) in self.windows.iter_mut() {
            if window.pixels_since_update < settings.min_pixels_recalculate {
                continue;
            }
            if may_skip_recalculation(&window.scheduler.config, now, window.pixels_since_update, settings) {
                trace!(window = id, "quiet window, keeping delay");
                continue;
            }
            window.stats.update_averages(now);
            window.stats.update_target_latency(min_latency, avg_latency);
            let others = states.iter().filter(|(o, _)| o != id).map(|(_, f)| *f);
            let (mut other_fs, mut other_max) = (false, false);
            for f in others {
                other_fs |= f.contains(WindowFlags::FULLSCREEN);
                other_max |= f.contains(WindowFlags::MAXIMIZED);
            }
            let mut measured = window.stats.factors(now);
            measured.extend(
                self.connection
                    .factors(now, low_limit(self.caps.mmap, window.width, window.height)),
            );
            calculate_batch_delay(
                &mut window.scheduler.config,
                now,
                DelayInputs {
                    has_focus: window.flags.contains(WindowFlags::FOCUSED),
                    transient_class: window.flags.is_transient_class(),
                    other_is_fullscreen: other_fs,
                    other_is_maximized: other_max,
                    soft_expired: window.scheduler.soft_expired,
                    measured,
                },
            );
            window.controller.update(&ControlInputs {
                now,
                width: window.width,
                height: window.height,
                batch: &window.scheduler.config,
                window: &window.stats,
                connection: &self.connection,
                bandwidth_limit: self.caps.bandwidth_limit,
                mmap: self.caps.mmap,
                min_decode_speed: self.caps.decode_mpixels_per_sec.map_or(0.0, |m| m * 1_000_000.0),
            });
            let detect = window.subregion.enabled()
                && window.encoding.is_video()
                && !window.strict
                && !self.caps.mmap
                && !window.flags.contains(WindowFlags::FULL_FRAMES_ONLY)
                && has_stills;
            if detect {
                let history = DamageHistory {
                    width: window.width,
                    height: window.height,
                    events_count: window.stats.damage_events_count,
                    events: &window.stats.damage_events,
                    starting_at: window.stats.last_resized,
                };
                window.subregion.identify(*id, &history, now);
            } else if window.subregion.rectangle().is_some() {
                window.subregion.reset(&mut self.timers);
            }
            window.pixels_since_update = 0;
            window.stats.last_recalculate = Some(now);
            updated += 1;
        }

        let delays = self.windows.values().map(|w| WindowDelay {
            width: w.width,
            height: w.height,
            delay: w.scheduler.config.delay,
            last_updated: w.scheduler.config.last_updated,
        });
        if let Some((delay, dpm)) = baseline_delay(now, delays) {
            self.template.delay = delay.clamp(self.template.min_delay, self.template.max_delay);
            self.template.delay_per_megapixel = Some(dpm);
        }
        debug!(
            updated,
            baseline = self.template.delay,
            per_megapixel = ?self.template.delay_per_megapixel,
            "recalculated batch delays"
        );
    }

    // ── Hand-off ─────────────────────────────────────────────────

    /// Drain the encode queue, oldest first.
    pub fn take_work(&mut self) -> Vec<WorkItem> {
        self.work.drain(..).collect()
    }

    /// Drain the packets ready for the transport, in send order.
    pub fn take_packets(&mut self) -> Vec<DrawPacket> {
        self.packets.drain(..).collect()
    }

    /// Build the encode-context half of a window.
    pub fn create_encoder(&self, id: WindowId, registry: Arc<dyn CodecRegistry>) -> Result<WindowEncoder, EngineError> {
        let window = self.windows.get(&id).ok_or(EngineError::UnknownWindow(id))?;
        Ok(WindowEncoder::new(
            id,
            registry,
            EncoderSettings::new(&self.config, &self.caps),
            window.watermark.clone(),
            window.delta_epoch.clone(),
        ))
    }

    // ── Statistics ───────────────────────────────────────────────

    pub fn statistics(&self) -> Statistics {
        let now = self.clock.unwrap_or_else(Instant::now);
        let windows = self
            .windows
            .iter()
            .map(|(id, w)| {
                let mut snap = w.stats.snapshot(*id, now);
                snap.width = w.width;
                snap.height = w.height;
                snap.encoding = Some(w.encoding);
                snap.batch_delay_ms = w.scheduler.config.delay;
                snap.quality = w.controller.quality;
                snap.speed = w.controller.speed;
                snap.soft_expired = w.scheduler.soft_expired_total;
                snap.hard_timeouts = w.scheduler.hard_timeouts;
                snap.refresh_pending = w.refresh.is_scheduled();
                snap.av_sync_delay_ms = w.av_sync.current();
                snap.suspended = w.suspended;
                snap.video_region = w.subregion.info();
                snap.factors = w.scheduler.config.factors.clone();
                snap
            })
            .collect();
        Statistics {
            damage_events: self.connection.damage_events_count,
            packets_sent: self.connection.packet_count,
            min_client_latency_ms: self.connection.min_client_latency.map(|l| (l * 1000.0) as u64),
            avg_client_latency_ms: (self.connection.avg_client_latency * 1000.0) as u64,
            congestion: self.connection.congestion_value,
            throughput_bps: self.connection.throughput.bytes_per_sec() * 8,
            baseline_delay_per_megapixel: self.template.delay_per_megapixel.unwrap_or(0),
            encode_queue: self.work.len(),
            live_buffers: self.tracker.live(),
            windows,
        }
    }
}

impl Drop for WindowEncodeEngine {
    fn drop(&mut self) {
        for window in self.windows.values_mut() {
            window.cancel_timers(&mut self.timers);
        }
    }
}

impl std::fmt::Debug for WindowEncodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowEncodeEngine")
            .field("windows", &self.windows.len())
            .field("work", &self.work.len())
            .field("packets", &self.packets.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    /// Solid-colour capture; windows listed in `gone` fail.
    struct SolidCapture {
        gone: Vec<WindowId>,
    }

    impl CaptureBackend for SolidCapture {
        fn get_pixels(&mut self, window: WindowId, rect: Rectangle) -> Result<ImageBuffer, CaptureError> {
            if self.gone.contains(&window) {
                return Err(CaptureError::NoSuchWindow(window));
            }
            let data = vec![0x80; rect.area() as usize * 4];
            Ok(ImageBuffer::new(rect, rect.width * 4, PixelFormat::Bgrx, data, Instant::now()))
        }
    }

    fn make_engine(config: EngineConfig) -> WindowEncodeEngine {
        WindowEncodeEngine::new(
            config,
            ClientCapabilities::default(),
            Box::new(SolidCapture { gone: vec![9] }),
        )
    }

    fn immediate() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.batch.start_delay_ms = 5;
        config
    }

    #[test]
    fn rejects_empty_windows() {
        let mut e = make_engine(EngineConfig::default());
        let err = e.add_window(1, 0, 10, WindowFlags::empty(), Instant::now());
        assert!(matches!(err, Err(EngineError::InvalidDimensions { .. })));
        assert!(matches!(
            e.damage(7, Rectangle::sized(1, 1), DamageOptions::default(), Instant::now()),
            Err(EngineError::UnknownWindow(7))
        ));
    }

    #[test]
    fn default_encoding_is_first_supported() {
        let mut e = make_engine(EngineConfig::default());
        e.add_window(1, 100, 100, WindowFlags::empty(), Instant::now()).unwrap();
        let stats = e.statistics();
        assert_eq!(stats.window(1).unwrap().encoding, Some(Encoding::H264));
    }

    #[test]
    fn set_encoding_checks_client_support() {
        let mut e = make_engine(EngineConfig::default());
        e.add_window(1, 100, 100, WindowFlags::ALPHA, Instant::now()).unwrap();
        e.set_encoding(1, "rgb", false).unwrap();
        assert_eq!(e.statistics().window(1).unwrap().encoding, Some(Encoding::Rgb32));
        assert!(matches!(e.set_encoding(1, "h265", true), Err(EngineError::UnknownEncoding(_))));
        assert!(e.set_encoding(1, "gif", true).is_err());
    }

    #[test]
    fn capture_failure_drops_region() {
        let mut e = make_engine(immediate());
        let now = Instant::now();
        e.add_window(9, 64, 64, WindowFlags::empty(), now).unwrap();
        e.damage(9, Rectangle::sized(64, 64), DamageOptions::default(), now).unwrap();
        assert!(e.take_work().is_empty());
        assert_eq!(e.buffers().live(), 0);
    }

    #[test]
    fn cancel_releases_queued_buffers() {
        let mut e = make_engine(immediate());
        let now = Instant::now();
        e.add_window(1, 64, 64, WindowFlags::empty(), now).unwrap();
        e.damage(1, Rectangle::sized(64, 64), DamageOptions::default(), now).unwrap();
        assert_eq!(e.buffers().live(), 1);
        e.cancel(1).unwrap();
        assert_eq!(e.buffers().live(), 0);
        assert!(e.take_work().is_empty());
    }

    #[test]
    fn hard_timeout_drops_stale_work_before_refreshing() {
        let mut e = make_engine(immediate());
        let t0 = Instant::now();
        e.add_window(1, 64, 64, WindowFlags::empty(), t0).unwrap();
        e.damage(1, Rectangle::sized(64, 64), DamageOptions::default(), t0).unwrap();
        assert_eq!(e.buffers().live(), 1);

        // a packet the client never acks, and no soft expiries left
        let window = e.windows.get_mut(&1).unwrap();
        window.stats.record_sent(
            99,
            PendingAck {
                damage_time: t0,
                sent_at: t0,
                pixels: 64 * 64,
                bytes: 100,
            },
        );
        window.scheduler.soft_expired = e.config.batch.max_soft_expired;

        let t1 = t0 + Duration::from_secs(1);
        e.damage(1, Rectangle::new(0, 0, 8, 8), DamageOptions::default(), t1).unwrap();
        while e.windows[&1].stats.hard_timeouts == 0 {
            let at = e.next_deadline().expect("batch timer armed");
            assert!(at < t1 + Duration::from_secs(60));
            e.fire_timers(at);
        }

        assert_eq!(e.buffers().live(), 0);
        let stale = e
            .take_work()
            .into_iter()
            .any(|item| matches!(item, WorkItem::Encode(ref i) if i.sequence == 1));
        assert!(!stale);
        assert!(e.windows[&1].scheduler.has_pending(), "the full refresh waits for the backlog");
    }

    const PLAYER: Rectangle = Rectangle::new(200, 150, 320, 240);

    /// A 1280x720 window whose damage history shows a playing video.
    fn playing_video(e: &mut WindowEncodeEngine) -> Instant {
        let mut now = Instant::now();
        e.add_window(1, 1280, 720, WindowFlags::empty(), now).unwrap();
        for _ in 0..30 {
            now += Duration::from_millis(40);
            e.damage(1, PLAYER, DamageOptions::default(), now).unwrap();
            e.fire_timers(now);
        }
        e.recalculate(now);
        // start from an idle window
        e.cancel(1).unwrap();
        now
    }

    #[test]
    fn detected_video_region_goes_to_the_video_encoder() {
        let mut e = make_engine(immediate());
        let now = playing_video(&mut e);
        let region = e.statistics().window(1).unwrap().video_region;
        assert_eq!(region.map(|r| r.rectangle), Some(PLAYER));

        let clock = Rectangle::new(900, 600, 50, 20);
        e.damage(1, PLAYER, DamageOptions::default(), now).unwrap();
        e.damage(1, clock, DamageOptions::default(), now).unwrap();
        assert!(e.take_work().is_empty(), "video regions always batch");
        let at = e.next_deadline().expect("batch timer armed");
        e.fire_timers(at);

        let items: Vec<EncodeItem> = e
            .take_work()
            .into_iter()
            .filter_map(|w| match w {
                WorkItem::Encode(item) => Some(item),
                _ => None,
            })
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].image.rect(), PLAYER);
        assert_eq!(items[0].encoding, Encoding::H264);
        assert_eq!(items[1].image.rect(), clock);
        assert!(!items[1].encoding.is_video());
        assert!(items[1].quality >= items[0].quality);
        assert_eq!((items[0].flush, items[1].flush), (1, 0));
    }

    #[test]
    fn video_region_refresh_bypasses_the_refresh_scheduler() {
        let mut e = make_engine(immediate());
        let now = playing_video(&mut e);
        let window = e.windows.get_mut(&1).unwrap();
        let lossy = SentRegion {
            rect: Rectangle::new(150, 150, 400, 100),
            lossless: false,
            quality: 50,
            speed: 50,
        };
        window.track_refresh(1, lossy, 10, now, &mut e.timers);

        let inside = Rectangle::new(200, 150, 320, 100);
        assert!(!window.refresh.pending().intersects(&inside));
        assert_eq!(window.refresh.pending().pixel_count(), 50 * 100 + 30 * 100);
        assert_eq!(window.subregion.refresh_pending().pixel_count(), inside.area());

        // the region's own timer fires first and re-damages it
        let at = e.next_deadline().expect("refresh timers armed");
        assert_eq!(at, now + Duration::from_millis(150));
        e.fire_timers(at);
        let pending = e.windows[&1].scheduler.pending_regions();
        assert!(pending.is_some_and(|r| r.covers(&inside)));
        assert!(e.windows[&1].refresh.is_scheduled());
    }

    #[test]
    fn lossless_video_frame_clears_the_region_refresh() {
        let mut e = make_engine(immediate());
        let now = playing_video(&mut e);
        let window = e.windows.get_mut(&1).unwrap();
        let sent = |lossless| SentRegion {
            rect: PLAYER,
            lossless,
            quality: 50,
            speed: 50,
        };
        window.track_refresh(1, sent(false), 10, now, &mut e.timers);
        assert!(!window.subregion.refresh_pending().is_empty());
        assert!(window.refresh.pending().is_empty());
        window.track_refresh(1, sent(true), 10, now, &mut e.timers);
        assert!(window.subregion.refresh_pending().is_empty());
    }

    #[test]
    fn suspended_windows_send_on_resume() {
        let mut e = make_engine(immediate());
        let now = Instant::now();
        e.add_window(1, 64, 64, WindowFlags::empty(), now).unwrap();
        e.suspend(1).unwrap();
        e.damage(1, Rectangle::new(0, 0, 8, 8), DamageOptions::default(), now).unwrap();
        assert!(e.take_work().is_empty());
        assert!(e.statistics().window(1).unwrap().suspended);
        e.resume(1, now).unwrap();
        let work = e.take_work();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].pixels(), 64 * 64);
    }

    #[test]
    fn lock_pins_the_batch_delay() {
        let mut e = make_engine(EngineConfig::default());
        let now = Instant::now();
        e.add_window(1, 640, 480, WindowFlags::empty(), now).unwrap();
        let targets = ReconfigureTargets {
            batch_delay_ms: Some(120),
            ..Default::default()
        };
        e.reconfigure(1, targets, now).unwrap();
        assert_eq!(e.statistics().window(1).unwrap().batch_delay_ms, 120);
        let unlock = ReconfigureTargets {
            batch_delay_ms: Some(0),
            ..Default::default()
        };
        e.reconfigure(1, unlock, now).unwrap();
        assert_eq!(e.statistics().window(1).unwrap().batch_delay_ms, 50);
    }

    #[test]
    fn remove_window_cancels_timers() {
        let mut e = make_engine(EngineConfig::default());
        let now = Instant::now();
        e.add_window(1, 640, 480, WindowFlags::empty(), now).unwrap();
        e.damage(1, Rectangle::new(0, 0, 10, 10), DamageOptions::default(), now).unwrap();
        assert!(e.next_deadline().is_some());
        e.remove_window(1).unwrap();
        assert!(e.next_deadline().is_none());
        let work = e.take_work();
        assert!(matches!(work.as_slice(), [WorkItem::Close { window: 1 }]));
    }
}
