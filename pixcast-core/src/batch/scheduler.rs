//! Damage batching.
//!
//! Damage that arrives while a batch is pending is folded into it.
//! Otherwise the damage is either sent straight away (when the link is
//! idle and the delay is at its minimum) or opens a new batch that
//! expires after the current delay. An expired batch still waits while
//! the client lags behind on acks: it re-checks on every ack, escalates
//! through a bounded number of soft timeouts and finally gives up on a
//! hard timeout.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::batch::config::BatchConfig;
use crate::config::BatchSettings;
use crate::encoding::Encoding;
use crate::region::{Rectangle, RegionSet};
use crate::timer::{TimerEvent, TimerHandle, TimerKind, TimerSlot, Timers};
use crate::types::WindowId;

// ── DamageOptions ────────────────────────────────────────────────

/// Per-request overrides carried along with damage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DamageOptions {
    pub delay: Option<u64>,
    pub min_delay: Option<u64>,
    pub max_delay: Option<u64>,
    pub encoding: Option<Encoding>,
    pub quality: Option<u8>,
    pub speed: Option<u8>,
    /// Issued by the lossless refresh rather than by the application.
    pub auto_refresh: bool,
    /// Never use a video encoding for this damage.
    pub novideo: bool,
    /// Replace the options of a pending batch instead of merging.
    pub override_options: bool,
}

impl DamageOptions {
    /// Fold `other` into `self`.
    ///
    /// Without `override_options` only fields not already set are taken.
    pub fn merge(&mut self, other: &DamageOptions) {
        let force = other.override_options;
        fn pick<T: Copy>(slot: &mut Option<T>, value: Option<T>, force: bool) {
            if value.is_some() && (force || slot.is_none()) {
                *slot = value;
            }
        }
        pick(&mut self.delay, other.delay, force);
        pick(&mut self.min_delay, other.min_delay, force);
        pick(&mut self.max_delay, other.max_delay, force);
        pick(&mut self.encoding, other.encoding, force);
        pick(&mut self.quality, other.quality, force);
        pick(&mut self.speed, other.speed, force);
        if force {
            self.auto_refresh = other.auto_refresh;
            self.novideo = other.novideo;
        } else {
            self.auto_refresh |= other.auto_refresh;
            self.novideo |= other.novideo;
        }
    }
}

// ── SchedulerContext ─────────────────────────────────────────────

/// Snapshot of the window and link state the scheduler decides on.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerContext {
    pub now: Instant,
    pub window: WindowId,
    pub width: u32,
    pub height: u32,
    /// Packets the client should have acked by now.
    pub packets_backlog: usize,
    /// Packets sent and not yet acked.
    pub acks_pending: usize,
    /// Pixels queued or being encoded for this window.
    pub pixels_encoding: u64,
    /// Regions queued or being encoded for this window.
    pub items_encoding: usize,
    pub recently_resized: bool,
    /// Items in the connection-wide encode queue.
    pub queue_size: usize,
    /// Damage events and pixels across all windows in the last time unit.
    pub recent_events: usize,
    pub recent_pixels: u64,
    pub bandwidth_limited: bool,
    /// A video region is being tracked; its frames always batch.
    pub video_region: bool,
}

impl SchedulerContext {
    fn window_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

// ── Flush ────────────────────────────────────────────────────────

/// Damage released by the scheduler for encoding.
#[derive(Debug, Clone)]
pub struct Flush {
    /// When the first damage of the batch arrived.
    pub damage_time: Instant,
    pub regions: RegionSet,
    pub options: DamageOptions,
    pub waited: Duration,
}

/// What a scheduler timer asked for.
#[derive(Debug)]
pub enum TimerOutcome {
    Idle,
    Send(Flush),
    /// A batch was stuck behind missing acks; it has been dropped and
    /// the whole window should be refreshed.
    GiveUp(DamageOptions),
}

#[derive(Debug)]
struct PendingBatch {
    start: Instant,
    regions: RegionSet,
    options: DamageOptions,
}

// ── BatchScheduler ───────────────────────────────────────────────

/// Batching state machine of one window.
#[derive(Debug)]
pub struct BatchScheduler {
    pub config: BatchConfig,
    settings: BatchSettings,
    pending: Option<PendingBatch>,
    expired: bool,
    /// Soft timeouts used by the current batch.
    pub soft_expired: u32,
    /// Soft timeouts used since the window was created.
    pub soft_expired_total: u64,
    pub hard_timeouts: u64,
    expiry: TimerSlot,
    soft: TimerSlot,
    hard: TimerSlot,
    recheck: TimerSlot,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig, settings: &BatchSettings) -> Self {
        Self {
            config,
            settings: settings.clone(),
            pending: None,
            expired: false,
            soft_expired: 0,
            soft_expired_total: 0,
            hard_timeouts: 0,
            expiry: TimerSlot::default(),
            soft: TimerSlot::default(),
            hard: TimerSlot::default(),
            recheck: TimerSlot::default(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_regions(&self) -> Option<&RegionSet> {
        self.pending.as_ref().map(|p| &p.regions)
    }

    /// Whether damage with this delay has to be batched.
    pub fn must_batch(&self, delay: u64, ctx: &SchedulerContext) -> bool {
        if self.settings.force_batch
            || self.config.always
            || delay > self.config.min_delay
            || ctx.bandwidth_limited
            || ctx.video_region
        {
            return true;
        }
        // a burst of damage in a very short time also triggers batching
        let n = self.settings.force_batch_events;
        let len = self.config.last_delays.len();
        if n == 0 || len < n {
            return false;
        }
        self.config
            .last_delays
            .iter()
            .nth(len - n)
            .is_some_and(|(t, _)| {
                ctx.now.saturating_duration_since(*t)
                    < Duration::from_millis(self.settings.force_batch_window_ms)
            })
    }

    /// Effective delay for new damage.
    fn effective_delay(&mut self, ctx: &SchedulerContext, opts: &DamageOptions) -> u64 {
        let cfg = &mut self.config;
        if !cfg.locked && !cfg.always && cfg.delay <= cfg.min_delay {
            // too many events or pixels lately: force batching on
            let eratio = ctx.recent_events as f64 / cfg.max_events.max(1) as f64;
            let pratio = ctx.recent_pixels as f64 / cfg.max_pixels.max(1) as f64;
            if eratio > 1.0 || pratio > 1.0 {
                cfg.delay = ((cfg.min_delay as f64 * eratio.max(pratio)) as u64).min(cfg.max_delay);
                debug!(window = ctx.window, delay = cfg.delay, eratio, pratio, "forcing batching on");
            }
        }
        let mut delay = opts.delay.unwrap_or(cfg.delay) as f64;
        if ctx.recently_resized {
            delay = (delay + 25.0).max(50.0);
        }
        if ctx.queue_size > 4 {
            // the encode queue is growing, slow down progressively
            delay = (cfg.min_delay as f64).min(delay).max(10.0) * (ctx.queue_size as f64 / 4.0);
        }
        delay = delay.max(opts.min_delay.unwrap_or(0) as f64);
        delay = delay.min(opts.max_delay.unwrap_or(cfg.max_delay).min(cfg.max_delay) as f64);
        delay as u64
    }

    /// Handle a damage request.
    ///
    /// Returns a [`Flush`] when the damage should be encoded right away;
    /// otherwise it was folded into a (possibly new) pending batch.
    pub fn damage(
        &mut self,
        ctx: &SchedulerContext,
        rect: Rectangle,
        opts: &DamageOptions,
        timers: &mut Timers,
    ) -> Option<Flush> {
        if let Some(pending) = self.pending.as_mut() {
            pending.regions.add(rect);
            pending.options.merge(opts);
            trace!(
                window = ctx.window,
                regions = pending.regions.len(),
                "damage folded into pending batch"
            );
            return None;
        }

        let delay = self.effective_delay(ctx, opts);
        let idle = ctx.packets_backlog == 0
            && ctx.pixels_encoding <= ctx.window_pixels()
            && ctx.items_encoding <= self.settings.max_pending_encodes;
        if !self.must_batch(delay, ctx) && idle {
            trace!(window = ctx.window, ?rect, "sending damage now");
            self.config.last_delays.push_at(ctx.now, delay);
            self.config.last_actual_delays.push_at(ctx.now, delay);
            return Some(Flush {
                damage_time: ctx.now,
                regions: RegionSet::from_rect(rect),
                options: opts.clone(),
                waited: Duration::ZERO,
            });
        }

        self.expired = false;
        self.pending = Some(PendingBatch {
            start: ctx.now,
            regions: RegionSet::from_rect(rect),
            options: opts.clone(),
        });
        self.config.last_delays.push_at(ctx.now, delay);
        trace!(window = ctx.window, delay, "batch scheduled");
        self.expiry.arm(
            timers,
            ctx.now + Duration::from_millis(delay),
            TimerEvent::Window(ctx.window, TimerKind::BatchExpiry),
        );
        None
    }

    /// Dispatch a fired scheduler timer.
    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        handle: TimerHandle,
        ctx: &SchedulerContext,
        timers: &mut Timers,
    ) -> TimerOutcome {
        match kind {
            TimerKind::BatchExpiry if self.expiry.fired(handle) => self.on_expired(ctx, timers),
            TimerKind::SoftExpiry if self.soft.fired(handle) => match self.take(ctx.now, timers) {
                Some(flush) => TimerOutcome::Send(flush),
                None => TimerOutcome::Idle,
            },
            TimerKind::HardTimeout if self.hard.fired(handle) => self.on_hard_timeout(ctx, timers),
            TimerKind::Recheck if self.recheck.fired(handle) => match self.may_send_delayed(ctx, timers) {
                Some(flush) => TimerOutcome::Send(flush),
                None => TimerOutcome::Idle,
            },
            _ => TimerOutcome::Idle,
        }
    }

    fn on_expired(&mut self, ctx: &SchedulerContext, timers: &mut Timers) -> TimerOutcome {
        self.expired = true;
        if let Some(flush) = self.may_send_delayed(ctx, timers) {
            return TimerOutcome::Send(flush);
        }
        if self.pending.is_none() {
            return TimerOutcome::Idle;
        }
        // still waiting for acks
        if self.soft_expired < self.settings.max_soft_expired {
            self.soft_expired += 1;
            self.soft_expired_total += 1;
            let wait = self.config.delay.max(1) * self.soft_expired as u64;
            self.soft.arm(
                timers,
                ctx.now + Duration::from_millis(wait),
                TimerEvent::Window(ctx.window, TimerKind::SoftExpiry),
            );
        } else {
            self.hard.arm(
                timers,
                ctx.now + self.config.timeout_delay,
                TimerEvent::Window(ctx.window, TimerKind::HardTimeout),
            );
        }
        TimerOutcome::Idle
    }

    fn on_hard_timeout(&mut self, ctx: &SchedulerContext, timers: &mut Timers) -> TimerOutcome {
        let Some(pending) = self.pending.take() else {
            return TimerOutcome::Idle;
        };
        warn!(
            window = ctx.window,
            age_ms = ctx.now.saturating_duration_since(pending.start).as_millis() as u64,
            "pending batch timed out, refreshing window"
        );
        self.hard_timeouts += 1;
        self.cancel_timers(timers);
        TimerOutcome::GiveUp(pending.options)
    }

    /// Release the pending batch if the link allows it.
    pub fn may_send_delayed(&mut self, ctx: &SchedulerContext, timers: &mut Timers) -> Option<Flush> {
        let start = self.pending.as_ref()?.start;
        let actual = ctx.now.saturating_duration_since(start).as_millis() as u64;
        if ctx.packets_backlog > 0 {
            // retried from the ack path
            trace!(window = ctx.window, backlog = ctx.packets_backlog, actual, "delaying again");
            return None;
        }
        if self.config.locked {
            if self.config.delay > actual {
                self.arm_recheck(ctx, timers, self.config.delay - actual);
                return None;
            }
            return self.take(ctx.now, timers);
        }
        if ctx.pixels_encoding >= ctx.window_pixels()
            || ctx.items_encoding > self.settings.max_pending_encodes
        {
            trace!(
                window = ctx.window,
                pixels = ctx.pixels_encoding,
                items = ctx.items_encoding,
                "encode backlog, delaying again"
            );
            if ctx.acks_pending == 0 {
                let wait = (actual / 10).clamp(10, self.config.max_delay.max(10));
                self.arm_recheck(ctx, timers, wait);
            }
            return None;
        }
        self.soft_expired = 0;
        self.take(ctx.now, timers)
    }

    /// An ack arrived for this window.
    pub fn on_ack(&mut self, ctx: &SchedulerContext, timers: &mut Timers) -> Option<Flush> {
        if self.pending.is_none() {
            self.soft_expired = 0;
            return None;
        }
        if self.expired {
            return self.may_send_delayed(ctx, timers);
        }
        None
    }

    fn arm_recheck(&mut self, ctx: &SchedulerContext, timers: &mut Timers, wait_ms: u64) {
        self.recheck.arm(
            timers,
            ctx.now + Duration::from_millis(wait_ms),
            TimerEvent::Window(ctx.window, TimerKind::Recheck),
        );
    }

    /// Hand over the pending batch unconditionally.
    pub fn take(&mut self, now: Instant, timers: &mut Timers) -> Option<Flush> {
        self.soft.cancel(timers);
        self.hard.cancel(timers);
        self.recheck.cancel(timers);
        self.expiry.cancel(timers);
        let pending = self.pending.take()?;
        let waited = now.saturating_duration_since(pending.start);
        self.config.record_actual_delay(now, waited);
        Some(Flush {
            damage_time: pending.start,
            regions: pending.regions,
            options: pending.options,
            waited,
        })
    }

    fn cancel_timers(&mut self, timers: &mut Timers) {
        self.expiry.cancel(timers);
        self.soft.cancel(timers);
        self.hard.cancel(timers);
        self.recheck.cancel(timers);
    }

    /// Drop the pending batch and every timer.
    pub fn cancel(&mut self, timers: &mut Timers) {
        self.cancel_timers(timers);
        self.pending = None;
        self.expired = false;
        self.soft_expired = 0;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> BatchScheduler {
        let settings = BatchSettings::default();
        let cfg = BatchConfig::template(&settings).for_window(800, 600);
        BatchScheduler::new(cfg, &settings)
    }

    fn ctx(now: Instant) -> SchedulerContext {
        SchedulerContext {
            now,
            window: 1,
            width: 800,
            height: 600,
            packets_backlog: 0,
            acks_pending: 0,
            pixels_encoding: 0,
            items_encoding: 0,
            recently_resized: false,
            queue_size: 0,
            recent_events: 0,
            recent_pixels: 0,
            bandwidth_limited: false,
            video_region: false,
        }
    }

    fn fire(s: &mut BatchScheduler, timers: &mut Timers, c: &SchedulerContext) -> Vec<TimerOutcome> {
        timers
            .pop_due(c.now)
            .into_iter()
            .filter_map(|(h, ev)| match ev {
                TimerEvent::Window(_, kind) => Some(s.on_timer(kind, h, c, timers)),
                TimerEvent::Recalculate => None,
            })
            .collect()
    }

    #[test]
    fn merge_keeps_existing_unless_override() {
        let mut a = DamageOptions {
            quality: Some(50),
            ..Default::default()
        };
        a.merge(&DamageOptions {
            quality: Some(90),
            speed: Some(10),
            ..Default::default()
        });
        assert_eq!((a.quality, a.speed), (Some(50), Some(10)));
        a.merge(&DamageOptions {
            quality: Some(90),
            override_options: true,
            ..Default::default()
        });
        assert_eq!(a.quality, Some(90));
    }

    #[test]
    fn idle_link_at_min_delay_sends_now() {
        let mut s = scheduler();
        s.config.delay = s.config.min_delay;
        let mut timers = Timers::new();
        let now = Instant::now();
        let flush = s.damage(&ctx(now), Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers);
        assert!(flush.is_some());
        assert!(timers.is_empty());
    }

    #[test]
    fn video_region_always_batches() {
        let mut s = scheduler();
        s.config.delay = s.config.min_delay;
        let mut c = ctx(Instant::now());
        c.video_region = true;
        let mut timers = Timers::new();
        assert!(s.damage(&c, Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers).is_none());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn default_delay_batches_and_expires() {
        let mut s = scheduler();
        let mut timers = Timers::new();
        let t0 = Instant::now();
        let c = ctx(t0);
        assert!(s.damage(&c, Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers).is_none());
        assert!(s.damage(&c, Rectangle::new(100, 100, 10, 10), &DamageOptions::default(), &mut timers).is_none());
        assert_eq!(s.pending_regions().map(RegionSet::len), Some(2));

        let later = ctx(t0 + Duration::from_millis(50));
        let out = fire(&mut s, &mut timers, &later);
        assert!(matches!(out.as_slice(), [TimerOutcome::Send(f)] if f.regions.len() == 2));
        assert!(!s.has_pending());
        assert_eq!(s.config.last_actual_delays.last().map(|(_, d)| *d), Some(50));
    }

    #[test]
    fn backlog_waits_for_ack() {
        let mut s = scheduler();
        let mut timers = Timers::new();
        let t0 = Instant::now();
        s.damage(&ctx(t0), Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers);

        let mut lagging = ctx(t0 + Duration::from_millis(50));
        lagging.packets_backlog = 2;
        lagging.acks_pending = 2;
        let out = fire(&mut s, &mut timers, &lagging);
        assert!(matches!(out.as_slice(), [TimerOutcome::Idle]));
        assert!(s.has_pending());
        assert_eq!(s.soft_expired, 1);

        let mut acked = ctx(t0 + Duration::from_millis(60));
        acked.acks_pending = 1;
        assert!(s.on_ack(&acked, &mut timers).is_some());
        assert_eq!(s.soft_expired, 0);
    }

    #[test]
    fn soft_expiry_escalates_to_hard_timeout() {
        let mut s = scheduler();
        let mut timers = Timers::new();
        let t0 = Instant::now();
        s.damage(&ctx(t0), Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers);
        s.soft_expired = s.settings.max_soft_expired;

        let mut lagging = ctx(t0 + Duration::from_millis(50));
        lagging.packets_backlog = 1;
        fire(&mut s, &mut timers, &lagging);
        assert!(s.hard.is_armed());

        let mut much_later = lagging;
        much_later.now = t0 + Duration::from_secs(16);
        let out = fire(&mut s, &mut timers, &much_later);
        assert!(matches!(out.as_slice(), [TimerOutcome::GiveUp(_)]));
        assert!(!s.has_pending());
        assert_eq!(s.hard_timeouts, 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn soft_expiry_sends_unconditionally() {
        let mut s = scheduler();
        let mut timers = Timers::new();
        let t0 = Instant::now();
        s.damage(&ctx(t0), Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers);
        let mut lagging = ctx(t0 + Duration::from_millis(50));
        lagging.packets_backlog = 1;
        fire(&mut s, &mut timers, &lagging);
        lagging.now = t0 + Duration::from_millis(100);
        let out = fire(&mut s, &mut timers, &lagging);
        assert!(matches!(out.as_slice(), [TimerOutcome::Send(_)]));
    }

    #[test]
    fn encode_backlog_rechecks() {
        let mut s = scheduler();
        let mut timers = Timers::new();
        let t0 = Instant::now();
        s.damage(&ctx(t0), Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers);
        let mut busy = ctx(t0 + Duration::from_millis(50));
        busy.pixels_encoding = 800 * 600;
        fire(&mut s, &mut timers, &busy);
        assert!(s.recheck.is_armed());
        let free = ctx(t0 + Duration::from_millis(70));
        let out = fire(&mut s, &mut timers, &free);
        assert!(out.iter().any(|o| matches!(o, TimerOutcome::Send(_))));
    }

    #[test]
    fn locked_delay_is_honoured() {
        let mut s = scheduler();
        s.config.lock(200);
        let mut timers = Timers::new();
        let t0 = Instant::now();
        s.damage(&ctx(t0), Rectangle::new(0, 0, 10, 10), &DamageOptions::default(), &mut timers);
        assert_eq!(s.expiry.deadline(), Some(t0 + Duration::from_millis(200)));
        // an early ack must not release the batch
        s.expired = true;
        assert!(s.on_ack(&ctx(t0 + Duration::from_millis(20)), &mut timers).is_none());
        assert!(s.recheck.is_armed());
    }

    #[test]
    fn burst_forces_batching() {
        let mut s = scheduler();
        s.config.delay = s.config.min_delay;
        let mut c = ctx(Instant::now());
        c.recent_events = 100;
        let mut timers = Timers::new();
        assert!(s.damage(&c, Rectangle::new(0, 0, 5, 5), &DamageOptions::default(), &mut timers).is_none());
        assert_eq!(s.config.delay, 10);
    }

    #[test]
    fn resize_and_queue_raise_delay() {
        let mut s = scheduler();
        let mut timers = Timers::new();
        let t0 = Instant::now();
        let mut c = ctx(t0);
        c.recently_resized = true;
        s.damage(&c, Rectangle::new(0, 0, 5, 5), &DamageOptions::default(), &mut timers);
        assert_eq!(s.expiry.deadline(), Some(t0 + Duration::from_millis(75)));
        s.cancel(&mut timers);

        c.recently_resized = false;
        c.queue_size = 8;
        s.damage(&c, Rectangle::new(0, 0, 5, 5), &DamageOptions::default(), &mut timers);
        assert_eq!(s.expiry.deadline(), Some(t0 + Duration::from_millis(20)));
    }

    #[test]
    fn cancel_clears_everything() {
        let mut s = scheduler();
        let mut timers = Timers::new();
        s.damage(&ctx(Instant::now()), Rectangle::new(0, 0, 5, 5), &DamageOptions::default(), &mut timers);
        s.cancel(&mut timers);
        assert!(!s.has_pending());
        assert!(timers.is_empty());
    }
}
