//! Lossless refresh of regions that went out lossy.
//!
//! Every lossy packet adds its rectangle to the pending refresh region
//! and pushes the refresh deadline out; every lossless packet removes
//! its rectangle again. When the deadline passes the remaining region
//! is re-sent at full quality.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::batch::DamageOptions;
use crate::config::RefreshSettings;
use crate::encoding::Encoding;
use crate::packet::CodecOptions;
use crate::region::{Rectangle, RegionSet};
use crate::timer::{TimerEvent, TimerHandle, TimerKind, TimerSlot, Timers};
use crate::types::{PixelFormat, WindowId};

/// Colour subsampling modes that lose information.
const LOSSY_CSC: [PixelFormat; 3] = [PixelFormat::Yuv420p, PixelFormat::Yuv422p, PixelFormat::Nv12];

/// Whether a packet with these options left the client with exact pixels.
pub fn is_lossless(encoding: Encoding, options: &CodecOptions) -> bool {
    if options.refresh {
        return true;
    }
    if options.scaled_size.is_some() || options.csc.is_some_and(|c| LOSSY_CSC.contains(&c)) {
        return false;
    }
    let quality = match options.quality {
        Some(q) => q,
        None if encoding.is_lossless() => 100,
        None => 0,
    };
    quality >= 100
}

/// What the refresh logic needs to know about a sent packet.
#[derive(Debug, Clone, Copy)]
pub struct SentRegion {
    pub rect: Rectangle,
    pub lossless: bool,
    pub quality: u8,
    pub speed: u8,
}

// ── RefreshScheduler ─────────────────────────────────────────────

#[derive(Debug)]
pub struct RefreshScheduler {
    settings: RefreshSettings,
    pending: RegionSet,
    target: Option<Instant>,
    timer: TimerSlot,
}

impl RefreshScheduler {
    pub fn new(settings: &RefreshSettings) -> Self {
        Self {
            settings: settings.clone(),
            pending: RegionSet::new(),
            target: None,
            timer: TimerSlot::default(),
        }
    }

    pub fn pending(&self) -> &RegionSet {
        &self.pending
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.is_armed()
    }

    /// Options for damage issued by the refresh timer.
    pub fn options(&self) -> DamageOptions {
        DamageOptions {
            quality: Some(self.settings.quality),
            speed: Some(self.settings.speed),
            auto_refresh: true,
            novideo: true,
            override_options: true,
            ..Default::default()
        }
    }

    /// Account for a packet that was just sent.
    pub fn on_sent(
        &mut self,
        window: WindowId,
        sent: SentRegion,
        window_area: u64,
        batch_delay_ms: u64,
        now: Instant,
        timers: &mut Timers,
    ) {
        if !self.settings.enabled {
            return;
        }
        if sent.lossless {
            if self.pending.intersects(&sent.rect) {
                self.pending.subtract(&sent.rect);
                trace!(window, rect = ?sent.rect, left = self.pending.len(), "refresh region covered");
                if self.pending.is_empty() {
                    self.cancel(timers);
                }
            }
            return;
        }
        self.pending.add(sent.rect);
        let pct = (100 * self.pending.pixel_count() / window_area.max(1)).min(100);
        // higher quality and higher speed refresh sooner
        let qsmult = (200 - sent.quality.min(100) as u64) * (200 - sent.speed.min(100) as u64);
        let delay = self.settings.delay_ms;
        let min_delay = self.settings.min_delay_ms;
        let base = if self.timer.is_armed() {
            min_delay.max(delay * pct / 50).max(batch_delay_ms * 2)
        } else {
            min_delay.max(delay * pct.max(50) / 50).max(batch_delay_ms * 4)
        };
        let sched = base * qsmult / 20_000;
        let deadline = now + Duration::from_millis(sched);
        let target = match self.target {
            Some(t) if self.timer.is_armed() => t.max(deadline),
            _ => deadline,
        };
        self.target = Some(target);
        if !self.timer.is_armed() {
            debug!(window, sched, pct, "refresh scheduled");
            self.timer
                .arm(timers, target, TimerEvent::Window(window, TimerKind::Refresh));
        }
    }

    /// The refresh timer fired; returns the region to re-send, if due.
    pub fn on_timer(
        &mut self,
        window: WindowId,
        handle: TimerHandle,
        now: Instant,
        timers: &mut Timers,
    ) -> Option<RegionSet> {
        if !self.timer.fired(handle) {
            return None;
        }
        let target = self.target.unwrap_or(now);
        let slack = Duration::from_millis(self.settings.fire_slack_ms);
        if target.saturating_duration_since(now) >= slack {
            // pushed back by later lossy packets
            self.timer
                .arm(timers, target, TimerEvent::Window(window, TimerKind::Refresh));
            return None;
        }
        self.target = None;
        if self.pending.is_empty() {
            return None;
        }
        debug!(window, regions = self.pending.len(), "refreshing lossy regions");
        Some(std::mem::take(&mut self.pending))
    }

    pub fn cancel(&mut self, timers: &mut Timers) {
        self.timer.cancel(timers);
        self.target = None;
        self.pending.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const AREA: u64 = 1000 * 1000;

    fn lossy(rect: Rectangle) -> SentRegion {
        SentRegion {
            rect,
            lossless: false,
            quality: 50,
            speed: 50,
        }
    }

    #[test]
    fn lossless_detection() {
        let jpeg = CodecOptions {
            quality: Some(80),
            ..Default::default()
        };
        assert!(!is_lossless(Encoding::Jpeg, &jpeg));
        assert!(is_lossless(Encoding::Png, &CodecOptions::default()));
        assert!(!is_lossless(Encoding::Webp, &CodecOptions::default()));
        let video = CodecOptions {
            quality: Some(100),
            csc: Some(PixelFormat::Yuv420p),
            ..Default::default()
        };
        assert!(!is_lossless(Encoding::H264, &video));
        let scaled = CodecOptions {
            scaled_size: Some((10, 10)),
            ..Default::default()
        };
        assert!(!is_lossless(Encoding::Rgb24, &scaled));
    }

    #[test]
    fn lossy_send_schedules_refresh() {
        let mut timers = Timers::new();
        let mut r = RefreshScheduler::new(&RefreshSettings::default());
        let now = Instant::now();
        r.on_sent(1, lossy(Rectangle::new(0, 0, 100, 100)), AREA, 10, now, &mut timers);
        assert!(r.is_scheduled());
        // 150 * 50 / 50 = 150, times 150*150/20000
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(168)));
    }

    #[test]
    fn faster_speed_refreshes_sooner() {
        let deadline = |speed: u8| {
            let mut timers = Timers::new();
            let mut r = RefreshScheduler::new(&RefreshSettings::default());
            let now = Instant::now();
            let mut sent = lossy(Rectangle::new(0, 0, 100, 100));
            sent.speed = speed;
            r.on_sent(1, sent, AREA, 10, now, &mut timers);
            timers.next_deadline().unwrap() - now
        };
        let slow = deadline(10);
        let fast = deadline(90);
        assert!(fast < slow, "speed 90 waits {fast:?}, speed 10 waits {slow:?}");
    }

    #[test]
    fn lossless_send_clears_region() {
        let mut timers = Timers::new();
        let mut r = RefreshScheduler::new(&RefreshSettings::default());
        let now = Instant::now();
        let rect = Rectangle::new(0, 0, 100, 100);
        r.on_sent(1, lossy(rect), AREA, 10, now, &mut timers);
        let mut sent = lossy(rect);
        sent.lossless = true;
        r.on_sent(1, sent, AREA, 10, now, &mut timers);
        assert!(r.pending().is_empty());
        assert!(!r.is_scheduled());
        assert!(timers.is_empty());
    }

    #[test]
    fn later_lossy_sends_push_the_deadline() {
        let mut timers = Timers::new();
        let mut r = RefreshScheduler::new(&RefreshSettings::default());
        let t0 = Instant::now();
        r.on_sent(1, lossy(Rectangle::new(0, 0, 100, 100)), AREA, 10, t0, &mut timers);
        let first = timers.next_deadline().unwrap();
        let t1 = t0 + Duration::from_millis(150);
        r.on_sent(1, lossy(Rectangle::new(100, 0, 100, 100)), AREA, 100, t1, &mut timers);

        let due = timers.pop_due(first);
        assert_eq!(due.len(), 1);
        assert!(r.on_timer(1, due[0].0, first, &mut timers).is_none());
        assert!(r.is_scheduled());

        let later = timers.next_deadline().unwrap();
        assert!(later > first);
        let due = timers.pop_due(later);
        let regions = r.on_timer(1, due[0].0, later, &mut timers).unwrap();
        assert_eq!(regions.pixel_count(), 20_000);
        assert!(r.pending().is_empty());
    }

    #[test]
    fn refresh_options_force_quality() {
        let r = RefreshScheduler::new(&RefreshSettings::default());
        let opts = r.options();
        assert_eq!(opts.quality, Some(100));
        assert_eq!(opts.speed, Some(50));
        assert!(opts.auto_refresh && opts.novideo);
    }
}
