//! Audio/video synchronisation delay.
//!
//! The client delays painting video frames so that they line up with
//! the audio it plays. Frames held back by the encoder are already late,
//! so the requested delay shrinks by a fixed amount per delayed frame.
//! The delay moves towards its target in bounded steps on a timer and is
//! only ever attached to outgoing video packets; encoding never waits
//! for it.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::AvSyncSettings;
use crate::encoding::Encoding;
use crate::packet::CodecOptions;
use crate::timer::{TimerEvent, TimerHandle, TimerKind, TimerSlot, Timers};
use crate::types::WindowId;

#[derive(Debug)]
pub struct AvSync {
    settings: AvSyncSettings,
    /// Delay the client asked for.
    base: u32,
    current: u32,
    target: u32,
    timer: TimerSlot,
}

impl AvSync {
    pub fn new(settings: &AvSyncSettings, base_delay_ms: u32) -> Self {
        Self {
            settings: settings.clone(),
            base: base_delay_ms,
            current: base_delay_ms,
            target: base_delay_ms,
            timer: TimerSlot::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled && self.base > 0
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// The encoder reports how many frames it is holding back.
    pub fn set_delayed_frames(&mut self, window: WindowId, delayed: u32, now: Instant, timers: &mut Timers) {
        if !self.enabled() {
            return;
        }
        let target = self
            .base
            .saturating_sub(self.settings.frame_delay_ms.saturating_mul(delayed));
        if target == self.target {
            return;
        }
        debug!(window, delayed, target, current = self.current, "av-sync target changed");
        self.target = target;
        if self.current != self.target && !self.timer.is_armed() {
            self.arm(window, now, timers);
        }
    }

    /// Move one step towards the target. Returns `true` if the delay changed.
    pub fn on_tick(&mut self, window: WindowId, handle: TimerHandle, now: Instant, timers: &mut Timers) -> bool {
        if !self.timer.fired(handle) {
            return false;
        }
        let step = self.settings.step_ms;
        let before = self.current;
        self.current = if self.target > self.current {
            self.target.min(self.current.saturating_add(step))
        } else {
            self.target.max(self.current.saturating_sub(step))
        };
        if self.current != self.target {
            self.arm(window, now, timers);
        }
        before != self.current
    }

    fn arm(&mut self, window: WindowId, now: Instant, timers: &mut Timers) {
        self.timer.arm(
            timers,
            now + Duration::from_millis(self.settings.interval_ms),
            TimerEvent::Window(window, TimerKind::AvSyncTick),
        );
    }

    /// Attach the delay to a video packet.
    pub fn annotate(&self, encoding: Encoding, options: &mut CodecOptions) {
        if self.enabled() && encoding.is_video() {
            options.av_sync_delay = Some(self.current);
        }
    }

    pub fn cancel(&mut self, timers: &mut Timers) {
        self.timer.cancel(timers);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sync: &mut AvSync, timers: &mut Timers, mut now: Instant) -> Vec<u32> {
        let mut seen = Vec::new();
        while let Some(deadline) = timers.next_deadline() {
            now = now.max(deadline);
            for (handle, _) in timers.pop_due(now) {
                sync.on_tick(1, handle, now, timers);
                seen.push(sync.current());
            }
        }
        seen
    }

    #[test]
    fn steps_towards_target() {
        let mut timers = Timers::new();
        let mut sync = AvSync::new(&AvSyncSettings::default(), 150);
        let now = Instant::now();
        sync.set_delayed_frames(1, 2, now, &mut timers);
        assert_eq!(sync.target(), 70);
        assert_eq!(drain(&mut sync, &mut timers, now), vec![130, 110, 90, 70]);
        assert!(timers.is_empty());
    }

    #[test]
    fn target_never_negative() {
        let mut timers = Timers::new();
        let mut sync = AvSync::new(&AvSyncSettings::default(), 50);
        sync.set_delayed_frames(1, 5, Instant::now(), &mut timers);
        assert_eq!(sync.target(), 0);
    }

    #[test]
    fn only_video_packets_are_annotated() {
        let sync = AvSync::new(&AvSyncSettings::default(), 100);
        let mut opts = CodecOptions::default();
        sync.annotate(Encoding::Png, &mut opts);
        assert_eq!(opts.av_sync_delay, None);
        sync.annotate(Encoding::H264, &mut opts);
        assert_eq!(opts.av_sync_delay, Some(100));
    }

    #[test]
    fn disabled_without_client_delay() {
        let mut timers = Timers::new();
        let mut sync = AvSync::new(&AvSyncSettings::default(), 0);
        sync.set_delayed_frames(1, 3, Instant::now(), &mut timers);
        assert!(timers.is_empty());
        assert!(!sync.enabled());
    }
}
