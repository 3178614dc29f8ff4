//! Single-shot, cancellable timers driven by an explicit clock.
//!
//! The engine never sleeps: it asks [`Timers::next_deadline`] when it
//! wants to be woken and hands the current instant to
//! [`Timers::pop_due`]. The async service maps that onto
//! `tokio::time::sleep_until`; tests just pass instants.
//!
//! Each concern that needs a timer owns one [`TimerSlot`]. Re-arming a
//! slot cancels its previous timer, and owners cancel their slots before
//! they go away, so a timer can never fire for a dead object.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::types::WindowId;

// ── TimerKind ────────────────────────────────────────────────────

/// What a per-window timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The pending batch's delay has elapsed.
    BatchExpiry,
    /// Re-check of an expired batch still waiting on acks.
    SoftExpiry,
    /// Give up on a batch stuck behind acks; refresh instead.
    HardTimeout,
    /// Retry a flush deferred by encode/pixel backlog.
    Recheck,
    /// Lossless refresh of regions sent lossy.
    Refresh,
    /// Lossless refresh of the video region.
    SubregionRefresh,
    /// Step the av-sync delay towards its target.
    AvSyncTick,
    /// Drain frames an encoder is holding back.
    VideoFlush,
    /// Full refresh after a client decode error.
    DecodeErrorRefresh,
}

/// A scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Window(WindowId, TimerKind),
    /// Connection-wide batch-delay recalculation.
    Recalculate,
}

/// Identifies one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle {
    pub deadline: Instant,
    id: u64,
}

// ── Timers ───────────────────────────────────────────────────────

/// Deadline-ordered set of pending timers.
#[derive(Debug, Default)]
pub struct Timers {
    pending: BTreeMap<TimerHandle, TimerEvent>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, event: TimerEvent) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle {
            deadline,
            id: self.next_id,
        };
        self.pending.insert(handle, event);
        handle
    }

    /// Returns `true` if the timer was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.pending.remove(&handle).is_some()
    }

    /// Cancel every timer belonging to `window`.
    pub fn cancel_window(&mut self, window: WindowId) {
        self.pending
            .retain(|_, ev| !matches!(ev, TimerEvent::Window(w, _) if *w == window));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|h| h.deadline)
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerHandle, TimerEvent)> {
        let mut due = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            let (handle, event) = entry.remove_entry();
            due.push((handle, event));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ── TimerSlot ────────────────────────────────────────────────────

/// At most one outstanding timer for a single concern.
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<TimerHandle>,
}

impl TimerSlot {
    /// Schedule, replacing any timer this slot already holds.
    pub fn arm(&mut self, timers: &mut Timers, deadline: Instant, event: TimerEvent) {
        self.cancel(timers);
        self.handle = Some(timers.schedule(deadline, event));
    }

    pub fn cancel(&mut self, timers: &mut Timers) {
        if let Some(h) = self.handle.take() {
            timers.cancel(h);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.handle.map(|h| h.deadline)
    }

    /// Acknowledge that `handle` fired.
    ///
    /// Returns `true` and disarms the slot if it was this slot's timer.
    pub fn fired(&mut self, handle: TimerHandle) -> bool {
        if self.handle == Some(handle) {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EXPIRY: TimerEvent = TimerEvent::Window(1, TimerKind::BatchExpiry);

    #[test]
    fn pops_in_deadline_order() {
        let mut timers = Timers::new();
        let t0 = Instant::now();
        timers.schedule(t0 + Duration::from_millis(20), TimerEvent::Recalculate);
        timers.schedule(t0 + Duration::from_millis(10), EXPIRY);
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_millis(10)));

        let due = timers.pop_due(t0 + Duration::from_millis(15));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, EXPIRY);

        let due = timers.pop_due(t0 + Duration::from_millis(30));
        assert_eq!(due[0].1, TimerEvent::Recalculate);
        assert!(timers.is_empty());
    }

    #[test]
    fn slot_rearm_cancels_previous() {
        let mut timers = Timers::new();
        let mut slot = TimerSlot::default();
        let t0 = Instant::now();
        slot.arm(&mut timers, t0 + Duration::from_millis(10), EXPIRY);
        slot.arm(&mut timers, t0 + Duration::from_millis(50), EXPIRY);
        assert_eq!(timers.len(), 1);
        assert_eq!(slot.deadline(), Some(t0 + Duration::from_millis(50)));
    }

    #[test]
    fn slot_recognises_its_timer() {
        let mut timers = Timers::new();
        let mut slot = TimerSlot::default();
        let t0 = Instant::now();
        slot.arm(&mut timers, t0, EXPIRY);
        let due = timers.pop_due(t0);
        assert!(slot.fired(due[0].0));
        assert!(!slot.is_armed());
        assert!(!slot.fired(due[0].0));
    }

    #[test]
    fn cancel_window_only_touches_that_window() {
        let mut timers = Timers::new();
        let t0 = Instant::now();
        timers.schedule(t0, TimerEvent::Window(1, TimerKind::Refresh));
        timers.schedule(t0, TimerEvent::Window(2, TimerKind::Refresh));
        timers.schedule(t0, TimerEvent::Recalculate);
        timers.cancel_window(1);
        assert_eq!(timers.len(), 2);
    }
}
