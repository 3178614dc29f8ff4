//! Per-window batching parameters.

use std::time::{Duration, Instant};

use crate::config::BatchSettings;
use crate::control::average::Factor;
use crate::stats::TimedRing;

/// Batching parameters of one window.
///
/// Every window gets its own copy of the connection template, scaled to
/// its size; only the controller and explicit lock/unlock commands
/// change it afterwards.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub always: bool,
    /// Current batch delay in milliseconds.
    pub delay: u64,
    pub min_delay: u64,
    pub max_delay: u64,
    pub start_delay: u64,
    pub max_events: u32,
    pub max_pixels: u64,
    pub time_unit: Duration,
    pub timeout_delay: Duration,
    /// Delay pinned by an explicit command.
    pub locked: bool,
    /// Delay to restore on unlock.
    pub saved: u64,
    /// Delays chosen by the calculator.
    pub last_delays: TimedRing<u64>,
    /// Delays batches actually waited.
    pub last_actual_delays: TimedRing<u64>,
    pub last_updated: Option<Instant>,
    /// Inputs of the most recent calculation.
    pub factors: Vec<Factor>,
    /// Delay normalised to a one megapixel window.
    pub delay_per_megapixel: Option<u64>,
}

impl BatchConfig {
    /// Connection-wide template.
    pub fn template(settings: &BatchSettings) -> Self {
        let history = settings.history;
        Self {
            always: settings.always,
            delay: settings.start_delay_ms,
            min_delay: settings.min_delay_ms,
            max_delay: settings.max_delay_ms,
            start_delay: settings.start_delay_ms,
            max_events: settings.max_events,
            max_pixels: settings.max_pixels,
            time_unit: settings.time_unit(),
            timeout_delay: settings.timeout_delay(),
            locked: false,
            saved: settings.start_delay_ms,
            last_delays: TimedRing::new(history, Duration::from_secs(3600)),
            last_actual_delays: TimedRing::new(history, Duration::from_secs(3600)),
            last_updated: None,
            factors: Vec::new(),
            delay_per_megapixel: None,
        }
    }

    /// A fresh copy for a `width`×`height` window.
    ///
    /// The template's per-megapixel delay is scaled by the square root of
    /// the window's megapixels: a 4 MP window starts at twice the
    /// baseline, a quarter megapixel one at half of it.
    pub fn for_window(&self, width: u32, height: u32) -> Self {
        let mut cfg = self.clone();
        cfg.last_delays.clear();
        cfg.last_actual_delays.clear();
        cfg.factors.clear();
        cfg.last_updated = None;
        cfg.locked = false;
        if let Some(dpm) = self.delay_per_megapixel {
            let ratio = (width as f64 * height as f64) / 1_000_000.0;
            let scaled = (dpm as f64 * ratio.sqrt()) as u64;
            cfg.delay = scaled.clamp(cfg.min_delay, cfg.max_delay);
        }
        cfg.saved = cfg.delay;
        cfg
    }

    /// Pin the delay until [`unlock`](Self::unlock).
    pub fn lock(&mut self, delay: u64) {
        if !self.locked {
            self.saved = self.delay;
        }
        self.locked = true;
        self.delay = delay.clamp(self.min_delay, self.max_delay);
    }

    pub fn unlock(&mut self) {
        if self.locked {
            self.locked = false;
            self.delay = self.saved;
        }
    }

    pub fn record_actual_delay(&mut self, now: Instant, waited: Duration) {
        self.last_actual_delays
            .push_at(now, waited.as_millis() as u64);
    }
}
