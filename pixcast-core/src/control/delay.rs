//! Batch-delay calculation.
//!
//! A window's delay is pulled towards a weighted combination of
//! factors (focus, other windows' state, backlog, latency, congestion),
//! anchored by a time-weighted history of previous delays so it cannot
//! swing wildly between two recalculations.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::batch::config::BatchConfig;
use crate::config::ControllerSettings;
use crate::control::average::{Factor, logp};

/// Pixels that count as a "low" backlog: one full frame of the window
/// (four with mmap, which drains much faster).
pub fn low_limit(mmap: bool, width: u32, height: u32) -> u64 {
    let mut limit = if width > 0 && height > 0 {
        (width as u64 * height as u64).max(64)
    } else {
        1024 * 1024
    };
    if mmap {
        limit *= 4;
    }
    limit
}

/// State of a window and its neighbours that feeds the calculation.
#[derive(Debug, Clone, Default)]
pub struct DelayInputs {
    pub has_focus: bool,
    /// Override-redirect, tray or shadow window.
    pub transient_class: bool,
    pub other_is_fullscreen: bool,
    pub other_is_maximized: bool,
    pub soft_expired: u32,
    /// Statistics-derived factors (window and connection).
    pub measured: Vec<Factor>,
}

/// Build the factor list for a window and update its delay.
pub fn calculate_batch_delay(batch: &mut BatchConfig, now: Instant, inputs: DelayInputs) {
    let mut factors = inputs.measured;
    let focus = inputs.has_focus as u8 as f64;
    factors.push(Factor::new("focus", 1.0 - focus, focus));
    let or = inputs.transient_class as u8 as f64;
    factors.push(Factor::new("override-redirect", 1.0 - or, or));
    // another window fullscreen or maximized: slow down
    let fs = inputs.other_is_fullscreen as u8 as f64;
    factors.push(Factor::new("fullscreen", 4.0 * fs, fs));
    let max = inputs.other_is_maximized as u8 as f64;
    factors.push(Factor::new("maximized", 4.0 * max, max));
    let se = inputs.soft_expired as f64;
    factors.push(Factor::new("soft-expired", se, (se > 0.0) as u8 as f64));
    update_batch_delay(batch, now, factors);
}

/// Combine `factors` with the delay history into a new delay.
///
/// History samples weigh `d_weight / (1 + (age / decay)²)`, where the
/// decay grows with how much we batch already; each factor then adds a
/// target of `delay * factor` with weight proportional to its share of
/// the total factor weight. Does nothing when the delay is locked or no
/// factor carries weight.
pub fn update_batch_delay(batch: &mut BatchConfig, now: Instant, factors: Vec<Factor>) {
    if batch.locked {
        return;
    }
    let current = batch.delay as f64;
    let max_delay = batch.max_delay as f64;
    let decay = logp(current / batch.min_delay.max(1) as f64) / 5.0;
    let decay = decay.max(1.0);

    let (mut tv, mut tw) = (0.0, 0.0);
    for (history, d_weight) in [(&batch.last_delays, 0.25), (&batch.last_actual_delays, 0.75)] {
        for (when, delay) in history.iter() {
            let age = now.saturating_duration_since(*when).as_secs_f64();
            let w = d_weight / (1.0 + (age / decay).powi(2));
            tv += (*delay as f64).clamp(0.0, max_delay) * w;
            tw += w;
        }
    }
    let hist_w = tw;

    let valid: Vec<Factor> = factors
        .into_iter()
        .filter(|f| f.factor.is_finite() && f.weight.is_finite() && f.weight >= 0.0)
        .collect();
    let total_weight: f64 = valid.iter().map(|f| f.weight).sum();
    if total_weight <= 0.0 {
        trace!("update_batch_delay: no weights yet");
        return;
    }
    for f in &valid {
        trace!(
            name = f.name,
            factor = f.factor,
            weight = f.weight,
            "update_batch_delay"
        );
        let target = (current * f.factor).clamp(0.0, max_delay);
        let w = hist_w.max(1.0) * f.weight / total_weight;
        tw += w;
        tv += target * w;
    }
    let floor = if batch.always { batch.min_delay as f64 } else { 0.0 };
    let delay = (tv / tw).floor().min(max_delay).max(floor);
    batch.delay = delay as u64;
    batch.last_delays.push_at(now, batch.delay);
    batch.last_updated = Some(now);
    batch.factors = valid;
}

/// A window whose delay is already near its minimum, that was updated
/// recently and has been quiet since, keeps its delay as it is.
pub fn may_skip_recalculation(
    batch: &BatchConfig,
    now: Instant,
    pixels_since_update: u64,
    settings: &ControllerSettings,
) -> bool {
    let Some(updated) = batch.last_updated else {
        return false;
    };
    now.saturating_duration_since(updated) < Duration::from_secs(settings.quiet_skip_secs)
        && batch.delay <= batch.min_delay * 2
        && pixels_since_update < settings.quiet_pixels
}

/// Size and recency of one window's delay, for the connection baseline.
#[derive(Debug, Clone, Copy)]
pub struct WindowDelay {
    pub width: u32,
    pub height: u32,
    pub delay: u64,
    pub last_updated: Option<Instant>,
}

/// Connection baseline: `(delay, delay_per_megapixel)`.
///
/// A pixel-weighted average over windows that have been updated at
/// least once (older updates weigh more, smoothing the baseline),
/// normalised to a one-megapixel window by the average window size.
pub fn baseline_delay<I>(now: Instant, windows: I) -> Option<(u64, u64)>
where
    I: IntoIterator<Item = WindowDelay>,
{
    let (mut wsum, mut wdelay, mut tsize, mut count) = (0.0, 0.0, 0u64, 0u64);
    for w in windows {
        let Some(updated) = w.last_updated else {
            continue;
        };
        let px = w.width as u64 * w.height as u64;
        tsize += px;
        count += 1;
        let time_w = 2.0 + now.saturating_duration_since(updated).as_secs_f64();
        let weight = px as f64 * time_w;
        wdelay += w.delay as f64 * weight;
        wsum += weight;
    }
    if wsum <= 0.0 || count == 0 {
        return None;
    }
    let delay = (wdelay / wsum) as u64;
    let avg_size = (tsize / count).max(1);
    let ratio = (1_000_000.0 / avg_size as f64).sqrt();
    Some((delay, (delay as f64 * ratio) as u64))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchSettings;

    fn batch() -> BatchConfig {
        BatchConfig::template(&BatchSettings::default()).for_window(800, 600)
    }

    #[test]
    fn focused_window_speeds_up() {
        let mut b = batch();
        let now = Instant::now();
        let inputs = DelayInputs {
            has_focus: true,
            ..Default::default()
        };
        calculate_batch_delay(&mut b, now, inputs);
        // focus factor 0 is the only weighted input
        assert!(b.delay < 50, "delay = {}", b.delay);
        assert!(b.last_updated.is_some());
        assert!(b.factors.iter().any(|f| f.name == "focus"));
    }

    #[test]
    fn other_fullscreen_slows_down() {
        let mut b = batch();
        let inputs = DelayInputs {
            other_is_fullscreen: true,
            ..Default::default()
        };
        calculate_batch_delay(&mut b, Instant::now(), inputs);
        assert!(b.delay > 50);
        assert!(b.delay <= b.max_delay);
    }

    #[test]
    fn locked_delay_is_untouched() {
        let mut b = batch();
        b.lock(120);
        let inputs = DelayInputs {
            has_focus: true,
            ..Default::default()
        };
        calculate_batch_delay(&mut b, Instant::now(), inputs);
        assert_eq!(b.delay, 120);
    }

    #[test]
    fn always_keeps_min_delay() {
        let mut b = batch();
        b.always = true;
        update_batch_delay(&mut b, Instant::now(), vec![Factor::new("zero", 0.0, 1.0)]);
        assert_eq!(b.delay, b.min_delay);
    }

    #[test]
    fn history_damps_changes() {
        let mut with_history = batch();
        let mut fresh = batch();
        let now = Instant::now() + Duration::from_secs(1);
        for i in 0..20 {
            with_history
                .last_actual_delays
                .push_at(now - Duration::from_millis(i * 10), 50);
        }
        let f = vec![Factor::new("fast", 0.1, 1.0)];
        update_batch_delay(&mut with_history, now, f.clone());
        update_batch_delay(&mut fresh, now, f);
        assert!(with_history.delay > fresh.delay);
    }

    #[test]
    fn baseline_is_pixel_weighted() {
        let now = Instant::now();
        let windows = [
            WindowDelay {
                width: 1000,
                height: 1000,
                delay: 100,
                last_updated: Some(now),
            },
            WindowDelay {
                width: 10,
                height: 10,
                delay: 10,
                last_updated: Some(now),
            },
            WindowDelay {
                width: 5000,
                height: 5000,
                delay: 400,
                last_updated: None,
            },
        ];
        let (delay, dpm) = baseline_delay(now, windows).unwrap();
        assert!(delay >= 99 && delay <= 100, "delay = {delay}");
        assert!(dpm > delay);
        assert!(baseline_delay(now, []).is_none());
    }

    #[test]
    fn quiet_window_near_minimum_is_skipped() {
        let settings = ControllerSettings::default();
        let mut b = batch();
        let now = Instant::now();
        assert!(!may_skip_recalculation(&b, now, 0, &settings));
        b.delay = b.min_delay;
        b.last_updated = Some(now);
        assert!(may_skip_recalculation(&b, now + Duration::from_secs(5), 10, &settings));
        assert!(!may_skip_recalculation(&b, now + Duration::from_secs(5), 1_000_000, &settings));
        assert!(!may_skip_recalculation(&b, now + Duration::from_secs(120), 10, &settings));
        b.delay = 200;
        assert!(!may_skip_recalculation(&b, now, 10, &settings));
    }
}
