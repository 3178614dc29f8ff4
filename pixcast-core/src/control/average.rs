//! Time-weighted averages and the factor helpers built on them.
//!
//! All helpers take `now` explicitly so results are reproducible.

use std::time::Instant;

/// `log2(1 + x)`: zero at zero, one at one, slow growth beyond.
pub fn logp(x: f64) -> f64 {
    (1.0 + x.max(-0.999_999)).log2()
}

fn age(now: Instant, when: Instant) -> f64 {
    now.saturating_duration_since(when).as_secs_f64()
}

/// Time-weighted average where recent samples dominate.
///
/// Each sample weighs `1 / (min_offset + age^rpow)`. Returns `None` for
/// an empty input.
pub fn time_weighted_average<I>(now: Instant, data: I, min_offset: f64, rpow: f64) -> Option<f64>
where
    I: IntoIterator<Item = (Instant, f64)>,
{
    let (mut tv, mut tw) = (0.0, 0.0);
    for (when, value) in data {
        let w = 1.0 / (min_offset + age(now, when).powf(rpow));
        tv += value * w;
        tw += w;
    }
    (tw > 0.0).then(|| tv / tw)
}

/// Long-run and recent averages of the same series.
///
/// The long-run average decays linearly with age, the recent one with
/// the square of it.
pub fn average_and_recent<I>(now: Instant, data: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = (Instant, f64)>,
{
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for (when, value) in data {
        let a = age(now, when);
        let w = 1.0 / (1.0 + a);
        tv += value * w;
        tw += w;
        let r = 1.0 / (0.1 + a * a);
        rv += value * r;
        rw += r;
    }
    (tw > 0.0).then(|| (tv / tw, rv / rw))
}

/// Like [`average_and_recent`], with each sample also weighted by a size.
pub fn size_weighted_average_and_recent<I>(now: Instant, data: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = (Instant, f64, f64)>,
{
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for (when, size, value) in data {
        let a = age(now, when);
        let size = size.max(1.0);
        let w = size / (1.0 + a);
        tv += value * w;
        tw += w;
        let r = size / (0.1 + a * a);
        rv += value * r;
        rw += r;
    }
    (tw > 0.0).then(|| (tv / tw, rv / rw))
}

// ── Factors ──────────────────────────────────────────────────────

/// One input to the batch-delay calculation: multiply the delay by
/// `factor`, with relative importance `weight`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Factor {
    pub name: &'static str,
    pub factor: f64,
    pub weight: f64,
}

impl Factor {
    pub fn new(name: &'static str, factor: f64, weight: f64) -> Self {
        Self {
            name,
            factor,
            weight,
        }
    }
}

/// Smoothing applied to raw ratios before they become factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Smoothing {
    Logp,
    Sqrt,
}

impl Smoothing {
    fn apply(self, x: f64) -> f64 {
        match self {
            Smoothing::Logp => logp(x),
            Smoothing::Sqrt => x.max(0.0).sqrt(),
        }
    }
}

/// Factor that pushes `recent` towards `target`.
///
/// `aim` balances distance-to-target (low aim) against the trend
/// relative to the average (high aim). The weight grows with how far the
/// factor is from one.
#[allow(clippy::too_many_arguments)]
pub fn calculate_for_target(
    name: &'static str,
    target: f64,
    avg: f64,
    recent: f64,
    aim: f64,
    slope: f64,
    smoothing: Smoothing,
    weight_multiplier: f64,
) -> Factor {
    let target_factor = recent / (slope + target);
    let avg_factor = recent / (slope + avg);
    let aimed = target_factor * (1.0 - aim) + avg_factor * aim;
    let factor = smoothing.apply(aimed);
    let weight = smoothing.apply((1.0 - factor).max(factor - 1.0).max(0.0)) * weight_multiplier;
    Factor::new(name, factor, weight)
}

/// Factor for a queue-size history: bigger-than-target queues slow us down.
pub fn queue_inspect<I>(
    name: &'static str,
    now: Instant,
    data: I,
    target: f64,
    div: f64,
    smoothing: Smoothing,
) -> Factor
where
    I: IntoIterator<Item = (Instant, f64)>,
{
    let div = div.max(1.0);
    let Some((avg, recent)) = average_and_recent(now, data.into_iter().map(|(t, v)| (t, v / div)))
    else {
        return Factor::new(name, 1.0, 0.0);
    };
    let wm = (avg.max(recent) / target).max(0.0).sqrt();
    calculate_for_target(name, target, avg, recent, 0.25, 1.0, smoothing, wm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn logp_shape() {
        assert_eq!(logp(0.0), 0.0);
        assert!((logp(1.0) - 1.0).abs() < 1e-9);
        assert!((logp(3.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn recent_values_dominate() {
        let now = Instant::now() + Duration::from_secs(10);
        let data = vec![(now - Duration::from_secs(9), 10.0), (now, 90.0)];
        let v = time_weighted_average(now, data, 0.1, 2.0).unwrap();
        assert!(v > 85.0, "v = {v}");
    }

    #[test]
    fn empty_average_is_none() {
        let now = Instant::now();
        assert!(time_weighted_average(now, Vec::new(), 1.0, 1.1).is_none());
        assert!(average_and_recent(now, Vec::new()).is_none());
    }

    #[test]
    fn on_target_factor_is_neutral() {
        let f = calculate_for_target("x", 1.0, 1.0, 1.0, 0.5, 0.0, Smoothing::Sqrt, 1.0);
        assert!((f.factor - 1.0).abs() < 1e-9);
        assert!(f.weight.abs() < 1e-9);
    }

    #[test]
    fn growing_queue_raises_factor() {
        let now = Instant::now() + Duration::from_secs(5);
        let data: Vec<_> = (0..5)
            .map(|i| (now - Duration::from_secs(4 - i), (i * 4) as f64))
            .collect();
        let f = queue_inspect("queue", now, data, 1.0, 1.0, Smoothing::Sqrt);
        assert!(f.factor > 1.0);
        assert!(f.weight > 0.0);
    }
}
