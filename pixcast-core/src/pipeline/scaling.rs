//! Video downscaling decisions.

use tracing::debug;

use crate::pipeline::scoring::NO_SCALING;

/// Steps tried, largest first, when a frame exceeds the encoder limits.
pub const SCALING_LADDER: [(u32, u32); 6] = [(2, 3), (1, 2), (1, 3), (1, 4), (1, 8), (1, 10)];

/// Window state the scaling heuristics look at, gathered on the capture side.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScalingHint {
    pub fullscreen: bool,
    pub maximized: bool,
    pub shadow: bool,
    /// Damage events seen for the window.
    pub damage_events: u64,
    /// No resize in the last half second.
    pub settled: bool,
    /// Full frames per second over the last few seconds, when measurable.
    pub ffps: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScalingInput {
    pub width: u32,
    pub height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
    pub speed: u8,
    /// Client accepts scaled frames and scaling is enabled.
    pub allowed: bool,
    /// Use heuristics on top of the required minimum.
    pub heuristics: bool,
    /// Scaling of the running pipeline.
    pub current: (u32, u32),
    pub hint: ScalingHint,
}

/// Smallest ladder step that fits `width`×`height` into the limits.
pub fn min_required_scaling(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return NO_SCALING;
    }
    SCALING_LADDER
        .iter()
        .copied()
        .find(|(num, den)| {
            width as u64 * *num as u64 / *den as u64 <= max_width as u64
                && height as u64 * *num as u64 / *den as u64 <= max_height as u64
        })
        .unwrap_or((1, 10))
}

/// Pick the scaling for a frame; never upscales, never below 1/10.
pub fn calculate_scaling(input: &ScalingInput) -> (u32, u32) {
    let (w, h) = (input.width, input.height);
    let oversized = w > input.max_width || h > input.max_height;
    let mut scaling = None;
    if !input.allowed {
        scaling = Some(NO_SCALING);
    } else if oversized {
        scaling = Some(min_required_scaling(w, h, input.max_width, input.max_height));
    } else if input.heuristics && !input.hint.shadow && input.hint.damage_events > 50 && input.hint.settled {
        let ffps = input.hint.ffps.unwrap_or(0) as f64;
        // resist changing away from a downscaled pipeline
        let er = if input.current != NO_SCALING {
            0.5 * input.current.1 as f64 / input.current.0.max(1) as f64
        } else {
            0.0
        };
        let q = input.quality as f64;
        let s = input.speed as f64;
        let qs = s > q - er * 10.0 && q < 70.0 + er * 15.0;
        let area = w as f64 * h as f64;
        scaling = if input.hint.fullscreen && (qs || ffps >= (10.0 - er * 3.0).max(2.0)) {
            Some((1, 3))
        } else if input.hint.maximized && (qs || ffps >= (10.0 - er * 3.0).max(2.0)) {
            Some((1, 2))
        } else if area >= (2560.0 - er * 768.0) * 1600.0 && (qs || ffps >= (25.0 - er * 5.0).max(4.0)) {
            Some((1, 3))
        } else if area >= (1920.0 - er * 384.0) * 1200.0 && (qs || ffps >= (30.0 - er * 10.0).max(5.0)) {
            Some((2, 3))
        } else if area >= (1200.0 - er * 256.0) * 1024.0 && (qs || ffps >= (50.0 - er * 15.0).max(10.0)) {
            Some((2, 3))
        } else {
            None
        };
        if let Some(s) = scaling {
            debug!(?s, er, qs, ffps, "scaling enabled by heuristics");
        }
    }
    let (num, den) = scaling.unwrap_or(NO_SCALING);
    if num > den {
        NO_SCALING
    } else if (num as f64) / (den.max(1) as f64) < 0.1 {
        (1, 10)
    } else {
        (num, den)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn input(width: u32, height: u32) -> ScalingInput {
        ScalingInput {
            width,
            height,
            max_width: 4096,
            max_height: 4096,
            quality: 90,
            speed: 20,
            allowed: true,
            heuristics: true,
            current: NO_SCALING,
            hint: ScalingHint {
                damage_events: 100,
                settled: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn small_windows_are_not_scaled() {
        assert_eq!(calculate_scaling(&input(800, 600)), NO_SCALING);
    }

    #[test]
    fn oversized_frames_take_required_step() {
        assert_eq!(calculate_scaling(&input(5000, 3000)), (2, 3));
        assert_eq!(calculate_scaling(&input(30000, 1000)), (1, 8));
        assert_eq!(min_required_scaling(100000, 100, 4096, 4096), (1, 10));
    }

    #[test]
    fn oversized_overrides_disabled_heuristics() {
        let mut i = input(5000, 3000);
        i.heuristics = false;
        assert_eq!(calculate_scaling(&i), (2, 3));
        i.allowed = false;
        assert_eq!(calculate_scaling(&i), NO_SCALING);
    }

    #[test]
    fn fullscreen_at_high_frame_rate() {
        let mut i = input(1920, 1080);
        i.hint.fullscreen = true;
        i.hint.ffps = Some(20);
        assert_eq!(calculate_scaling(&i), (1, 3));
        i.hint.fullscreen = false;
        i.hint.maximized = true;
        assert_eq!(calculate_scaling(&i), (1, 2));
    }

    #[test]
    fn low_quality_high_speed_large_area() {
        let mut i = input(1920, 1200);
        i.quality = 40;
        i.speed = 80;
        assert_eq!(calculate_scaling(&i), (2, 3));
    }

    #[test]
    fn quiet_windows_use_no_heuristics() {
        let mut i = input(1920, 1080);
        i.hint.fullscreen = true;
        i.hint.ffps = Some(20);
        i.hint.damage_events = 10;
        assert_eq!(calculate_scaling(&i), NO_SCALING);
    }
}
