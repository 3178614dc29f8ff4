//! Per-region encoding choice.
//!
//! [`select_encoding`] is a pure function of its inputs: every threshold
//! is precomputed in [`SelectionThresholds`] whenever quality or speed
//! change, so the same inputs always produce the same encoding.

use serde::Serialize;

use crate::config::SelectorSettings;
use crate::encoding::{Encoding, WindowFlags};
use crate::region::Rectangle;

// ── VideoLimits ──────────────────────────────────────────────────

/// Dimension constraints of the current video encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoLimits {
    pub width_mask: u32,
    pub height_mask: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for VideoLimits {
    /// Permissive limits used until a pipeline reports real ones.
    fn default() -> Self {
        Self {
            width_mask: 0xFFFF,
            height_mask: 0xFFFF,
            min_width: 1,
            min_height: 1,
            max_width: 16384,
            max_height: 16384,
        }
    }
}

impl VideoLimits {
    pub fn masked(&self, width: u32, height: u32) -> (u32, u32) {
        (width & self.width_mask, height & self.height_mask)
    }

    pub fn fits(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }
}

// ── SelectionThresholds ──────────────────────────────────────────

/// Thresholds derived from the current speed/quality and window class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelectionThresholds {
    /// Regions below this many pixels are sent as plain rgb.
    pub rgb_threshold: u64,
    pub lossless_base: f64,
    pub lossless_pixel_boost: f64,
    pub max_nonvideo_pixels: u64,
    pub video_sustain_frames: u64,
    pub video_frame_cap: u64,
    pub webp_min_pixels: u64,
}

impl SelectionThresholds {
    /// Recompute for the window's current `speed` and `quality`.
    ///
    /// High speed assumes spare bandwidth and lowers the bar for going
    /// lossy; while a video pipeline is active the lossless base drops
    /// further and the per-pixel boost grows.
    pub fn compute(
        settings: &SelectorSettings,
        speed: u8,
        quality: u8,
        flags: WindowFlags,
        video_active: bool,
    ) -> Self {
        let speed = speed as f64;
        let (lossless_base, lossless_pixel_boost) = if video_active {
            (
                settings
                    .video_lossless_base_cap
                    .min(settings.video_lossless_base_offset + (speed / 5.0).floor()),
                settings.video_lossless_boost_offset - (speed / 5.0).floor(),
            )
        } else {
            (
                settings
                    .lossless_base_cap
                    .min(settings.lossless_base_offset + speed / 5.0),
                settings.lossless_pixel_boost,
            )
        };
        let smult = ((speed - 50.0) / 5.0).max(0.25);
        let qmult = (quality as f64 / 20.0).max(0.0);
        let class = if flags.is_transient_class() { 3.0 } else { 1.0 };
        Self {
            rgb_threshold: (settings.rgb_threshold_base * smult * qmult * class) as u64,
            lossless_base,
            lossless_pixel_boost,
            max_nonvideo_pixels: settings.max_nonvideo_pixels,
            video_sustain_frames: settings.video_sustain_frames,
            video_frame_cap: settings.video_frame_cap,
            webp_min_pixels: settings.webp_min_pixels,
        }
    }

    /// Quality at or above which a region of `pixel_count` goes lossless.
    pub fn lossless_quality(&self, pixel_count: u64, window_area: u64) -> f64 {
        let ratio = pixel_count as f64 / window_area.max(1) as f64;
        (self.lossless_base + self.lossless_pixel_boost * ratio).min(100.0)
    }
}

// ── SelectionInput ───────────────────────────────────────────────

/// Video-related state of the window at selection time.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoContext {
    pub limits: VideoLimits,
    /// A video pipeline is currently built.
    pub active: bool,
    pub recently_resized: bool,
    /// Damaged pixels over the sustain window.
    pub recent_pixels: u64,
    /// Encode items created so far for this window.
    pub sequence: u64,
    /// Detected video region, if any.
    pub region: Option<Rectangle>,
}

/// Everything [`select_encoding`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    pub pixel_count: u64,
    pub window_width: u32,
    pub window_height: u32,
    /// Speed and quality requested for this region.
    pub speed: u8,
    pub quality: u8,
    /// The controller's current values; differing values mean an override.
    pub current_speed: u8,
    pub current_quality: u8,
    /// The window's configured encoding.
    pub configured: Encoding,
    pub strict: bool,
    pub flags: WindowFlags,
    pub want_alpha: bool,
    pub allow_video: bool,
    pub allow_mmap: bool,
    pub video: VideoContext,
    /// Encodings both sides support, in preference order.
    pub common: &'a [Encoding],
}

impl SelectionInput<'_> {
    fn has(&self, e: Encoding) -> bool {
        self.common.contains(&e)
    }

    fn non_video(&self) -> impl Iterator<Item = Encoding> + '_ {
        self.common
            .iter()
            .copied()
            .filter(|e| !e.is_video() && *e != Encoding::Mmap && *e != Encoding::Scroll)
    }

    fn area(&self) -> u64 {
        self.window_width as u64 * self.window_height as u64
    }
}

// ── Selection ────────────────────────────────────────────────────

/// Pick the encoding for one region.
pub fn select_encoding(input: &SelectionInput<'_>, t: &SelectionThresholds) -> Encoding {
    if input.allow_mmap && input.has(Encoding::Mmap) {
        return Encoding::Mmap;
    }
    let configured = input.configured;
    if configured == Encoding::PngL {
        // greyscale looks awful mixed with anything else
        return configured;
    }
    if input.strict {
        return strict_encoding(input);
    }
    if input.want_alpha {
        return transparent_encoding(input, t);
    }
    if matches!(configured, Encoding::Rgb24 | Encoding::Rgb32) {
        if input.has(Encoding::Rgb24) {
            return Encoding::Rgb24;
        }
        if input.has(Encoding::Rgb32) {
            return Encoding::Rgb32;
        }
    }
    video_or_still(input, t)
}

fn strict_encoding(input: &SelectionInput<'_>) -> Encoding {
    let configured = input.configured;
    if matches!(configured, Encoding::Rgb24 | Encoding::Rgb32) {
        return if input.want_alpha && input.has(Encoding::Rgb32) {
            Encoding::Rgb32
        } else {
            Encoding::Rgb24
        };
    }
    if input.want_alpha && !configured.supports_alpha() {
        // the alpha-capable sibling of the pinned encoding
        if let Some(alt) = [Encoding::Webp, Encoding::Png, Encoding::Rgb32]
            .into_iter()
            .find(|e| input.has(*e))
        {
            return alt;
        }
    }
    configured
}

fn transparent_encoding(input: &SelectionInput<'_>, t: &SelectionThresholds) -> Encoding {
    let configured = input.configured;
    if matches!(configured, Encoding::Rgb24 | Encoding::Rgb32) && input.has(Encoding::Rgb32) {
        return Encoding::Rgb32;
    }
    if matches!(configured, Encoding::Png | Encoding::Webp | Encoding::PngP) {
        // keep the alpha encoder stable to avoid alpha bleeding
        return configured;
    }
    let (q, s, px) = (input.quality as f64, input.speed as f64, input.pixel_count);
    if input.has(Encoding::Rgb32) && (px < t.rgb_threshold || (q >= 90.0 && s >= 90.0)) {
        return Encoding::Rgb32;
    }
    if input.has(Encoding::Webp) {
        let max_webp = 1024.0 * 1024.0 * (200.0 - q) / 100.0 * s / 100.0;
        if px > t.webp_min_pixels && (px as f64) < max_webp {
            return Encoding::Webp;
        }
    }
    if input.has(Encoding::Png) && q > 75.0 {
        return Encoding::Png;
    }
    [Encoding::Rgb32, Encoding::Png, Encoding::Webp]
        .into_iter()
        .find(|e| input.has(*e))
        .unwrap_or(configured)
}

fn video_or_still(input: &SelectionInput<'_>, t: &SelectionThresholds) -> Encoding {
    let current = input.configured;
    let nonvideo = |q: i32| {
        let q = q.clamp(0, 100) as u8;
        best_still(input, t, input.pixel_count, input.speed, q)
    };
    if input.non_video().next().is_none() {
        return current;
    }
    let v = &input.video;
    let rgb_max = v.region.map_or(t.rgb_threshold, |r| t.rgb_threshold.min(r.area() / 2));
    if input.pixel_count <= rgb_max {
        return nonvideo(100);
    }
    let q = input.quality as i32;
    if !current.is_video() || !input.allow_video || !input.has(current) {
        return nonvideo(q);
    }
    let (cww, cwh) = v.limits.masked(input.window_width, input.window_height);
    let frame = cww as u64 * cwh as u64;
    if frame <= t.max_nonvideo_pixels || !v.limits.fits(cww, cwh) {
        return nonvideo(q);
    }
    if v.recently_resized {
        // may still be resizing
        return nonvideo(q - 30);
    }
    if v.recent_pixels < t.video_sustain_frames * frame.min(t.video_frame_cap) {
        return nonvideo(q);
    }
    if input.quality != input.current_quality || input.speed != input.current_speed {
        // an override should not force a pipeline rebuild
        return nonvideo(q);
    }
    if let Some(r) = v.region {
        if v.limits.masked(r.width, r.height) != (cww, cwh) {
            // around a video the rest changes less often
            return nonvideo(q + 30);
        }
    }
    let factors = [
        ((input.speed as f64 - 75.0) / 5.0).max(1.0),
        if input.flags.is_transient_class() { 3.0 } else { 1.0 },
        (10.0 - v.sequence as f64).max(1.0),
        1.0 / (v.active as u8 as f64 + 1.0),
    ];
    let max_nvp = factors.iter().product::<f64>() * t.max_nonvideo_pixels as f64;
    if (input.pixel_count as f64) <= max_nvp {
        return nonvideo(q);
    }
    current
}

/// Best still (non-video) encoding at the given speed and quality.
pub fn best_still(
    input: &SelectionInput<'_>,
    t: &SelectionThresholds,
    pixel_count: u64,
    speed: u8,
    quality: u8,
) -> Encoding {
    let has = |e: Encoding| input.has(e) && !e.is_video();
    if pixel_count < t.rgb_threshold {
        if has(Encoding::Rgb24) {
            return Encoding::Rgb24;
        }
        if has(Encoding::Rgb32) {
            return Encoding::Rgb32;
        }
    }
    let (q, s) = (quality as f64, speed as f64);
    let max_webp = 1024.0 * 1024.0 * (200.0 - q) / 100.0 * s / 100.0;
    if q < t.lossless_quality(pixel_count, input.area()) {
        if has(Encoding::Jpeg) {
            return Encoding::Jpeg;
        }
        if has(Encoding::Webp) && pixel_count > t.webp_min_pixels && s > 30.0 && (pixel_count as f64) < max_webp {
            return Encoding::Webp;
        }
    } else {
        if has(Encoding::Webp)
            && (q < 100.0 || s >= 50.0)
            && pixel_count > t.webp_min_pixels
            && (pixel_count as f64) < max_webp
        {
            return Encoding::Webp;
        }
        if s > 75.0 {
            if has(Encoding::Rgb24) {
                return Encoding::Rgb24;
            }
            if has(Encoding::Rgb32) {
                return Encoding::Rgb32;
            }
        }
        if has(Encoding::Png) {
            return Encoding::Png;
        }
    }
    input.non_video().next().unwrap_or(input.configured)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const COMMON: &[Encoding] = &[
        Encoding::H264,
        Encoding::Png,
        Encoding::Webp,
        Encoding::Rgb24,
        Encoding::Rgb32,
        Encoding::Jpeg,
    ];

    fn make_input(pixel_count: u64) -> SelectionInput<'static> {
        SelectionInput {
            pixel_count,
            window_width: 800,
            window_height: 600,
            speed: 50,
            quality: 90,
            current_speed: 50,
            current_quality: 90,
            configured: Encoding::H264,
            strict: false,
            flags: WindowFlags::empty(),
            want_alpha: false,
            allow_video: true,
            allow_mmap: false,
            video: VideoContext::default(),
            common: COMMON,
        }
    }

    fn thresholds(input: &SelectionInput<'_>) -> SelectionThresholds {
        SelectionThresholds::compute(
            &SelectorSettings::default(),
            input.current_speed,
            input.current_quality,
            input.flags,
            input.video.active,
        )
    }

    #[test]
    fn rgb_threshold_shape() {
        let s = SelectorSettings::default();
        let base = SelectionThresholds::compute(&s, 50, 90, WindowFlags::empty(), false);
        assert_eq!(base.rgb_threshold, 4608);
        let fast = SelectionThresholds::compute(&s, 100, 90, WindowFlags::empty(), false);
        assert!(fast.rgb_threshold > base.rgb_threshold);
        let tray = SelectionThresholds::compute(&s, 50, 90, WindowFlags::TRAY, false);
        assert_eq!(tray.rgb_threshold, base.rgb_threshold * 3);
    }

    #[test]
    fn small_regions_are_rgb() {
        let input = make_input(10 * 10);
        assert_eq!(select_encoding(&input, &thresholds(&input)), Encoding::Rgb24);
    }

    #[test]
    fn single_full_frame_is_still_lossy_at_q90() {
        let input = make_input(800 * 600);
        let enc = select_encoding(&input, &thresholds(&input));
        assert_eq!(enc, Encoding::Jpeg);
    }

    #[test]
    fn high_quality_goes_lossless() {
        let mut input = make_input(100 * 100);
        input.quality = 100;
        input.current_quality = 100;
        let enc = select_encoding(&input, &thresholds(&input));
        assert!(enc.is_lossless(), "{enc}");
    }

    #[test]
    fn sustained_damage_keeps_video() {
        let mut input = make_input(800 * 600);
        input.video.recent_pixels = 10 * 800 * 600;
        input.video.sequence = 50;
        assert_eq!(select_encoding(&input, &thresholds(&input)), Encoding::H264);
        input.video.recently_resized = true;
        assert!(!select_encoding(&input, &thresholds(&input)).is_video());
    }

    #[test]
    fn video_region_keeps_the_rest_off_video() {
        let mut input = make_input(800 * 600);
        input.video.recent_pixels = 10 * 800 * 600;
        input.video.sequence = 50;
        input.video.region = Some(Rectangle::new(100, 100, 320, 240));
        let enc = select_encoding(&input, &thresholds(&input));
        assert!(!enc.is_video(), "{enc}");
        input.video.region = Some(Rectangle::sized(800, 600));
        assert_eq!(select_encoding(&input, &thresholds(&input)), Encoding::H264);
    }

    #[test]
    fn quality_override_avoids_video() {
        let mut input = make_input(800 * 600);
        input.video.recent_pixels = 10 * 800 * 600;
        input.video.sequence = 50;
        input.quality = 100;
        assert!(!select_encoding(&input, &thresholds(&input)).is_video());
    }

    #[test]
    fn mmap_first_and_strict_pins() {
        let common = [Encoding::Mmap, Encoding::Jpeg, Encoding::Png];
        let mut input = make_input(800 * 600);
        input.common = &common;
        input.allow_mmap = true;
        let t = thresholds(&input);
        assert_eq!(select_encoding(&input, &t), Encoding::Mmap);
        input.allow_mmap = false;
        input.strict = true;
        input.configured = Encoding::Jpeg;
        assert_eq!(select_encoding(&input, &t), Encoding::Jpeg);
        input.want_alpha = true;
        assert_eq!(select_encoding(&input, &t), Encoding::Png);
    }

    #[test]
    fn deterministic() {
        let mut input = make_input(300 * 200);
        input.video.recent_pixels = 123_456;
        let t = thresholds(&input);
        let first = select_encoding(&input, &t);
        for _ in 0..10 {
            assert_eq!(select_encoding(&input, &t), first);
        }
    }
}
