//! Engine tuning.
//!
//! Every empirically tuned coefficient of the scheduler, controller,
//! selector and pipeline lives here so it can be overridden from a TOML
//! file. The defaults reproduce the behaviour the engine was tuned with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch: BatchSettings,
    pub selector: SelectorSettings,
    pub delta: DeltaSettings,
    pub scroll: ScrollSettings,
    pub refresh: RefreshSettings,
    pub subregion: SubregionSettings,
    pub av_sync: AvSyncSettings,
    pub video: VideoSettings,
    pub controller: ControllerSettings,
}

/// Damage batching template and region packing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Always batch, never send immediately.
    pub always: bool,
    /// Batch every damage even when the delay is at its minimum.
    pub force_batch: bool,
    pub min_delay_ms: u64,
    pub start_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Hard timeout for a batch waiting on acks.
    pub timeout_delay_ms: u64,
    /// Events per `time_unit` before batching is forced on.
    pub max_events: u32,
    /// Pixels per `time_unit` before batching is forced on.
    pub max_pixels: u64,
    pub time_unit_ms: u64,
    /// Soft re-arms before falling back to the hard timeout.
    pub max_soft_expired: u32,
    /// Pending rectangles beyond which a full frame is sent.
    pub max_regions: usize,
    /// Windows at or below this area are always sent whole.
    pub min_window_area: u64,
    /// Fixed per-packet overhead, in pixel-equivalents.
    pub packet_cost: u64,
    /// Percentage of the window's bytes above which a full frame is cheaper.
    pub max_bytes_percent: u64,
    /// Recent sends used by the force-batch test.
    pub force_batch_events: usize,
    /// Window for the force-batch test.
    pub force_batch_window_ms: u64,
    /// Batch harder for this long after a resize.
    pub resize_window_ms: u64,
    /// Encodes in flight before an immediate send is refused.
    pub max_pending_encodes: usize,
    /// Delay history kept per window.
    pub history: usize,
}

/// Encoding selection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    /// Base pixel budget for uncompressed rgb.
    pub rgb_threshold_base: f64,
    /// Pixel count at or below which video is never used.
    pub max_nonvideo_pixels: u64,
    /// Lossless threshold base is `min(cap, offset + speed / 5)`.
    pub lossless_base_cap: f64,
    pub lossless_base_offset: f64,
    pub lossless_pixel_boost: f64,
    /// Same two coefficients once a video encoding is active.
    pub video_lossless_base_cap: f64,
    pub video_lossless_base_offset: f64,
    pub video_lossless_boost_offset: f64,
    /// Sustained damage required to keep (or pick) a video encoding.
    pub video_sustain_ms: u64,
    pub video_sustain_frames: u64,
    /// Full-frame equivalent is capped at this many pixels.
    pub video_frame_cap: u64,
    /// Non-video is forced for this long after a resize.
    pub video_resize_ms: u64,
    /// Smallest region worth sending as webp.
    pub webp_min_pixels: u64,
}

/// Xor-delta cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaSettings {
    pub enabled: bool,
    /// Regions must be strictly larger than this.
    pub min_pixels: u64,
    /// ...and strictly smaller than this.
    pub max_pixels: u64,
    pub max_hits: u32,
    pub max_buckets: usize,
    /// A delta that compresses worse than this percentage of the raw
    /// size invalidates its bucket.
    pub poor_payoff_percent: u64,
}

/// Scroll detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollSettings {
    pub enabled: bool,
    /// Minimum consecutive matching lines for a distance to count.
    pub min_run: usize,
    /// Largest shift (in lines) considered.
    pub max_distance: usize,
    /// Percentage of the frame's lines a scroll must explain.
    pub min_percent: u64,
    /// Distinct shifts turned into copy rectangles.
    pub max_regions: usize,
    /// Copy rectangles per packet.
    pub max_copies: usize,
}

/// Lossless auto-refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub enabled: bool,
    /// Base delay before a lossy region is refreshed.
    pub delay_ms: u64,
    pub min_delay_ms: u64,
    /// The timer fires once less than this remains.
    pub fire_slack_ms: u64,
    pub quality: u8,
    pub speed: u8,
    /// Delay of the full refresh that follows a client decode error.
    pub decode_error_delay_ms: u64,
}

/// Detection of a video playing inside part of a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubregionSettings {
    pub enabled: bool,
    /// Damage history looked at by each detection pass.
    pub max_time_ms: u64,
    /// Detection needs more events than this in that history.
    pub min_events: usize,
    pub min_width: u32,
    pub min_height: u32,
    /// Slivers smaller than this outside a merged band are not held against it.
    pub ignore_pixels: u64,
    /// Lossy video frames are refreshed no sooner than this.
    pub refresh_min_delay_ms: u64,
    /// Extra quality and speed for still regions around the video.
    pub quality_boost: u8,
    pub speed_boost: u8,
}

/// Audio/video synchronisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvSyncSettings {
    pub enabled: bool,
    /// Largest change of the delay per tick.
    pub step_ms: u32,
    pub interval_ms: u64,
    /// Presentation delay per frame held back by the encoder.
    pub frame_delay_ms: u32,
}

/// Video pipeline construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Scored options are reused for this long.
    pub options_cache_ms: u64,
    /// Rescoring is rate limited to this interval.
    pub rescore_interval_ms: u64,
    /// Delayed-frame flush is `batch delay * multiplier`, clamped.
    pub flush_multiplier: u64,
    pub flush_min_ms: u64,
    pub flush_max_ms: u64,
    /// Send right/bottom edges of unaligned windows as still images.
    pub split_edges: bool,
    /// Allow automatic downscaling heuristics.
    pub scaling: bool,
}

/// Quality/speed feedback and batch-delay recalculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub history: usize,
    /// Pixels sent before a window asks for a recalculation.
    pub min_pixels_recalculate: u64,
    /// Recalculations happen at most this often.
    pub recalculate_interval_ms: u64,
    /// A quiet window with a low delay is left alone for this long.
    pub quiet_skip_secs: u64,
    /// "Quiet" means fewer pixels than this since the last update.
    pub quiet_pixels: u64,
    pub min_speed: u8,
    pub min_quality: u8,
    pub speed_twa_offset: f64,
    pub speed_twa_power: f64,
    pub quality_twa_offset: f64,
    pub quality_twa_power: f64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            always: false,
            force_batch: false,
            min_delay_ms: 5,
            start_delay_ms: 50,
            max_delay_ms: 500,
            timeout_delay_ms: 15_000,
            max_events: 50,
            max_pixels: 1024 * 1024 * 50,
            time_unit_ms: 1000,
            max_soft_expired: 5,
            max_regions: 40,
            min_window_area: 1024,
            packet_cost: 1024,
            max_bytes_percent: 60,
            force_batch_events: 5,
            force_batch_window_ms: 10,
            resize_window_ms: 250,
            max_pending_encodes: 10,
            history: 64,
        }
    }
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            rgb_threshold_base: 4096.0,
            max_nonvideo_pixels: 4096,
            lossless_base_cap: 95.0,
            lossless_base_offset: 75.0,
            lossless_pixel_boost: 20.0,
            video_lossless_base_cap: 80.0,
            video_lossless_base_offset: 10.0,
            video_lossless_boost_offset: 90.0,
            video_sustain_ms: 2000,
            video_sustain_frames: 5,
            video_frame_cap: 640 * 480,
            video_resize_ms: 350,
            webp_min_pixels: 16384,
        }
    }
}

impl Default for DeltaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_pixels: 1024,
            max_pixels: 32768,
            max_hits: 20,
            max_buckets: 25,
            poor_payoff_percent: 40,
        }
    }
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_run: 2,
            max_distance: 500,
            min_percent: 40,
            max_regions: 50,
            max_copies: 1000,
        }
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 150,
            min_delay_ms: 50,
            fire_slack_ms: 50,
            quality: 100,
            speed: 50,
            decode_error_delay_ms: 250,
        }
    }
}

impl Default for SubregionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_time_ms: 5000,
            min_events: 20,
            min_width: 128,
            min_height: 96,
            ignore_pixels: 48 * 48,
            refresh_min_delay_ms: 150,
            quality_boost: 40,
            speed_boost: 25,
        }
    }
}

impl Default for AvSyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            step_ms: 20,
            interval_ms: 500,
            frame_delay_ms: 40,
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            options_cache_ms: 1000,
            rescore_interval_ms: 750,
            flush_multiplier: 10,
            flush_min_ms: 100,
            flush_max_ms: 500,
            split_edges: true,
            scaling: true,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            history: 100,
            min_pixels_recalculate: 2000,
            recalculate_interval_ms: 1000,
            quiet_skip_secs: 60,
            quiet_pixels: 100_000,
            min_speed: 0,
            min_quality: 0,
            speed_twa_offset: 1.0,
            speed_twa_power: 1.1,
            quality_twa_offset: 0.1,
            quality_twa_power: 1.2,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

impl BatchSettings {
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }

    pub fn timeout_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_delay_ms)
    }
}

impl EngineConfig {
    /// Clamp values that would make the engine misbehave.
    pub fn sanitized(mut self) -> Self {
        let b = &mut self.batch;
        b.min_delay_ms = b.min_delay_ms.max(1);
        b.max_delay_ms = b.max_delay_ms.max(b.min_delay_ms);
        b.start_delay_ms = b.start_delay_ms.clamp(b.min_delay_ms, b.max_delay_ms);
        b.history = b.history.max(5);
        b.max_regions = b.max_regions.max(1);
        self.delta.max_buckets = self.delta.max_buckets.min(25);
        self.controller.history = self.controller.history.max(1);
        self.refresh.quality = self.refresh.quality.min(100);
        self.refresh.speed = self.refresh.speed.min(100);
        self.video.flush_max_ms = self.video.flush_max_ms.max(self.video.flush_min_ms);
        self.subregion.min_width = self.subregion.min_width.max(1);
        self.subregion.min_height = self.subregion.min_height.max(1);
        self
    }
}
