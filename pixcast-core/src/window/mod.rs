//! Hand-off types between the capture context and the encode context.
//!
//! The capture context produces [`WorkItem`]s, the encode context turns
//! them into [`EncodeOutcome`]s. Neither side touches the other's state:
//! the only things they share are the cancellation watermark and the
//! delta epoch, both plain atomics.

pub mod encoder;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::batch::DamageOptions;
use crate::encoding::Encoding;
use crate::packet::DrawPacket;
use crate::pipeline::ScalingHint;
use crate::selector::VideoLimits;
use crate::stats::EncodeSample;
use crate::types::{ImageBuffer, WindowId};

pub use encoder::{EncoderSettings, WindowEncoder};

// ── CancelWatermark ──────────────────────────────────────────────

/// Items at or below the watermark must not produce output.
#[derive(Debug, Clone, Default)]
pub struct CancelWatermark(Arc<AtomicU64>);

impl CancelWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every item up to and including `sequence`.
    pub fn raise(&self, sequence: u64) {
        self.0.fetch_max(sequence, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self, sequence: u64) -> bool {
        sequence <= self.0.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ── WorkItem ─────────────────────────────────────────────────────

/// One captured region ready to be compressed.
#[derive(Debug)]
pub struct EncodeItem {
    pub window: WindowId,
    /// Item sequence, compared against the watermark.
    pub sequence: u64,
    pub damage_time: Instant,
    pub image: ImageBuffer,
    pub encoding: Encoding,
    /// Still encoding to use when the video path cannot.
    pub fallback: Encoding,
    pub window_width: u32,
    pub window_height: u32,
    pub quality: u8,
    pub speed: u8,
    pub min_quality: u8,
    pub min_speed: u8,
    /// Packets still to come in this flush group after this item.
    pub flush: u32,
    pub options: DamageOptions,
    pub hint: ScalingHint,
}

#[derive(Debug)]
pub enum WorkItem {
    Encode(EncodeItem),
    /// Drain frames the video encoder is holding back.
    FlushVideo {
        window: WindowId,
        sequence: u64,
        frame: u64,
    },
    /// Drop the pipeline and scroll history, after a client decode error.
    ResetPipeline { window: WindowId },
    /// The window is gone; release its encoder.
    Close { window: WindowId },
}

impl WorkItem {
    pub fn window(&self) -> WindowId {
        match self {
            WorkItem::Encode(item) => item.window,
            WorkItem::FlushVideo { window, .. }
            | WorkItem::ResetPipeline { window }
            | WorkItem::Close { window } => *window,
        }
    }

    /// Pixels of captured data the item carries.
    pub fn pixels(&self) -> u64 {
        match self {
            WorkItem::Encode(item) => item.image.pixel_count(),
            _ => 0,
        }
    }
}

// ── EncodeOutcome ────────────────────────────────────────────────

/// Something the capture context has to act on after an encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeEvent {
    /// The encoder holds `delayed` frames back; `frame` was the last one fed.
    DelayedFrames { delayed: u32, frame: u64 },
    /// The pipeline was dropped; refresh the window without video.
    RefreshWithoutVideo,
    /// No pipeline could be built for the encoding.
    VideoUnavailable { encoding: Encoding },
}

/// Video pipeline state as seen from the capture context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoStatus {
    pub active: bool,
    pub limits: VideoLimits,
}

#[derive(Debug, Default)]
pub struct EncodeOutcome {
    pub window: WindowId,
    pub sequence: u64,
    pub damage_time: Option<Instant>,
    /// Packets in send order; sequence numbers are assigned on completion.
    pub packets: Vec<DrawPacket>,
    pub events: Vec<EncodeEvent>,
    pub samples: Vec<EncodeSample>,
    /// Pixels the item carried, for backlog accounting.
    pub pixels: u64,
    /// Counted against the window's encode backlog.
    pub counted: bool,
    pub cancelled: bool,
    pub video: VideoStatus,
}
