//! Logical draw packets handed to the transport.
//!
//! Wire framing is the transport's business; this is only the shape of
//! one screen update and the hints the client needs to paint it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::encoding::Encoding;
use crate::types::{PixelFormat, WindowId};

// ── CodecOptions ─────────────────────────────────────────────────

/// Per-packet hints for the client decoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecOptions {
    /// Delta bucket the payload was xor-ed against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<u64>,
    /// Bucket the client must store the decoded pixels into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<usize>,
    /// Store identifier for future deltas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<u64>,
    /// Colour subsampling used by the video pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csc: Option<PixelFormat>,
    /// Encoded picture size when the pipeline downscaled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaled_size: Option<(u32, u32)>,
    /// Packets still to come in this flush group (0 = last).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<u32>,
    /// `Some(false)` when the client should decode but not paint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paint: Option<bool>,
    /// Quality the payload was encoded at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    /// Presentation delay the client should apply, in ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub av_sync_delay: Option<u32>,
    /// Video frame number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
    /// Sent by the refresh timer rather than by damage.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub refresh: bool,
}

// ── ScrollCopy ───────────────────────────────────────────────────

/// One copy instruction of a `scroll` packet: move the lines
/// `[y, y + height)` of the rectangle at `x, width` by `dy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollCopy {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub dx: i32,
    pub dy: i32,
}

// ── DrawPacket ───────────────────────────────────────────────────

/// A single screen update for one window.
#[derive(Debug, Clone)]
pub struct DrawPacket {
    pub window_id: WindowId,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub encoding: Encoding,
    pub payload: Bytes,
    /// Damage sequence this packet belongs to; acked by the client.
    pub sequence: u64,
    /// Row stride of raw payloads, 0 for compressed ones.
    pub row_stride: u32,
    pub codec_options: CodecOptions,
}

impl DrawPacket {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Serialise a list of scroll copies as the payload of a `scroll` packet.
pub fn scroll_payload(copies: &[ScrollCopy]) -> Bytes {
    let mut out = Vec::with_capacity(copies.len() * 24);
    for c in copies {
        out.extend_from_slice(&c.x.to_le_bytes());
        out.extend_from_slice(&c.y.to_le_bytes());
        out.extend_from_slice(&c.width.to_le_bytes());
        out.extend_from_slice(&c.height.to_le_bytes());
        out.extend_from_slice(&c.dx.to_le_bytes());
        out.extend_from_slice(&c.dy.to_le_bytes());
    }
    Bytes::from(out)
}
