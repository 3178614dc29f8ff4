//! Error types for the encoding engine.
//!
//! Nothing in here tears down a connection: capture and codec failures
//! degrade a single window (fallback encoding, pipeline rebuild, or a
//! dropped item) and the engine keeps going.

use thiserror::Error;

use crate::encoding::Encoding;
use crate::types::WindowId;

/// The canonical error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Capture Errors ───────────────────────────────────────────
    /// The window disappeared while its pixels were being read.
    #[error("window {window} is no longer available for capture")]
    CaptureUnavailable { window: WindowId },

    // ── Codec Errors ─────────────────────────────────────────────
    /// No scored pipeline candidate could be instantiated.
    #[error("no usable {encoding} pipeline: {reason}")]
    CodecSetupFailed { encoding: Encoding, reason: String },

    /// An encoder failed while compressing a frame.
    #[error("codec failure: {0}")]
    CodecRuntime(#[from] CodecError),

    /// A video encode was requested without a pipeline in place.
    #[error("no video pipeline for {encoding}")]
    NoPipeline { encoding: Encoding },

    // ── Local Errors ─────────────────────────────────────────────
    /// Dimensions that no component can work with.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// The window id is not managed by this engine.
    #[error("unknown window {0}")]
    UnknownWindow(WindowId),

    /// An encoding name the engine does not know about.
    #[error("unknown encoding {0:?}")]
    UnknownEncoding(String),

    // ── Channel Errors ───────────────────────────────────────────
    /// A hand-off channel between contexts was closed.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// A statistics snapshot or config could not be serialised.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── CodecError ───────────────────────────────────────────────────

/// Failure reported by a codec or colour-space converter.
///
/// Transient errors mean "try the next candidate"; fatal errors make the
/// candidate unusable for the rest of the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("transient codec error: {0}")]
    Transient(String),

    #[error("fatal codec error: {0}")]
    Fatal(String),
}

impl CodecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CodecError::Transient(_))
    }
}

// ── CaptureError ─────────────────────────────────────────────────

/// Failure reported by the pixel capture backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no such window: {0}")]
    NoSuchWindow(WindowId),

    #[error("capture failed: {0}")]
    Failed(String),
}

impl From<CaptureError> for EngineError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::NoSuchWindow(window) => EngineError::CaptureUnavailable { window },
            CaptureError::Failed(msg) => EngineError::Other(msg),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EngineError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        EngineError::ChannelClosed
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = EngineError::InvalidDimensions {
            width: 0,
            height: 720,
        };
        assert!(e.to_string().contains("0x720"));

        let e = EngineError::CodecSetupFailed {
            encoding: Encoding::H264,
            reason: "all candidates failed".into(),
        };
        assert!(e.to_string().contains("h264"));
    }

    #[test]
    fn capture_error_maps_to_unavailable() {
        let e: EngineError = CaptureError::NoSuchWindow(7).into();
        assert!(matches!(e, EngineError::CaptureUnavailable { window: 7 }));
    }

    #[test]
    fn codec_error_kinds() {
        assert!(CodecError::Transient("busy".into()).is_transient());
        assert!(!CodecError::Fatal("gone".into()).is_transient());
        let e: EngineError = CodecError::Fatal("x".into()).into();
        assert!(matches!(e, EngineError::CodecRuntime(_)));
    }

    #[test]
    fn from_string() {
        let e: EngineError = "something broke".into();
        assert!(matches!(e, EngineError::Other(_)));
    }
}
