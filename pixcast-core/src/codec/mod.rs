//! Still-image encoders.
//!
//! Every non-video encoding sits behind the same small
//! [`StillEncoder`] interface. Raw RGB and shared-memory output are built
//! in; everything else (png, jpeg, webp...) comes from the codec
//! registry.

pub mod rgb;

use std::sync::Arc;

use bytes::Bytes;

use crate::encoding::Encoding;
use crate::error::CodecError;
use crate::pipeline::spec::{
    CodecRegistry, CscConverter, CscParams, CscSpec, EncoderParams, EncoderSpec, VideoEncoder,
};
use crate::types::{ImageBuffer, PixelFormat};

pub use rgb::{MmapEncoder, RgbEncoder};

/// Output of a still-image encode.
#[derive(Debug, Clone)]
pub struct StillFrame {
    pub encoding: Encoding,
    pub data: Bytes,
    /// Row stride of raw payloads, 0 for compressed images.
    pub row_stride: u32,
    /// Quality actually used, for lossy codecs.
    pub quality: Option<u8>,
    /// Chroma subsampling, for codecs that subsample.
    pub csc: Option<PixelFormat>,
}

pub trait StillEncoder: Send + Sync {
    fn encoding(&self) -> Encoding;
    fn encode(&self, image: &ImageBuffer, quality: u8, speed: u8) -> Result<StillFrame, CodecError>;
}

// ── StillCodecs ──────────────────────────────────────────────────

/// Resolves an encoding to an encoder: registry first, built-ins second.
#[derive(Clone)]
pub struct StillCodecs {
    registry: Arc<dyn CodecRegistry>,
    builtin: Vec<Arc<dyn StillEncoder>>,
}

impl StillCodecs {
    pub fn new(registry: Arc<dyn CodecRegistry>) -> Self {
        Self {
            registry,
            builtin: vec![
                Arc::new(RgbEncoder::new(Encoding::Rgb24)),
                Arc::new(RgbEncoder::new(Encoding::Rgb32)),
                Arc::new(MmapEncoder),
            ],
        }
    }

    pub fn get(&self, encoding: Encoding) -> Option<Arc<dyn StillEncoder>> {
        if encoding.is_video() || encoding == Encoding::Scroll {
            return None;
        }
        self.registry
            .still_encoder(encoding)
            .or_else(|| self.builtin.iter().find(|e| e.encoding() == encoding).cloned())
    }

    pub fn has(&self, encoding: Encoding) -> bool {
        self.get(encoding).is_some()
    }

    /// First encoding of `order` that is both available here and in `allowed`.
    pub fn first_of(&self, order: &[Encoding], allowed: &[Encoding]) -> Option<Arc<dyn StillEncoder>> {
        order
            .iter()
            .filter(|e| allowed.contains(e) && **e != Encoding::Mmap)
            .find_map(|e| self.get(*e))
    }
}

impl std::fmt::Debug for StillCodecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StillCodecs")
            .field("builtin", &self.builtin.iter().map(|e| e.encoding()).collect::<Vec<_>>())
            .finish()
    }
}

// ── BuiltinRegistry ──────────────────────────────────────────────

/// A registry without any external codec: only the built-in raw and
/// shared-memory encodings work, every video request falls back.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinRegistry;

impl CodecRegistry for BuiltinRegistry {
    fn encoder_specs(&self, _encoding: Encoding) -> Vec<EncoderSpec> {
        Vec::new()
    }

    fn csc_specs(&self, _src_format: PixelFormat) -> Vec<CscSpec> {
        Vec::new()
    }

    fn make_csc(
        &self,
        spec: &CscSpec,
        _params: &CscParams,
    ) -> Result<Box<dyn CscConverter>, CodecError> {
        Err(CodecError::Fatal(format!("no converter {}", spec.codec_type)))
    }

    fn make_encoder(
        &self,
        spec: &EncoderSpec,
        _params: &EncoderParams,
    ) -> Result<Box<dyn VideoEncoder>, CodecError> {
        Err(CodecError::Fatal(format!("no encoder {}", spec.codec_type)))
    }

    fn still_encoder(&self, _encoding: Encoding) -> Option<Arc<dyn StillEncoder>> {
        None
    }
}

// ── Tests ────────────────────────────────────────────────────────
