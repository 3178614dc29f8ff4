//! Codec descriptions and the interfaces concrete codecs implement.
//!
//! The engine never links a codec library itself. A [`CodecRegistry`]
//! describes what is available ([`EncoderSpec`], [`CscSpec`]) and builds
//! instances on demand; the pipeline manager scores the descriptions and
//! instantiates the winner.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::StillEncoder;
use crate::encoding::Encoding;
use crate::error::CodecError;
use crate::types::{ImageBuffer, PixelFormat};

// ── Specs ────────────────────────────────────────────────────────

/// Capabilities of one video encoder implementation for one input format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSpec {
    pub encoding: Encoding,
    /// Implementation name, used to recognise a running instance.
    pub codec_type: String,
    pub input_format: PixelFormat,
    /// Subsampling modes the encoder can produce.
    pub output_colorspaces: Vec<PixelFormat>,
    pub has_lossless_mode: bool,
    /// Nominal quality and speed, 0..=100.
    pub quality: u8,
    pub speed: u8,
    /// How well large frames are handled (100 = no penalty).
    pub size_efficiency: u8,
    pub setup_cost: u8,
    pub score_boost: i32,
    pub width_mask: u32,
    pub height_mask: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub can_scale: bool,
}

impl EncoderSpec {
    /// A spec with permissive defaults; tests and simulated registries
    /// adjust the fields they care about.
    pub fn new(encoding: Encoding, codec_type: &str, input_format: PixelFormat) -> Self {
        Self {
            encoding,
            codec_type: codec_type.to_string(),
            input_format,
            output_colorspaces: vec![input_format.csc_equiv()],
            has_lossless_mode: false,
            quality: 50,
            speed: 50,
            size_efficiency: 60,
            setup_cost: 50,
            score_boost: 0,
            width_mask: 0xFFFE,
            height_mask: 0xFFFE,
            min_width: 16,
            min_height: 16,
            max_width: 4096,
            max_height: 4096,
            can_scale: false,
        }
    }
}

/// Capabilities of one colour-space converter for one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CscSpec {
    pub codec_type: String,
    pub input_format: PixelFormat,
    pub output_format: PixelFormat,
    pub quality: u8,
    pub speed: u8,
    pub setup_cost: u8,
    pub score_boost: i32,
    pub width_mask: u32,
    pub height_mask: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub can_scale: bool,
    /// Multiplier applied to the whole pipeline score (100 = neutral).
    pub runtime_factor: f64,
}

impl CscSpec {
    pub fn new(codec_type: &str, input_format: PixelFormat, output_format: PixelFormat) -> Self {
        Self {
            codec_type: codec_type.to_string(),
            input_format,
            output_format,
            quality: 100,
            speed: 80,
            setup_cost: 20,
            score_boost: 0,
            width_mask: 0xFFFE,
            height_mask: 0xFFFE,
            min_width: 2,
            min_height: 2,
            max_width: 16384,
            max_height: 16384,
            can_scale: true,
            runtime_factor: 100.0,
        }
    }
}

// ── Instance parameters ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CscParams {
    pub src_width: u32,
    pub src_height: u32,
    pub src_format: PixelFormat,
    pub dst_width: u32,
    pub dst_height: u32,
    pub dst_format: PixelFormat,
    pub speed: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub src_format: PixelFormat,
    /// Subsampling modes the client accepts.
    pub dst_formats: Vec<PixelFormat>,
    pub encoding: Encoding,
    pub quality: u8,
    pub speed: u8,
    /// Scaling the encoder applies itself, `(numerator, denominator)`.
    pub scaling: (u32, u32),
}

// ── Instances ────────────────────────────────────────────────────

/// Output of one video encoder call.
#[derive(Debug, Clone, Default)]
pub struct EncodedFrame {
    /// Empty when the encoder is holding the frame back.
    pub data: Bytes,
    pub frame: u64,
    /// Frames the encoder is holding back.
    pub delayed: u32,
    pub quality: Option<u8>,
    /// Set when the encoder scaled the picture itself.
    pub scaled_size: Option<(u32, u32)>,
}

pub trait VideoEncoder: Send {
    fn codec_type(&self) -> &str;
    fn encoding(&self) -> Encoding;
    fn src_format(&self) -> PixelFormat;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn compress(&mut self, image: &ImageBuffer, quality: u8, speed: u8) -> Result<EncodedFrame, CodecError>;
    /// Drain frames held back since `frame`.
    fn flush(&mut self, frame: u64) -> Result<Option<EncodedFrame>, CodecError>;
    fn clean(&mut self);
}

pub trait CscConverter: Send {
    fn codec_type(&self) -> &str;
    fn src_format(&self) -> PixelFormat;
    fn dst_format(&self) -> PixelFormat;
    fn src_size(&self) -> (u32, u32);
    fn dst_size(&self) -> (u32, u32);
    fn convert(&mut self, image: &ImageBuffer) -> Result<ImageBuffer, CodecError>;
    fn clean(&mut self);
}

/// Source of codec descriptions and instances.
pub trait CodecRegistry: Send + Sync {
    /// Every encoder able to produce `encoding`, for any input format.
    fn encoder_specs(&self, encoding: Encoding) -> Vec<EncoderSpec>;
    /// Converters accepting `src_format`.
    fn csc_specs(&self, src_format: PixelFormat) -> Vec<CscSpec>;
    fn make_csc(&self, spec: &CscSpec, params: &CscParams) -> Result<Box<dyn CscConverter>, CodecError>;
    fn make_encoder(&self, spec: &EncoderSpec, params: &EncoderParams) -> Result<Box<dyn VideoEncoder>, CodecError>;
    /// Still-image encoder for a non-video encoding, if the registry has one.
    fn still_encoder(&self, encoding: Encoding) -> Option<Arc<dyn StillEncoder>>;
}
