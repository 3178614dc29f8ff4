//! Built-in raw pixel encoders.
//!
//! `rgb24`/`rgb32` payloads are the packed pixels compressed with zstd;
//! `mmap` payloads are the packed pixels the transport copies into the
//! shared-memory area.

use bytes::Bytes;

use crate::codec::{StillEncoder, StillFrame};
use crate::encoding::Encoding;
use crate::error::CodecError;
use crate::types::ImageBuffer;

/// zstd level for a speed target: fastest at high speed, up to 9.
pub fn compression_level(speed: u8) -> i32 {
    (1 + (100 - speed.min(100) as i32) / 12).clamp(1, 9)
}

#[derive(Debug, Clone, Copy)]
pub struct RgbEncoder {
    encoding: Encoding,
}

impl RgbEncoder {
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    fn pack(&self, image: &ImageBuffer) -> (Vec<u8>, u32) {
        let pixels = image.packed_pixels();
        let bpp = image.format.bytes_per_pixel();
        if self.encoding == Encoding::Rgb24 && bpp == 4 {
            let mut out = Vec::with_capacity(pixels.len() / 4 * 3);
            for px in pixels.chunks_exact(4) {
                out.extend_from_slice(&px[..3]);
            }
            (out, image.width * 3)
        } else {
            (pixels, image.width * bpp as u32)
        }
    }
}

impl StillEncoder for RgbEncoder {
    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn encode(&self, image: &ImageBuffer, _quality: u8, speed: u8) -> Result<StillFrame, CodecError> {
        if image.format.is_yuv() {
            return Err(CodecError::Fatal(format!("{} cannot carry {}", self.encoding, image.format)));
        }
        let (raw, row_stride) = self.pack(image);
        let compressed = zstd::encode_all(raw.as_slice(), compression_level(speed))
            .map_err(|e| CodecError::Transient(format!("zstd encode failed: {e}")))?;
        Ok(StillFrame {
            encoding: self.encoding,
            data: Bytes::from(compressed),
            row_stride,
            quality: None,
            csc: None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MmapEncoder;

impl StillEncoder for MmapEncoder {
    fn encoding(&self) -> Encoding {
        Encoding::Mmap
    }

    fn encode(&self, image: &ImageBuffer, _quality: u8, _speed: u8) -> Result<StillFrame, CodecError> {
        let row_stride = image.row_bytes() as u32;
        Ok(StillFrame {
            encoding: Encoding::Mmap,
            data: Bytes::from(image.packed_pixels()),
            row_stride,
            quality: None,
            csc: None,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
