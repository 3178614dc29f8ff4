//! Software stand-ins for real codecs.
//!
//! The host has no libx264 or libwebp to link against, so this registry
//! provides codecs that behave like them where the engine can tell:
//! lossy stills shrink with quality, video encoders keep state between
//! frames (and can hold frames back), and the colour converter really
//! subsamples and scales. Everything is compressed with zstd so the
//! byte counts fed back into the engine's statistics are realistic.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use pixcast_core::codec::rgb::compression_level;
use pixcast_core::pipeline::{
    CodecRegistry, CscConverter, CscParams, CscSpec, EncodedFrame, EncoderParams, EncoderSpec, VideoEncoder,
};
use pixcast_core::{CodecError, Encoding, ImageBuffer, PixelFormat, Rectangle, StillEncoder, StillFrame};

/// Low bits dropped from every sample at a given quality.
fn quantize_shift(quality: u8) -> u32 {
    match quality {
        90.. => 0,
        70..=89 => 1,
        40..=69 => 2,
        20..=39 => 3,
        _ => 4,
    }
}

fn compress(data: &[u8], speed: u8) -> Result<Bytes, CodecError> {
    zstd::encode_all(data, compression_level(speed))
        .map(Bytes::from)
        .map_err(|e| CodecError::Transient(format!("zstd: {e}")))
}

// ── Stills ───────────────────────────────────────────────────────

/// Lossy still codec: quantizes by quality before compressing.
#[derive(Debug, Clone, Copy)]
pub struct LossyStill {
    encoding: Encoding,
}

impl StillEncoder for LossyStill {
    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn encode(&self, image: &ImageBuffer, quality: u8, speed: u8) -> Result<StillFrame, CodecError> {
        let mask = 0xFFu8 << quantize_shift(quality);
        let pixels: Vec<u8> = image.packed_pixels().into_iter().map(|b| b & mask).collect();
        Ok(StillFrame {
            encoding: self.encoding,
            data: compress(&pixels, speed)?,
            row_stride: 0,
            quality: Some(quality),
            // jpeg subsamples chroma below q90, webp always does
            csc: match self.encoding {
                Encoding::Jpeg if quality >= 90 => Some(PixelFormat::Yuv444p),
                _ => Some(PixelFormat::Yuv420p),
            },
        })
    }
}

/// Lossless still codec.
#[derive(Debug, Clone, Copy)]
pub struct PngStill;

impl StillEncoder for PngStill {
    fn encoding(&self) -> Encoding {
        Encoding::Png
    }

    fn encode(&self, image: &ImageBuffer, _quality: u8, speed: u8) -> Result<StillFrame, CodecError> {
        Ok(StillFrame {
            encoding: Encoding::Png,
            data: compress(&image.packed_pixels(), speed)?,
            row_stride: 0,
            quality: None,
            csc: None,
        })
    }
}

// ── Colour conversion ────────────────────────────────────────────

/// BGRX to planar YUV 4:2:0 with nearest-neighbour scaling.
#[derive(Debug)]
pub struct SoftwareCsc {
    src: (u32, u32),
    dst: (u32, u32),
}

impl SoftwareCsc {
    fn sample(&self, image: &ImageBuffer, dx: u32, dy: u32) -> (i32, i32, i32) {
        let sx = (dx as u64 * self.src.0 as u64 / self.dst.0 as u64) as u32;
        let sy = (dy as u64 * self.src.1 as u64 / self.dst.1 as u64) as u32;
        let offset = sy as usize * image.stride as usize + sx as usize * 4;
        match image.data.get(offset..offset + 3) {
            Some(px) => (px[2] as i32, px[1] as i32, px[0] as i32),
            None => (0, 0, 0),
        }
    }
}

impl CscConverter for SoftwareCsc {
    fn codec_type(&self) -> &str {
        "softcsc"
    }

    fn src_format(&self) -> PixelFormat {
        PixelFormat::Bgrx
    }

    fn dst_format(&self) -> PixelFormat {
        PixelFormat::Yuv420p
    }

    fn src_size(&self) -> (u32, u32) {
        self.src
    }

    fn dst_size(&self) -> (u32, u32) {
        self.dst
    }

    fn convert(&mut self, image: &ImageBuffer) -> Result<ImageBuffer, CodecError> {
        if (image.width, image.height) != self.src || image.format != PixelFormat::Bgrx {
            return Err(CodecError::Fatal(format!(
                "expected {}x{} BGRX, got {}x{} {}",
                self.src.0, self.src.1, image.width, image.height, image.format
            )));
        }
        let (w, h) = self.dst;
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let mut data = Vec::with_capacity((w * h + 2 * cw * ch) as usize);
        for y in 0..h {
            for x in 0..w {
                let (r, g, b) = self.sample(image, x, y);
                data.push((((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8);
            }
        }
        let mut v = Vec::with_capacity((cw * ch) as usize);
        for y in 0..ch {
            for x in 0..cw {
                let (r, g, b) = self.sample(image, (x * 2).min(w - 1), (y * 2).min(h - 1));
                data.push((((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8);
                v.push((((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8);
            }
        }
        data.extend_from_slice(&v);
        Ok(ImageBuffer::new(
            Rectangle::new(image.x, image.y, w, h),
            w,
            PixelFormat::Yuv420p,
            data,
            image.timestamp,
        ))
    }

    fn clean(&mut self) {}
}

// ── Video ────────────────────────────────────────────────────────

/// Inter-frame encoder: each frame is sent as its difference to the
/// previous one. `lookahead` frames are held back before output starts.
#[derive(Debug)]
pub struct DiffVideo {
    codec_type: String,
    encoding: Encoding,
    width: u32,
    height: u32,
    lookahead: usize,
    reference: Vec<u8>,
    held: VecDeque<(Vec<u8>, u8, u8)>,
    emitted: u64,
}

impl DiffVideo {
    fn emit(&mut self) -> Result<Option<EncodedFrame>, CodecError> {
        let Some((planes, quality, speed)) = self.held.pop_front() else {
            return Ok(None);
        };
        let mask = 0xFFu8 << quantize_shift(quality);
        let mut residual: Vec<u8> = planes.iter().map(|b| b & mask).collect();
        if self.reference.len() == residual.len() {
            for (r, prev) in residual.iter_mut().zip(&self.reference) {
                *r ^= prev;
            }
        }
        self.reference = planes.iter().map(|b| b & mask).collect();
        self.emitted += 1;
        Ok(Some(EncodedFrame {
            data: compress(&residual, speed)?,
            frame: self.emitted,
            delayed: self.held.len() as u32,
            quality: Some(quality),
            scaled_size: None,
        }))
    }
}

impl VideoEncoder for DiffVideo {
    fn codec_type(&self) -> &str {
        &self.codec_type
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn src_format(&self) -> PixelFormat {
        PixelFormat::Yuv420p
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn compress(&mut self, image: &ImageBuffer, quality: u8, speed: u8) -> Result<EncodedFrame, CodecError> {
        if (image.width, image.height) != (self.width, self.height) || image.format != PixelFormat::Yuv420p {
            return Err(CodecError::Fatal(format!(
                "{} expects {}x{} YUV420P, got {}x{} {}",
                self.codec_type, self.width, self.height, image.width, image.height, image.format
            )));
        }
        self.held.push_back((image.data.clone(), quality, speed));
        if self.held.len() > self.lookahead {
            if let Some(frame) = self.emit()? {
                return Ok(frame);
            }
        }
        Ok(EncodedFrame {
            frame: self.emitted,
            delayed: self.held.len() as u32,
            ..Default::default()
        })
    }

    fn flush(&mut self, _frame: u64) -> Result<Option<EncodedFrame>, CodecError> {
        self.emit()
    }

    fn clean(&mut self) {
        self.held.clear();
        self.reference.clear();
    }
}

// ── SimulatedRegistry ────────────────────────────────────────────

/// Registry backed by the software codecs above.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegistry {
    /// Frames each video encoder holds back.
    pub video_lookahead: u32,
}

impl SimulatedRegistry {
    pub fn new(video_lookahead: u32) -> Self {
        Self { video_lookahead }
    }
}

impl CodecRegistry for SimulatedRegistry {
    fn encoder_specs(&self, encoding: Encoding) -> Vec<EncoderSpec> {
        let (codec_type, quality, speed, boost) = match encoding {
            Encoding::H264 => ("x264-sim", 70, 60, 10),
            Encoding::Vp9 => ("vpx-sim", 75, 40, 0),
            _ => return Vec::new(),
        };
        let mut spec = EncoderSpec::new(encoding, codec_type, PixelFormat::Yuv420p);
        spec.output_colorspaces = vec![PixelFormat::Yuv420p];
        spec.quality = quality;
        spec.speed = speed;
        spec.score_boost = boost;
        vec![spec]
    }

    fn csc_specs(&self, src_format: PixelFormat) -> Vec<CscSpec> {
        if src_format != PixelFormat::Bgrx {
            return Vec::new();
        }
        vec![CscSpec::new("softcsc", PixelFormat::Bgrx, PixelFormat::Yuv420p)]
    }

    fn make_csc(&self, spec: &CscSpec, params: &CscParams) -> Result<Box<dyn CscConverter>, CodecError> {
        if params.src_format != spec.input_format || params.dst_format != spec.output_format {
            return Err(CodecError::Fatal(format!(
                "softcsc cannot convert {} to {}",
                params.src_format, params.dst_format
            )));
        }
        if params.dst_width == 0 || params.dst_height == 0 {
            return Err(CodecError::Fatal("empty csc output".into()));
        }
        Ok(Box::new(SoftwareCsc {
            src: (params.src_width, params.src_height),
            dst: (params.dst_width, params.dst_height),
        }))
    }

    fn make_encoder(&self, spec: &EncoderSpec, params: &EncoderParams) -> Result<Box<dyn VideoEncoder>, CodecError> {
        if params.width < spec.min_width || params.height < spec.min_height {
            return Err(CodecError::Transient(format!(
                "{}x{} below {} minimum",
                params.width, params.height, spec.codec_type
            )));
        }
        Ok(Box::new(DiffVideo {
            codec_type: spec.codec_type.clone(),
            encoding: params.encoding,
            width: params.width,
            height: params.height,
            lookahead: self.video_lookahead as usize,
            reference: Vec::new(),
            held: VecDeque::new(),
            emitted: 0,
        }))
    }

    fn still_encoder(&self, encoding: Encoding) -> Option<Arc<dyn StillEncoder>> {
        match encoding {
            Encoding::Jpeg | Encoding::Webp => Some(Arc::new(LossyStill { encoding })),
            Encoding::Png => Some(Arc::new(PngStill)),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn gradient(w: u32, h: u32) -> ImageBuffer {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[(x * 7) as u8, (y * 5) as u8, (x ^ y) as u8, 0xFF]);
            }
        }
        ImageBuffer::new(Rectangle::sized(w, h), w * 4, PixelFormat::Bgrx, data, Instant::now())
    }

    fn params(w: u32, h: u32) -> EncoderParams {
        EncoderParams {
            width: w,
            height: h,
            src_format: PixelFormat::Yuv420p,
            dst_formats: vec![PixelFormat::Yuv420p],
            encoding: Encoding::H264,
            quality: 80,
            speed: 80,
            scaling: (1, 1),
        }
    }

    #[test]
    fn lower_quality_compresses_better() {
        let registry = SimulatedRegistry::default();
        let jpeg = registry.still_encoder(Encoding::Jpeg).unwrap();
        let image = gradient(128, 64);
        let high = jpeg.encode(&image, 100, 50).unwrap();
        let low = jpeg.encode(&image, 10, 50).unwrap();
        assert!(low.data.len() < high.data.len());
        assert_eq!(low.quality, Some(10));
        assert!(registry.still_encoder(Encoding::Rgb24).is_none());
    }

    #[test]
    fn csc_scales_and_subsamples() {
        let registry = SimulatedRegistry::default();
        let spec = &registry.csc_specs(PixelFormat::Bgrx)[0];
        let mut csc = registry
            .make_csc(
                spec,
                &CscParams {
                    src_width: 64,
                    src_height: 32,
                    src_format: PixelFormat::Bgrx,
                    dst_width: 32,
                    dst_height: 16,
                    dst_format: PixelFormat::Yuv420p,
                    speed: 50,
                },
            )
            .unwrap();
        let out = csc.convert(&gradient(64, 32)).unwrap();
        assert_eq!((out.width, out.height), (32, 16));
        assert_eq!(out.data.len(), 32 * 16 + 2 * 16 * 8);
        assert!(csc.convert(&gradient(10, 10)).is_err());
    }

    #[test]
    fn static_video_costs_almost_nothing() {
        let registry = SimulatedRegistry::default();
        let spec = &registry.encoder_specs(Encoding::H264)[0];
        let mut encoder = registry.make_encoder(spec, &params(32, 16)).unwrap();
        let frame = ImageBuffer::new(
            Rectangle::sized(32, 16),
            32,
            PixelFormat::Yuv420p,
            (0..32 * 16 * 3 / 2).map(|i| (i * 13) as u8).collect(),
            Instant::now(),
        );
        let first = encoder.compress(&frame, 100, 50).unwrap();
        let second = encoder.compress(&frame, 100, 50).unwrap();
        assert_eq!((first.frame, second.frame), (1, 2));
        assert!(second.data.len() < first.data.len());
    }

    #[test]
    fn lookahead_holds_frames_until_flushed() {
        let registry = SimulatedRegistry::new(2);
        let spec = &registry.encoder_specs(Encoding::Vp9)[0];
        let mut encoder = registry.make_encoder(spec, &params(16, 16)).unwrap();
        let frame = ImageBuffer::new(
            Rectangle::sized(16, 16),
            16,
            PixelFormat::Yuv420p,
            vec![0x40; 16 * 16 * 3 / 2],
            Instant::now(),
        );
        let held = encoder.compress(&frame, 80, 50).unwrap();
        assert!(held.data.is_empty());
        assert_eq!((held.frame, held.delayed), (0, 1));
        encoder.compress(&frame, 80, 50).unwrap();
        let out = encoder.compress(&frame, 80, 50).unwrap();
        assert_eq!((out.frame, out.delayed), (1, 2));
        let flushed = encoder.flush(out.frame).unwrap().unwrap();
        assert_eq!((flushed.frame, flushed.delayed), (2, 1));
        encoder.flush(2).unwrap();
        assert!(encoder.flush(3).unwrap().is_none());
    }
}
