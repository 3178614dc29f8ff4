//! Pipeline candidate scoring.
//!
//! Each candidate (optional converter plus encoder) gets four partial
//! scores in 0..=100: quality against the target, speed against the
//! target, setup cost ("edge resistance", favouring the instances
//! already running) and frame-size efficiency. The total is their mean,
//! scaled by the converter's runtime factor.

use serde::Serialize;
use tracing::trace;

use crate::pipeline::spec::{CscSpec, EncoderSpec};
use crate::types::PixelFormat;

pub const NO_SCALING: (u32, u32) = (1, 1);

/// Quality and speed targets a pipeline is scored against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTargets {
    pub quality: u8,
    pub min_quality: u8,
    pub speed: u8,
    pub min_speed: u8,
}

/// Shape of the pipeline currently running, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunningShape {
    pub csc: Option<(String, PixelFormat, u32, u32)>,
    pub encoder: Option<(String, PixelFormat, u32, u32)>,
}

/// One scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOption {
    pub score: i32,
    pub scaling: (u32, u32),
    pub csc_scaling: Option<(u32, u32)>,
    pub csc_width: u32,
    pub csc_height: u32,
    #[serde(skip)]
    pub csc: Option<CscSpec>,
    pub enc_in_format: PixelFormat,
    pub encoder_scaling: (u32, u32),
    pub enc_width: u32,
    pub enc_height: u32,
    #[serde(skip)]
    pub encoder: EncoderSpec,
}

fn plane_sum(format: PixelFormat) -> Option<f64> {
    format
        .subsampling_divs()
        .map(|divs| divs.iter().map(|(x, y)| (*x + *y) as f64 / 2.0 / 3.0).sum())
}

fn is_subsampled(format: PixelFormat) -> bool {
    matches!(format, PixelFormat::Yuv420p | PixelFormat::Yuv422p)
}

pub fn quality_score(
    format: PixelFormat,
    csc: Option<&CscSpec>,
    encoder: &EncoderSpec,
    scaling: (u32, u32),
    target: u8,
    min_quality: u8,
) -> i32 {
    let mut quality = encoder.quality as f64;
    if let Some(sum) = plane_sum(format) {
        // subsampling and rounding cost some quality
        quality /= 0.5 + sum;
    }
    if let Some(csc) = csc {
        quality = (quality + csc.quality as f64) / 2.0;
    }
    let score = if scaling == NO_SCALING && !is_subsampled(format) && target == 100 && encoder.has_lossless_mode {
        quality + 80.0
    } else {
        let mut q = 100.0 - (target as f64 - quality).abs();
        if min_quality as f64 >= quality {
            q = (q - ((min_quality as f64 - quality) / 2.0).floor()).max(0.0);
        }
        if format == PixelFormat::Yuv420p && scaling != NO_SCALING {
            q *= 2.0;
        }
        q
    };
    score as i32
}

pub fn speed_score(
    format: PixelFormat,
    csc: Option<&CscSpec>,
    encoder: &EncoderSpec,
    target: u8,
    min_speed: u8,
) -> i32 {
    let mut speed = encoder.speed as f64;
    if let Some(csc) = csc {
        // less work for the encoder after subsampling, plus the csc step itself
        let mult = plane_sum(format).unwrap_or(1.0);
        speed = (encoder.speed as f64 * mult + csc.speed as f64) / 2.25;
    }
    let mut score = ((100.0 - target as f64) * speed / 100.0).max(0.0);
    let mss = (speed - min_speed as f64).max(0.0) * 100.0 / (100.0 - min_speed as f64).max(1.0);
    score = (score + mss) / 2.0;
    score = (score + speed) / 2.0;
    score as i32
}

/// Output size of an encoder fed `width`×`height` with `scaling`.
pub fn encoder_dimensions(encoder: &EncoderSpec, width: u32, height: u32, scaling: (u32, u32)) -> (u32, u32) {
    let (num, den) = scaling;
    let w = (width as u64 * num as u64 / den.max(1) as u64) as u32 & encoder.width_mask;
    let h = (height as u64 * num as u64 / den.max(1) as u64) as u32 & encoder.height_mask;
    (w, h)
}

/// Score one candidate; `None` when it cannot handle the frame at all.
#[allow(clippy::too_many_arguments)]
pub fn pipeline_score(
    enc_in_format: PixelFormat,
    csc: Option<&CscSpec>,
    encoder: &EncoderSpec,
    width: u32,
    height: u32,
    scaling: (u32, u32),
    targets: &ScoreTargets,
    running: &RunningShape,
) -> Option<PipelineOption> {
    let clamp = |v: i32| v.clamp(0, 100) as f64;
    let mut qscore = clamp(quality_score(
        enc_in_format,
        csc,
        encoder,
        scaling,
        targets.quality,
        targets.min_quality,
    ));
    let sscore = clamp(speed_score(enc_in_format, csc, encoder, targets.speed, targets.min_speed));

    let mpixels = width as f64 * height as f64 / (1024.0 * 1024.0);
    let sizescore = if mpixels > 1.0 {
        let discount = 100.0 - encoder.size_efficiency as f64;
        (100.0 - (mpixels - 1.0) / 7.0 * discount).max(0.0)
    } else {
        100.0
    };

    let mut runtime_score = 100.0;
    let (ecsc_score, csc_width, csc_height, csc_scaling, encoder_scaling, enc_width, enc_height) =
        if let Some(csc) = csc {
            let csc_width = width & csc.width_mask & encoder.width_mask;
            let csc_height = height & csc.height_mask & encoder.height_mask;
            let base = if matches!(enc_in_format, PixelFormat::Rgb | PixelFormat::Bgr) {
                // converting to packed rgb is rarely worth it
                1.0
            } else if running.csc.as_ref().is_some_and(|(ty, dst, w, h)| {
                *ty == csc.codec_type && *dst == enc_in_format && *w == csc_width && *h == csc_height
            }) {
                80.0
            } else {
                (80.0 - csc.setup_cost as f64 * 80.0 / 100.0).max(0.0)
            };
            runtime_score *= csc.runtime_factor / 100.0;
            let (csc_scaling, encoder_scaling) = if scaling != NO_SCALING && !csc.can_scale {
                (NO_SCALING, scaling)
            } else {
                (scaling, NO_SCALING)
            };
            if scaling != NO_SCALING {
                // prefer lossy formats when downscaling
                qscore *= enc_in_format.lossy_scaling_factor() / 2.0;
            }
            let (enc_width, enc_height) = encoder_dimensions(encoder, csc_width, csc_height, scaling);
            (
                base + csc.score_boost as f64,
                csc_width,
                csc_height,
                Some(csc_scaling),
                encoder_scaling,
                enc_width,
                enc_height,
            )
        } else {
            (
                100.0,
                0,
                0,
                None,
                scaling,
                width & encoder.width_mask,
                height & encoder.height_mask,
            )
        };

    if encoder_scaling != NO_SCALING && !encoder.can_scale {
        trace!(codec = %encoder.codec_type, ?encoder_scaling, "encoder cannot scale");
        return None;
    }
    if enc_width < encoder.min_width
        || enc_height < encoder.min_height
        || enc_width > encoder.max_width
        || enc_height > encoder.max_height
    {
        trace!(codec = %encoder.codec_type, enc_width, enc_height, "frame size out of range");
        return None;
    }

    let reuses_encoder = running.encoder.as_ref().is_some_and(|(ty, fmt, w, h)| {
        *ty == encoder.codec_type && *fmt == enc_in_format && *w == enc_width && *h == enc_height
    });
    let ee_score = if reuses_encoder {
        100.0
    } else {
        100.0 - encoder.setup_cost as f64 + encoder.score_boost as f64
    };
    let er_score = (ecsc_score + ee_score) / 2.0;
    let score = ((qscore + sscore + er_score + sizescore) * runtime_score / 100.0 / 4.0) as i32;
    trace!(
        codec = %encoder.codec_type,
        format = %enc_in_format,
        qscore,
        sscore,
        er_score,
        sizescore,
        score,
        "pipeline score"
    );
    Some(PipelineOption {
        score,
        scaling,
        csc_scaling,
        csc_width,
        csc_height,
        csc: csc.cloned(),
        enc_in_format,
        encoder_scaling,
        enc_width,
        enc_height,
        encoder: encoder.clone(),
    })
}

// ── Tests ────────────────────────────────────────────────────────
