//! Video pipeline lifecycle for one window.
//!
//! A pipeline is an optional colour-space converter feeding a video
//! encoder. [`PipelineManager`] scores every candidate the registry
//! offers, builds the best one that instantiates, revalidates it before
//! each use and tears it down when the frame no longer matches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::VideoSettings;
use crate::encoding::Encoding;
use crate::error::{CodecError, EngineError};
use crate::pipeline::scaling::{ScalingHint, ScalingInput, calculate_scaling};
use crate::pipeline::scoring::{NO_SCALING, PipelineOption, RunningShape, ScoreTargets, pipeline_score};
use crate::pipeline::spec::{
    CodecRegistry, CscConverter, CscParams, EncodedFrame, EncoderParams, VideoEncoder,
};
use crate::selector::VideoLimits;
use crate::types::{ImageBuffer, PixelFormat};

// ── VideoPipeline ────────────────────────────────────────────────

/// A built converter + encoder chain.
pub struct VideoPipeline {
    pub encoding: Encoding,
    pub src_format: PixelFormat,
    /// Window size the pipeline was built for, before masking.
    pub src_width: u32,
    pub src_height: u32,
    csc: Option<Box<dyn CscConverter>>,
    encoder: Box<dyn VideoEncoder>,
    pub scaling: (u32, u32),
    pub limits: VideoLimits,
    /// Frames before this one were buffered by the encoder and must not
    /// be painted.
    pub start_video_frame: u64,
    pub option: PipelineOption,
}

/// One encoded video frame plus the hints the client needs.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub frame: EncodedFrame,
    pub csc: PixelFormat,
    pub scaled_size: Option<(u32, u32)>,
}

impl VideoPipeline {
    /// Same encoding, format and source size as the frame about to be sent.
    pub fn matches(&self, encoding: Encoding, width: u32, height: u32, src_format: PixelFormat) -> bool {
        self.encoding == encoding
            && self.src_format == src_format
            && self.src_width == width
            && self.src_height == height
    }

    pub fn masked_size(&self) -> (u32, u32) {
        self.limits.masked(self.src_width, self.src_height)
    }

    pub fn codec_type(&self) -> &str {
        self.encoder.codec_type()
    }

    /// Subsampling the client should assume for this pipeline's frames.
    pub fn csc_mode(&self) -> PixelFormat {
        self.encoder.src_format().csc_equiv()
    }

    pub fn shape(&self) -> RunningShape {
        RunningShape {
            csc: self.csc.as_ref().map(|c| {
                let (w, h) = c.src_size();
                (c.codec_type().to_string(), c.dst_format(), w, h)
            }),
            encoder: Some((
                self.encoder.codec_type().to_string(),
                self.encoder.src_format(),
                self.encoder.width(),
                self.encoder.height(),
            )),
        }
    }

    /// Convert (if needed) and compress one frame.
    pub fn encode(&mut self, image: &ImageBuffer, quality: u8, speed: u8) -> Result<VideoFrame, CodecError> {
        let (mw, mh) = self.masked_size();
        let cropped;
        let input = if (image.width, image.height) != (mw, mh) {
            cropped = image
                .sub_image(0, 0, mw, mh)
                .ok_or_else(|| CodecError::Fatal(format!("cannot crop {}x{} to {mw}x{mh}", image.width, image.height)))?;
            &cropped
        } else {
            image
        };
        let converted;
        let input = match self.csc.as_mut() {
            Some(csc) => {
                converted = csc.convert(input)?;
                &converted
            }
            None => input,
        };
        let frame = self.encoder.compress(input, quality, speed)?;
        let (ew, eh) = (self.encoder.width(), self.encoder.height());
        let scaled_size = frame
            .scaled_size
            .or_else(|| ((ew, eh) != (mw, mh)).then_some((ew, eh)));
        Ok(VideoFrame {
            frame,
            csc: self.csc_mode(),
            scaled_size,
        })
    }

    /// Drain frames the encoder is holding back.
    pub fn flush(&mut self, frame: u64) -> Result<Option<EncodedFrame>, CodecError> {
        self.encoder.flush(frame)
    }

    pub fn clean(&mut self) {
        if let Some(csc) = self.csc.as_mut() {
            csc.clean();
        }
        self.encoder.clean();
    }
}

impl std::fmt::Debug for VideoPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoPipeline")
            .field("encoding", &self.encoding)
            .field("src", &(self.src_width, self.src_height, self.src_format))
            .field("csc", &self.csc.as_ref().map(|c| c.codec_type().to_string()))
            .field("encoder", &self.encoder.codec_type())
            .field("scaling", &self.scaling)
            .finish()
    }
}

// ── PipelineRequest ──────────────────────────────────────────────

/// What the next frame needs from the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest {
    pub encoding: Encoding,
    pub width: u32,
    pub height: u32,
    pub src_format: PixelFormat,
    pub quality: u8,
    pub min_quality: u8,
    pub speed: u8,
    pub min_speed: u8,
    pub hint: ScalingHint,
    pub now: Instant,
}

impl PipelineRequest {
    fn targets(&self) -> ScoreTargets {
        ScoreTargets {
            quality: self.quality,
            min_quality: self.min_quality,
            speed: self.speed,
            min_speed: self.min_speed,
        }
    }
}

type OptionsKey = (Encoding, u32, u32, PixelFormat);

// ── PipelineManager ──────────────────────────────────────────────

pub struct PipelineManager {
    registry: Arc<dyn CodecRegistry>,
    /// Subsampling modes the client accepts, per encoding.
    csc_modes: Vec<(Encoding, Vec<PixelFormat>)>,
    settings: VideoSettings,
    video_scaling: bool,
    pipeline: Option<VideoPipeline>,
    cache: Option<(OptionsKey, Instant, Vec<PipelineOption>)>,
    last_rescore: Option<Instant>,
    /// Codec types that failed fatally this session.
    failed: HashSet<String>,
}

impl PipelineManager {
    pub fn new(
        registry: Arc<dyn CodecRegistry>,
        csc_modes: Vec<(Encoding, Vec<PixelFormat>)>,
        settings: VideoSettings,
        video_scaling: bool,
    ) -> Self {
        Self {
            registry,
            csc_modes,
            settings,
            video_scaling,
            pipeline: None,
            cache: None,
            last_rescore: None,
            failed: HashSet::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Limits of the running pipeline, permissive when there is none.
    pub fn limits(&self) -> VideoLimits {
        self.pipeline.as_ref().map(|p| p.limits).unwrap_or_default()
    }

    pub fn pipeline_mut(&mut self) -> Option<&mut VideoPipeline> {
        self.pipeline.as_mut()
    }

    pub fn pipeline(&self) -> Option<&VideoPipeline> {
        self.pipeline.as_ref()
    }

    /// The running pipeline can take a frame of this shape unchanged.
    pub fn check(&self, encoding: Encoding, width: u32, height: u32, src_format: PixelFormat) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.matches(encoding, width, height, src_format))
    }

    /// Tear the pipeline down; the next video frame rebuilds it.
    pub fn close(&mut self) {
        if let Some(mut p) = self.pipeline.take() {
            debug!(encoding = %p.encoding, codec = p.codec_type(), "closing video pipeline");
            p.clean();
        }
    }

    /// Forget the current pipeline and anything learned about candidates.
    pub fn reset(&mut self) {
        self.close();
        self.cache = None;
        self.last_rescore = None;
    }

    fn client_modes(&self, encoding: Encoding) -> &[PixelFormat] {
        self.csc_modes
            .iter()
            .find(|(e, _)| *e == encoding)
            .map(|(_, m)| m.as_slice())
            .unwrap_or(&[])
    }

    /// Scored candidates for `req`, best first.
    ///
    /// Results are cached per shape for `options_cache_ms` unless `force`.
    pub fn options(&mut self, req: &PipelineRequest, force: bool) -> Vec<PipelineOption> {
        let key = (req.encoding, req.width, req.height, req.src_format);
        let ttl = Duration::from_millis(self.settings.options_cache_ms);
        if !force {
            if let Some((k, at, opts)) = &self.cache {
                if *k == key && req.now.saturating_duration_since(*at) < ttl {
                    return opts.clone();
                }
            }
        }
        let opts = self.score_options(req);
        self.cache = Some((key, req.now, opts.clone()));
        opts
    }

    fn score_options(&self, req: &PipelineRequest) -> Vec<PipelineOption> {
        let modes = self.client_modes(req.encoding);
        let running = self.pipeline.as_ref().map(VideoPipeline::shape).unwrap_or_default();
        let targets = req.targets();
        let encoders: Vec<_> = self
            .registry
            .encoder_specs(req.encoding)
            .into_iter()
            .filter(|e| !self.failed.contains(&e.codec_type))
            .filter(|e| e.output_colorspaces.iter().any(|cs| modes.contains(cs)))
            .collect();
        if encoders.is_empty() {
            debug!(encoding = %req.encoding, "no encoder matches the client colourspaces");
            return Vec::new();
        }
        let max_w = encoders.iter().map(|e| e.max_width).max().unwrap_or(0);
        let max_h = encoders.iter().map(|e| e.max_height).max().unwrap_or(0);
        let current = self.pipeline.as_ref().map(|p| p.scaling).unwrap_or(NO_SCALING);
        let scaling = calculate_scaling(&ScalingInput {
            width: req.width,
            height: req.height,
            max_width: max_w,
            max_height: max_h,
            quality: req.quality,
            speed: req.speed,
            allowed: self.video_scaling,
            heuristics: self.settings.scaling,
            current,
            hint: req.hint,
        });

        let mut scores = Vec::new();
        for enc in encoders.iter().filter(|e| e.input_format == req.src_format) {
            if let Some(opt) = pipeline_score(req.src_format, None, enc, req.width, req.height, scaling, &targets, &running) {
                scores.push(opt);
            }
        }
        for csc in self
            .registry
            .csc_specs(req.src_format)
            .into_iter()
            .filter(|c| !self.failed.contains(&c.codec_type))
        {
            if req.width < csc.min_width
                || req.height < csc.min_height
                || req.width > csc.max_width
                || req.height > csc.max_height
            {
                continue;
            }
            for enc in encoders.iter().filter(|e| e.input_format == csc.output_format) {
                if let Some(opt) =
                    pipeline_score(csc.output_format, Some(&csc), enc, req.width, req.height, scaling, &targets, &running)
                {
                    scores.push(opt);
                }
            }
        }
        scores.sort_by(|a, b| b.score.cmp(&a.score));
        debug!(
            encoding = %req.encoding,
            width = req.width,
            height = req.height,
            candidates = scores.len(),
            best = scores.first().map(|o| o.score),
            "scored pipeline options"
        );
        scores
    }

    /// Make sure a pipeline matching `req` is running and return it.
    pub fn ensure(&mut self, req: &PipelineRequest) -> Result<&mut VideoPipeline, EngineError> {
        if !self.check(req.encoding, req.width, req.height, req.src_format) {
            if self.pipeline.is_some() {
                debug!(width = req.width, height = req.height, "pipeline no longer matches the frame");
            }
            self.close();
            let options = self.options(req, false);
            self.setup(&options, req)?;
        }
        self.pipeline
            .as_mut()
            .ok_or(EngineError::NoPipeline { encoding: req.encoding })
    }

    /// Build the first candidate of `options` that instantiates.
    pub fn setup(&mut self, options: &[PipelineOption], req: &PipelineRequest) -> Result<(), EngineError> {
        self.close();
        if options.is_empty() {
            return Err(EngineError::CodecSetupFailed {
                encoding: req.encoding,
                reason: "no pipeline candidates".into(),
            });
        }
        let mut last_err = String::new();
        for option in options {
            match self.build(option, req) {
                Ok(pipeline) => {
                    info!(
                        encoding = %req.encoding,
                        codec = pipeline.codec_type(),
                        csc = ?option.csc.as_ref().map(|c| c.codec_type.as_str()),
                        scaling = ?option.scaling,
                        score = option.score,
                        "video pipeline ready"
                    );
                    self.pipeline = Some(pipeline);
                    return Ok(());
                }
                Err(e) => {
                    if !e.is_transient() {
                        self.failed.insert(option.encoder.codec_type.clone());
                    }
                    warn!(codec = %option.encoder.codec_type, error = %e, "pipeline candidate failed");
                    last_err = e.to_string();
                }
            }
        }
        error!(encoding = %req.encoding, "all pipeline candidates failed");
        Err(EngineError::CodecSetupFailed {
            encoding: req.encoding,
            reason: last_err,
        })
    }

    fn build(&self, option: &PipelineOption, req: &PipelineRequest) -> Result<VideoPipeline, CodecError> {
        let enc_spec = &option.encoder;
        let mut limits = VideoLimits {
            width_mask: enc_spec.width_mask,
            height_mask: enc_spec.height_mask,
            min_width: enc_spec.min_width,
            min_height: enc_spec.min_height,
            max_width: scale_up(enc_spec.max_width, option.scaling),
            max_height: scale_up(enc_spec.max_height, option.scaling),
        };
        let mut csc = None;
        if let Some(csc_spec) = &option.csc {
            limits.width_mask &= csc_spec.width_mask;
            limits.height_mask &= csc_spec.height_mask;
            limits.min_width = limits.min_width.max(csc_spec.min_width);
            limits.min_height = limits.min_height.max(csc_spec.min_height);
            limits.max_width = limits.max_width.min(csc_spec.max_width);
            limits.max_height = limits.max_height.min(csc_spec.max_height);
            let (dst_width, dst_height) = match option.csc_scaling {
                Some(s) if s != NO_SCALING => scale_down(option.csc_width, option.csc_height, s),
                _ => (option.csc_width, option.csc_height),
            };
            let params = CscParams {
                src_width: option.csc_width,
                src_height: option.csc_height,
                src_format: req.src_format,
                dst_width,
                dst_height,
                dst_format: option.enc_in_format,
                // leave more headroom for the converter at high quality
                speed: req.speed.min(100 - req.quality / 2),
            };
            csc = Some(self.registry.make_csc(csc_spec, &params)?);
        }
        let params = EncoderParams {
            width: option.enc_width,
            height: option.enc_height,
            src_format: option.enc_in_format,
            dst_formats: self.client_modes(req.encoding).to_vec(),
            encoding: req.encoding,
            quality: req.quality,
            speed: req.speed,
            scaling: option.encoder_scaling,
        };
        let encoder = match self.registry.make_encoder(enc_spec, &params) {
            Ok(encoder) => encoder,
            Err(e) => {
                if let Some(mut c) = csc {
                    c.clean();
                }
                return Err(e);
            }
        };
        Ok(VideoPipeline {
            encoding: req.encoding,
            src_format: req.src_format,
            src_width: req.width,
            src_height: req.height,
            csc,
            encoder,
            scaling: option.scaling,
            limits,
            start_video_frame: 0,
            option: option.clone(),
        })
    }

    /// Rescore at most every `rescore_interval_ms`; rebuild on the next
    /// frame when a different candidate now wins.
    pub fn rescore(&mut self, req: &PipelineRequest) -> bool {
        let interval = Duration::from_millis(self.settings.rescore_interval_ms);
        if self
            .last_rescore
            .is_some_and(|at| req.now.saturating_duration_since(at) < interval)
        {
            return false;
        }
        self.last_rescore = Some(req.now);
        let Some(current) = self.pipeline.as_ref().map(|p| p.option.clone()) else {
            return false;
        };
        let options = self.options(req, true);
        let Some(best) = options.first() else {
            return false;
        };
        let same = best.encoder.codec_type == current.encoder.codec_type
            && best.enc_in_format == current.enc_in_format
            && best.scaling == current.scaling
            && best.csc.as_ref().map(|c| &c.codec_type) == current.csc.as_ref().map(|c| &c.codec_type);
        if !same {
            debug!(
                from = %current.encoder.codec_type,
                to = %best.encoder.codec_type,
                scaling = ?best.scaling,
                "better pipeline available"
            );
            self.close();
            return true;
        }
        false
    }

    /// Codec types marked unusable this session.
    pub fn failed_codecs(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(String::as_str)
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("pipeline", &self.pipeline)
            .field("failed", &self.failed)
            .finish()
    }
}

fn scale_down(width: u32, height: u32, (num, den): (u32, u32)) -> (u32, u32) {
    let den = den.max(1) as u64;
    (
        (width as u64 * num as u64 / den) as u32,
        (height as u64 * num as u64 / den) as u32,
    )
}

fn scale_up(value: u32, (num, den): (u32, u32)) -> u32 {
    (value as u64 * den as u64 / num.max(1) as u64).min(u32::MAX as u64) as u32
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::StillEncoder;
    use crate::pipeline::spec::{CscSpec, EncoderSpec};
    use crate::region::Rectangle;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Records what was built and can be told to fail.
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        pub encoders: Vec<EncoderSpec>,
        pub cscs: Vec<CscSpec>,
        pub fail_encoders: Mutex<Vec<(String, CodecError)>>,
        pub built: Mutex<Vec<(String, u32, u32)>>,
    }

    struct FakeEncoder {
        codec: String,
        encoding: Encoding,
        format: PixelFormat,
        width: u32,
        height: u32,
        frame: u64,
    }

    impl VideoEncoder for FakeEncoder {
        fn codec_type(&self) -> &str {
            &self.codec
        }
        fn encoding(&self) -> Encoding {
            self.encoding
        }
        fn src_format(&self) -> PixelFormat {
            self.format
        }
        fn width(&self) -> u32 {
            self.width
        }
        fn height(&self) -> u32 {
            self.height
        }
        fn compress(&mut self, image: &ImageBuffer, quality: u8, _speed: u8) -> Result<EncodedFrame, CodecError> {
            self.frame += 1;
            Ok(EncodedFrame {
                data: Bytes::from(vec![1u8; (image.width * image.height / 64) as usize + 1]),
                frame: self.frame,
                delayed: 0,
                quality: Some(quality),
                scaled_size: None,
            })
        }
        fn flush(&mut self, _frame: u64) -> Result<Option<EncodedFrame>, CodecError> {
            Ok(None)
        }
        fn clean(&mut self) {}
    }

    struct FakeCsc {
        src: (u32, u32),
        dst: (u32, u32),
        from: PixelFormat,
        to: PixelFormat,
    }

    impl CscConverter for FakeCsc {
        fn codec_type(&self) -> &str {
            "swscale"
        }
        fn src_format(&self) -> PixelFormat {
            self.from
        }
        fn dst_format(&self) -> PixelFormat {
            self.to
        }
        fn src_size(&self) -> (u32, u32) {
            self.src
        }
        fn dst_size(&self) -> (u32, u32) {
            self.dst
        }
        fn convert(&mut self, image: &ImageBuffer) -> Result<ImageBuffer, CodecError> {
            let (w, h) = self.dst;
            Ok(ImageBuffer::new(
                Rectangle::new(image.x, image.y, w, h),
                w,
                self.to,
                vec![0u8; (w * h * 3 / 2) as usize],
                image.timestamp,
            ))
        }
        fn clean(&mut self) {}
    }

    impl CodecRegistry for FakeRegistry {
        fn encoder_specs(&self, encoding: Encoding) -> Vec<EncoderSpec> {
            self.encoders.iter().filter(|e| e.encoding == encoding).cloned().collect()
        }
        fn csc_specs(&self, src_format: PixelFormat) -> Vec<CscSpec> {
            self.cscs.iter().filter(|c| c.input_format == src_format).cloned().collect()
        }
        fn make_csc(&self, spec: &CscSpec, params: &CscParams) -> Result<Box<dyn CscConverter>, CodecError> {
            Ok(Box::new(FakeCsc {
                src: (params.src_width, params.src_height),
                dst: (params.dst_width, params.dst_height),
                from: spec.input_format,
                to: spec.output_format,
            }))
        }
        fn make_encoder(&self, spec: &EncoderSpec, params: &EncoderParams) -> Result<Box<dyn VideoEncoder>, CodecError> {
            if let Ok(fails) = self.fail_encoders.lock() {
                if let Some((_, e)) = fails.iter().find(|(c, _)| *c == spec.codec_type) {
                    return Err(e.clone());
                }
            }
            if let Ok(mut built) = self.built.lock() {
                built.push((spec.codec_type.clone(), params.width, params.height));
            }
            Ok(Box::new(FakeEncoder {
                codec: spec.codec_type.clone(),
                encoding: spec.encoding,
                format: spec.input_format,
                width: params.width,
                height: params.height,
                frame: 0,
            }))
        }
        fn still_encoder(&self, _encoding: Encoding) -> Option<Arc<dyn StillEncoder>> {
            None
        }
    }

    pub(crate) fn h264_registry() -> FakeRegistry {
        let mut x264 = EncoderSpec::new(Encoding::H264, "x264", PixelFormat::Yuv420p);
        x264.output_colorspaces = vec![PixelFormat::Yuv420p];
        x264.speed = 70;
        let mut nvenc = EncoderSpec::new(Encoding::H264, "nvenc", PixelFormat::Yuv420p);
        nvenc.output_colorspaces = vec![PixelFormat::Yuv420p];
        nvenc.speed = 100;
        nvenc.quality = 60;
        nvenc.setup_cost = 80;
        FakeRegistry {
            encoders: vec![x264, nvenc],
            cscs: vec![CscSpec::new("swscale", PixelFormat::Bgrx, PixelFormat::Yuv420p)],
            ..Default::default()
        }
    }

    fn manager(registry: Arc<FakeRegistry>) -> PipelineManager {
        let modes = vec![(Encoding::H264, vec![PixelFormat::Yuv420p])];
        let settings = VideoSettings {
            scaling: false,
            ..Default::default()
        };
        PipelineManager::new(registry, modes, settings, false)
    }

    fn request(width: u32, height: u32, now: Instant) -> PipelineRequest {
        PipelineRequest {
            encoding: Encoding::H264,
            width,
            height,
            src_format: PixelFormat::Bgrx,
            quality: 50,
            min_quality: 0,
            speed: 50,
            min_speed: 0,
            hint: ScalingHint::default(),
            now,
        }
    }

    #[test]
    fn builds_through_csc() {
        let reg = Arc::new(h264_registry());
        let mut m = manager(Arc::clone(&reg));
        let now = Instant::now();
        let p = m.ensure(&request(1280, 720, now)).unwrap();
        assert!(p.matches(Encoding::H264, 1280, 720, PixelFormat::Bgrx));
        assert!(m.check(Encoding::H264, 1280, 720, PixelFormat::Bgrx));
        assert!(!m.check(Encoding::H264, 1281, 720, PixelFormat::Bgrx));
    }

    #[test]
    fn resize_rebuilds_with_masked_dimensions() {
        let reg = Arc::new(h264_registry());
        let mut m = manager(Arc::clone(&reg));
        let now = Instant::now();
        m.ensure(&request(1280, 720, now)).unwrap();
        assert!(!m.check(Encoding::H264, 1281, 720, PixelFormat::Bgrx));
        let p = m.ensure(&request(1281, 720, now)).unwrap();
        assert_eq!(p.masked_size(), (1280, 720));
        let built = reg.built.lock().unwrap();
        assert_eq!(built.len(), 2);
        assert_eq!((built[1].1, built[1].2), (1280, 720));
    }

    #[test]
    fn transient_failure_tries_next_candidate() {
        let reg = Arc::new(h264_registry());
        let mut m = manager(Arc::clone(&reg));
        let now = Instant::now();
        let first = m.options(&request(1280, 720, now), false)[0].encoder.codec_type.clone();
        reg.fail_encoders
            .lock()
            .unwrap()
            .push((first.clone(), CodecError::Transient("busy".into())));
        let p = m.ensure(&request(1280, 720, now)).unwrap();
        assert_ne!(p.codec_type(), first);
        assert_eq!(m.failed_codecs().count(), 0);
    }

    #[test]
    fn total_failure_leaves_no_pipeline() {
        let reg = Arc::new(h264_registry());
        for codec in ["x264", "nvenc"] {
            reg.fail_encoders
                .lock()
                .unwrap()
                .push((codec.into(), CodecError::Fatal("gone".into())));
        }
        let mut m = manager(Arc::clone(&reg));
        let err = m.ensure(&request(1280, 720, Instant::now())).unwrap_err();
        assert!(matches!(err, EngineError::CodecSetupFailed { .. }));
        assert!(!m.is_active());
        assert_eq!(m.failed_codecs().count(), 2);
    }

    #[test]
    fn client_colourspaces_filter_encoders() {
        let reg = Arc::new(h264_registry());
        let modes = vec![(Encoding::H264, vec![PixelFormat::Yuv444p])];
        let mut m = PipelineManager::new(reg, modes, VideoSettings::default(), false);
        assert!(m.options(&request(1280, 720, Instant::now()), false).is_empty());
    }

    #[test]
    fn encode_crops_to_masked_size() {
        let reg = Arc::new(h264_registry());
        let mut m = manager(reg);
        let now = Instant::now();
        let p = m.ensure(&request(101, 51, now)).unwrap();
        let img = ImageBuffer::new(
            Rectangle::sized(101, 51),
            101 * 4,
            PixelFormat::Bgrx,
            vec![0u8; 101 * 51 * 4],
            now,
        );
        let out = p.encode(&img, 50, 50).unwrap();
        assert_eq!(out.csc, PixelFormat::Yuv420p);
        assert_eq!(out.scaled_size, None);
        assert_eq!(out.frame.frame, 1);
    }

    #[test]
    fn rescore_is_rate_limited() {
        let reg = Arc::new(h264_registry());
        let mut m = manager(reg);
        let now = Instant::now();
        m.ensure(&request(1280, 720, now)).unwrap();
        assert!(!m.rescore(&request(1280, 720, now)));
        assert!(!m.rescore(&request(1280, 720, now + Duration::from_millis(10))));
        assert!(m.is_active());
    }
}
