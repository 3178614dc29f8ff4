//! The encode-context half of a window.
//!
//! A [`WindowEncoder`] owns everything that is expensive or stateful on
//! the compression side: the video pipeline, the delta buckets and the
//! scroll detector. It consumes [`WorkItem`]s in order and never looks at
//! the capture context's state.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::codec::{StillCodecs, StillEncoder, StillFrame};
use crate::config::{DeltaSettings, EngineConfig, ScrollSettings, VideoSettings};
use crate::delta::{DeltaCache, DeltaEpoch, DeltaLookup};
use crate::encoding::{ClientCapabilities, Encoding, FAST_ORDER, PREFERRED_ORDER};
use crate::error::CodecError;
use crate::packet::{CodecOptions, DrawPacket, scroll_payload};
use crate::pipeline::{CodecRegistry, PipelineManager, PipelineRequest};
use crate::scroll::{ScrollDetector, ScrollPlan};
use crate::stats::EncodeSample;
use crate::types::{ImageBuffer, PixelFormat, WindowId};
use crate::window::{CancelWatermark, EncodeEvent, EncodeItem, EncodeOutcome, VideoStatus, WorkItem};

// ── EncoderSettings ──────────────────────────────────────────────

/// Everything a [`WindowEncoder`] needs from config and client caps.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub delta: DeltaSettings,
    pub delta_buckets: usize,
    pub scroll: ScrollSettings,
    /// Client accepts scroll packets and scrolling is enabled.
    pub scrolling: bool,
    pub video: VideoSettings,
    pub video_scaling: bool,
    pub csc_modes: Vec<(Encoding, Vec<PixelFormat>)>,
    /// Non-video encodings both sides support.
    pub allowed: Vec<Encoding>,
}

impl EncoderSettings {
    pub fn new(config: &EngineConfig, caps: &ClientCapabilities) -> Self {
        Self {
            delta: config.delta.clone(),
            delta_buckets: caps.delta_buckets,
            scroll: config.scroll.clone(),
            scrolling: caps.scrolling && config.scroll.enabled,
            video: config.video.clone(),
            video_scaling: caps.video_scaling,
            csc_modes: caps.csc_modes.iter().map(|(e, m)| (*e, m.clone())).collect(),
            allowed: caps.non_video_encodings().collect(),
        }
    }
}

// ── WindowEncoder ────────────────────────────────────────────────

pub struct WindowEncoder {
    window: WindowId,
    settings: EncoderSettings,
    codecs: StillCodecs,
    pipeline: PipelineManager,
    delta: DeltaCache,
    scroll: ScrollDetector,
    watermark: CancelWatermark,
    store_counter: u64,
}

impl WindowEncoder {
    pub fn new(
        window: WindowId,
        registry: Arc<dyn CodecRegistry>,
        settings: EncoderSettings,
        watermark: CancelWatermark,
        epoch: DeltaEpoch,
    ) -> Self {
        let pipeline = PipelineManager::new(
            Arc::clone(&registry),
            settings.csc_modes.clone(),
            settings.video.clone(),
            settings.video_scaling,
        );
        Self {
            window,
            codecs: StillCodecs::new(registry),
            pipeline,
            delta: DeltaCache::new(settings.delta_buckets, &settings.delta, epoch),
            scroll: ScrollDetector::new(&settings.scroll),
            watermark,
            store_counter: 0,
            settings,
        }
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn video_status(&self) -> VideoStatus {
        VideoStatus {
            active: self.pipeline.is_active(),
            limits: self.pipeline.limits(),
        }
    }

    pub fn pipeline(&self) -> &PipelineManager {
        &self.pipeline
    }

    pub fn delta(&self) -> &DeltaCache {
        &self.delta
    }

    pub fn process(&mut self, item: WorkItem) -> EncodeOutcome {
        match item {
            WorkItem::Encode(item) => self.encode(item),
            WorkItem::FlushVideo { sequence, frame, .. } => self.flush_video(sequence, frame),
            WorkItem::ResetPipeline { .. } => {
                debug!(window = self.window, "resetting encoder state");
                self.pipeline.reset();
                self.scroll.reset();
                self.delta.clear();
                self.outcome(0)
            }
            WorkItem::Close { .. } => {
                self.close();
                self.outcome(0)
            }
        }
    }

    /// Release the pipeline and every cached frame.
    pub fn close(&mut self) {
        self.pipeline.close();
        self.scroll.reset();
        self.delta.clear();
    }

    fn outcome(&self, sequence: u64) -> EncodeOutcome {
        EncodeOutcome {
            window: self.window,
            sequence,
            video: self.video_status(),
            ..Default::default()
        }
    }

    fn encode(&mut self, item: EncodeItem) -> EncodeOutcome {
        let mut out = self.outcome(item.sequence);
        out.damage_time = Some(item.damage_time);
        out.pixels = item.image.pixel_count();
        out.counted = true;
        if self.watermark.is_cancelled(item.sequence) {
            trace!(window = self.window, sequence = item.sequence, "dropping cancelled item");
            out.cancelled = true;
            return out;
        }
        if item.encoding.is_video() {
            self.encode_video(&item, &mut out);
        } else {
            self.still(&item, &item.image, item.encoding, &mut out);
        }
        if self.watermark.is_cancelled(item.sequence) {
            out.packets.clear();
            out.cancelled = true;
        }
        // one item may have become several packets
        let n = out.packets.len() as u32;
        for (i, packet) in out.packets.iter_mut().enumerate() {
            packet.codec_options.flush = Some(item.flush + (n - 1 - i as u32));
        }
        out.video = self.video_status();
        out
    }

    // ── Still path ───────────────────────────────────────────────

    fn still_encoder(&self, encoding: Encoding) -> Option<Arc<dyn StillEncoder>> {
        self.codecs
            .get(encoding)
            .or_else(|| self.codecs.first_of(PREFERRED_ORDER, &self.settings.allowed))
    }

    /// Encode `image` as a still, adding one packet to `out` on success.
    fn still(&mut self, item: &EncodeItem, image: &ImageBuffer, encoding: Encoding, out: &mut EncodeOutcome) -> bool {
        let Some(encoder) = self.still_encoder(encoding) else {
            warn!(window = self.window, %encoding, "no still encoder available");
            return false;
        };
        self.still_with(item, image, encoder.as_ref(), out)
    }

    fn still_with(
        &mut self,
        item: &EncodeItem,
        image: &ImageBuffer,
        encoder: &dyn StillEncoder,
        out: &mut EncodeOutcome,
    ) -> bool {
        let encoding = encoder.encoding();
        let mut options = CodecOptions {
            refresh: item.options.auto_refresh,
            ..Default::default()
        };
        let start = Instant::now();
        let result = if self.delta.eligible(image.pixel_count(), encoding) {
            self.encode_delta(encoder, image, item.quality, item.speed, &mut options)
        } else {
            encoder.encode(image, item.quality, item.speed)
        };
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!(window = self.window, %encoding, error = %e, "still encode failed");
                return false;
            }
        };
        options.quality = frame.quality;
        options.csc = frame.csc;
        out.samples.push(EncodeSample {
            encoding,
            pixels: image.pixel_count(),
            bpp: image.format.bytes_per_pixel() as u32 * 8,
            compressed: frame.data.len() as u64,
            elapsed: start.elapsed(),
        });
        out.packets.push(DrawPacket {
            window_id: self.window,
            x: image.x,
            y: image.y,
            width: image.width,
            height: image.height,
            encoding,
            payload: frame.data,
            sequence: 0,
            row_stride: frame.row_stride,
            codec_options: options,
        });
        true
    }

    /// Xor against a matching bucket, encode, and remember the original.
    fn encode_delta(
        &mut self,
        encoder: &dyn StillEncoder,
        image: &ImageBuffer,
        quality: u8,
        speed: u8,
        options: &mut CodecOptions,
    ) -> Result<StillFrame, CodecError> {
        let now = Instant::now();
        let original = image.packed_pixels();
        let mut data = original.clone();
        let lookup = self
            .delta
            .apply(&mut data, image.width, image.height, image.format, encoder.encoding(), now);
        let row_stride = image.row_bytes() as u32;
        let xored = ImageBuffer::new(image.rect(), row_stride, image.format, data, image.timestamp);
        let frame = encoder.encode(&xored, quality, speed)?;
        if let DeltaLookup::Hit { store, hits, .. } = lookup {
            trace!(window = self.window, store, hits, "sending delta");
            options.delta = Some(store);
        }
        self.store_counter += 1;
        let store = self.store_counter;
        if let Some(bucket) = self.delta.store(
            original,
            image.width,
            image.height,
            image.format,
            encoder.encoding(),
            store,
            &lookup,
            frame.data.len(),
            now,
        ) {
            options.store = Some(store);
            options.bucket = Some(bucket);
        }
        Ok(frame)
    }

    // ── Video path ───────────────────────────────────────────────

    fn encode_video(&mut self, item: &EncodeItem, out: &mut EncodeOutcome) {
        let image = &item.image;
        if self.settings.scrolling {
            if let Some(plan) = self.scroll.detect(image) {
                if !plan.copies.is_empty() {
                    self.send_scroll(item, plan, out);
                    return;
                }
            }
        }
        let req = PipelineRequest {
            encoding: item.encoding,
            width: image.width,
            height: image.height,
            src_format: image.format,
            quality: item.quality,
            min_quality: item.min_quality,
            speed: item.speed,
            min_speed: item.min_speed,
            hint: item.hint,
            now: Instant::now(),
        };
        self.pipeline.rescore(&req);
        let (mw, mh) = match self.pipeline.ensure(&req) {
            Ok(p) => p.masked_size(),
            Err(e) => {
                warn!(window = self.window, encoding = %item.encoding, error = %e, "video unavailable, sending still");
                out.events.push(EncodeEvent::VideoUnavailable { encoding: item.encoding });
                self.still(item, image, item.fallback, out);
                return;
            }
        };
        if (mw, mh) != (image.width, image.height) {
            if !self.settings.video.split_edges {
                trace!(window = self.window, "frame not aligned, sending still");
                self.still(item, image, item.fallback, out);
                return;
            }
            self.send_edges(item, mw, mh, out);
        }

        let Some(pipeline) = self.pipeline.pipeline_mut() else {
            return;
        };
        let encoding = pipeline.encoding;
        let start = Instant::now();
        let video = match pipeline.encode(image, item.quality, item.speed) {
            Ok(video) => video,
            Err(e) => {
                warn!(window = self.window, %encoding, error = %e, "video encode failed, closing pipeline");
                self.pipeline.close();
                self.still(item, image, item.fallback, out);
                return;
            }
        };
        let frame = video.frame;
        if frame.delayed > 0 {
            out.events.push(EncodeEvent::DelayedFrames {
                delayed: frame.delayed,
                frame: frame.frame,
            });
        }
        if frame.data.is_empty() {
            if frame.delayed > 0 && frame.frame == 0 {
                // first frame held back: paint a still now and skip
                // the frames the encoder will eventually return
                pipeline.start_video_frame = frame.delayed as u64;
                if let Some(fast) = self.codecs.first_of(FAST_ORDER, &self.settings.allowed) {
                    self.still_with(item, image, fast.as_ref(), out);
                }
            }
            return;
        }
        let paint = (frame.frame < pipeline.start_video_frame).then_some(false);
        out.samples.push(EncodeSample {
            encoding,
            pixels: mw as u64 * mh as u64,
            bpp: image.format.bytes_per_pixel() as u32 * 8,
            compressed: frame.data.len() as u64,
            elapsed: start.elapsed(),
        });
        out.packets.push(DrawPacket {
            window_id: self.window,
            x: image.x,
            y: image.y,
            width: mw,
            height: mh,
            encoding,
            payload: frame.data,
            sequence: 0,
            row_stride: 0,
            codec_options: CodecOptions {
                frame: Some(frame.frame),
                csc: Some(video.csc),
                scaled_size: video.scaled_size,
                quality: frame.quality,
                paint,
                ..Default::default()
            },
        });
    }

    /// Right and bottom strips the masked video frame leaves out.
    fn send_edges(&mut self, item: &EncodeItem, mw: u32, mh: u32, out: &mut EncodeOutcome) {
        let image = &item.image;
        let mut edges = Vec::new();
        if image.width > mw {
            edges.push(image.sub_image(mw, 0, image.width - mw, mh));
        }
        if image.height > mh {
            edges.push(image.sub_image(0, mh, image.width, image.height - mh));
        }
        for edge in edges.into_iter().flatten() {
            trace!(window = self.window, x = edge.x, y = edge.y, w = edge.width, h = edge.height, "sending video edge");
            self.still(item, &edge, item.fallback, out);
        }
    }

    fn send_scroll(&mut self, item: &EncodeItem, plan: ScrollPlan, out: &mut EncodeOutcome) {
        let image = &item.image;
        debug!(window = self.window, copies = plan.copies.len(), changed = plan.changed.len(), "sending scroll");
        out.packets.push(DrawPacket {
            window_id: self.window,
            x: image.x,
            y: image.y,
            width: image.width,
            height: image.height,
            encoding: Encoding::Scroll,
            payload: scroll_payload(&plan.copies),
            sequence: 0,
            row_stride: 0,
            codec_options: CodecOptions::default(),
        });
        for (start, rows) in plan.changed {
            if let Some(strip) = image.sub_image(0, start, image.width, rows) {
                self.still(item, &strip, item.fallback, out);
            }
        }
    }

    fn flush_video(&mut self, sequence: u64, frame: u64) -> EncodeOutcome {
        let mut out = self.outcome(sequence);
        if self.watermark.is_cancelled(sequence) {
            out.cancelled = true;
            return out;
        }
        let Some(pipeline) = self.pipeline.pipeline_mut() else {
            return out;
        };
        if frame == 0 {
            debug!(window = self.window, "first video frame never arrived, dropping pipeline");
            self.pipeline.close();
            out.events.push(EncodeEvent::RefreshWithoutVideo);
            out.video = self.video_status();
            return out;
        }
        let (mw, mh) = pipeline.masked_size();
        let encoding = pipeline.encoding;
        let csc = pipeline.csc_mode();
        let start_frame = pipeline.start_video_frame;
        match pipeline.flush(frame) {
            Ok(Some(flushed)) if !flushed.data.is_empty() => {
                if flushed.delayed > 0 {
                    out.events.push(EncodeEvent::DelayedFrames {
                        delayed: flushed.delayed,
                        frame: flushed.frame,
                    });
                }
                out.packets.push(DrawPacket {
                    window_id: self.window,
                    x: 0,
                    y: 0,
                    width: mw,
                    height: mh,
                    encoding,
                    payload: flushed.data,
                    sequence: 0,
                    row_stride: 0,
                    codec_options: CodecOptions {
                        frame: Some(flushed.frame),
                        csc: Some(csc),
                        scaled_size: flushed.scaled_size,
                        quality: flushed.quality,
                        paint: (flushed.frame < start_frame).then_some(false),
                        flush: Some(0),
                        ..Default::default()
                    },
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(window = self.window, error = %e, "video flush failed, dropping pipeline");
                self.pipeline.close();
                out.events.push(EncodeEvent::RefreshWithoutVideo);
            }
        }
        out.video = self.video_status();
        out
    }
}

impl std::fmt::Debug for WindowEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowEncoder")
            .field("window", &self.window)
            .field("pipeline", &self.pipeline)
            .field("delta", &self.delta.occupied())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DamageOptions;
    use crate::pipeline::ScalingHint;
    use crate::pipeline::manager::tests::{FakeRegistry, h264_registry};
    use crate::region::Rectangle;

    fn settings() -> EncoderSettings {
        let mut caps = ClientCapabilities::default();
        caps.csc_modes
            .insert(Encoding::H264, vec![PixelFormat::Yuv420p]);
        let mut config = EngineConfig::default();
        config.video.scaling = false;
        EncoderSettings::new(&config, &caps)
    }

    fn encoder(registry: FakeRegistry) -> (WindowEncoder, CancelWatermark) {
        let watermark = CancelWatermark::new();
        let enc = WindowEncoder::new(1, Arc::new(registry), settings(), watermark.clone(), DeltaEpoch::new());
        (enc, watermark)
    }

    fn image(x: u32, y: u32, width: u32, height: u32, fill: u8) -> ImageBuffer {
        let data = vec![fill; (width * height * 4) as usize];
        ImageBuffer::new(Rectangle::new(x, y, width, height), width * 4, PixelFormat::Bgrx, data, Instant::now())
    }

    fn item(sequence: u64, encoding: Encoding, image: ImageBuffer) -> WorkItem {
        let (w, h) = (image.width, image.height);
        WorkItem::Encode(EncodeItem {
            window: 1,
            sequence,
            damage_time: Instant::now(),
            image,
            encoding,
            fallback: Encoding::Rgb24,
            window_width: w,
            window_height: h,
            quality: 50,
            speed: 50,
            min_quality: 0,
            min_speed: 0,
            flush: 0,
            options: DamageOptions::default(),
            hint: ScalingHint::default(),
        })
    }

    #[test]
    fn still_item_becomes_one_packet() {
        let (mut enc, _) = encoder(FakeRegistry::default());
        let out = enc.process(item(1, Encoding::Rgb32, image(10, 20, 16, 16, 7)));
        assert_eq!(out.packets.len(), 1);
        let p = &out.packets[0];
        assert_eq!((p.x, p.y, p.width, p.height), (10, 20, 16, 16));
        assert_eq!(p.encoding, Encoding::Rgb32);
        assert_eq!(p.codec_options.flush, Some(0));
        assert_eq!(out.samples.len(), 1);
        assert!(out.counted);
    }

    #[test]
    fn cancelled_items_produce_nothing() {
        let (mut enc, watermark) = encoder(FakeRegistry::default());
        watermark.raise(5);
        let out = enc.process(item(5, Encoding::Rgb24, image(0, 0, 8, 8, 1)));
        assert!(out.cancelled);
        assert!(out.packets.is_empty());
        let out = enc.process(item(6, Encoding::Rgb24, image(0, 0, 8, 8, 1)));
        assert_eq!(out.packets.len(), 1);
    }

    #[test]
    fn repeated_regions_are_sent_as_deltas() {
        let (mut enc, _) = encoder(FakeRegistry::default());
        let first = enc.process(item(1, Encoding::Rgb24, image(0, 0, 64, 64, 3)));
        let opts = &first.packets[0].codec_options;
        assert_eq!(opts.delta, None);
        assert_eq!(opts.store, Some(1));
        let second = enc.process(item(2, Encoding::Rgb24, image(0, 0, 64, 64, 3)));
        assert_eq!(second.packets[0].codec_options.delta, Some(1));
    }

    #[test]
    fn reset_clears_delta_buckets() {
        let (mut enc, _) = encoder(FakeRegistry::default());
        enc.process(item(1, Encoding::Rgb24, image(0, 0, 64, 64, 3)));
        assert_eq!(enc.delta().occupied(), 1);
        enc.process(WorkItem::ResetPipeline { window: 1 });
        assert_eq!(enc.delta().occupied(), 0);
    }

    #[test]
    fn video_frame_uses_pipeline() {
        let (mut enc, _) = encoder(h264_registry());
        let out = enc.process(item(1, Encoding::H264, image(0, 0, 640, 480, 9)));
        assert_eq!(out.packets.len(), 1);
        let p = &out.packets[0];
        assert_eq!(p.encoding, Encoding::H264);
        assert_eq!(p.codec_options.frame, Some(1));
        assert_eq!(p.codec_options.csc, Some(PixelFormat::Yuv420p));
        assert!(out.video.active);
    }

    #[test]
    fn unaligned_video_sends_edges_as_stills() {
        let mut reg = h264_registry();
        for e in &mut reg.encoders {
            e.width_mask = 0xFFFE;
            e.height_mask = 0xFFFE;
        }
        let (mut enc, _) = encoder(reg);
        let mut out = enc.process(item(1, Encoding::H264, image(0, 0, 641, 481, 9)));
        assert_eq!(out.packets.len(), 3);
        let video = out.packets.pop().unwrap();
        assert_eq!((video.width, video.height), (640, 480));
        assert_eq!(video.codec_options.flush, Some(0));
        let right = &out.packets[0];
        assert_eq!((right.x, right.width, right.height), (640, 1, 480));
        assert_eq!(right.codec_options.flush, Some(2));
        let bottom = &out.packets[1];
        assert_eq!((bottom.y, bottom.width, bottom.height), (480, 641, 1));
    }

    #[test]
    fn missing_video_codec_falls_back_to_still() {
        let (mut enc, _) = encoder(FakeRegistry::default());
        let out = enc.process(item(1, Encoding::H264, image(0, 0, 64, 64, 9)));
        assert_eq!(out.events, vec![EncodeEvent::VideoUnavailable { encoding: Encoding::H264 }]);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0].encoding, Encoding::Rgb24);
        assert!(!out.video.active);
    }

    #[test]
    fn flush_of_first_frame_drops_pipeline() {
        let (mut enc, _) = encoder(h264_registry());
        enc.process(item(1, Encoding::H264, image(0, 0, 320, 240, 9)));
        assert!(enc.pipeline().is_active());
        let out = enc.process(WorkItem::FlushVideo {
            window: 1,
            sequence: 2,
            frame: 0,
        });
        assert_eq!(out.events, vec![EncodeEvent::RefreshWithoutVideo]);
        assert!(!out.video.active);
    }

    #[test]
    fn close_releases_pipeline() {
        let (mut enc, _) = encoder(h264_registry());
        enc.process(item(1, Encoding::H264, image(0, 0, 320, 240, 9)));
        enc.process(WorkItem::Close { window: 1 });
        assert!(!enc.pipeline().is_active());
    }
}
