//! Pixel formats and owned image buffers.
//!
//! [`ImageBuffer`] is the unit of ownership that crosses from the
//! capture context to the encode context. It is deliberately not
//! `Clone`: a captured buffer is moved into an encode item and dropped
//! exactly once, whichever path the item takes. Buffers created from a
//! [`BufferTracker`] decrement its live count when dropped, which makes
//! leaks observable.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::region::Rectangle;

/// Identifier of a managed window.
pub type WindowId = u64;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of captured or converted images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// 4 bytes per pixel, padding byte ignored.
    Bgrx,
    Bgra,
    Rgbx,
    Rgba,
    /// 3 bytes per pixel.
    Rgb,
    Bgr,
    /// Planar YUV, chroma halved in both directions.
    Yuv420p,
    /// Planar YUV, chroma halved horizontally.
    Yuv422p,
    /// Planar YUV, full resolution chroma.
    Yuv444p,
    /// Semi-planar YUV with 4:2:0 subsampling.
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, bytes per luma sample for
    /// planar ones.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgrx | PixelFormat::Bgra | PixelFormat::Rgbx | PixelFormat::Rgba => 4,
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            _ => 1,
        }
    }

    pub const fn is_yuv(self) -> bool {
        matches!(
            self,
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p | PixelFormat::Nv12
        )
    }

    /// Per-plane `(x, y)` divisors, for planar YUV formats.
    pub const fn subsampling_divs(self) -> Option<[(u32, u32); 3]> {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => Some([(1, 1), (2, 2), (2, 2)]),
            PixelFormat::Yuv422p => Some([(1, 1), (2, 1), (2, 1)]),
            PixelFormat::Yuv444p => Some([(1, 1), (1, 1), (1, 1)]),
            _ => None,
        }
    }

    /// The subsampling mode a client should assume for this format.
    ///
    /// NV12 carries the same chroma layout as YUV420P, and a BGRX
    /// stream fed to a video encoder is treated as full-chroma.
    pub const fn csc_equiv(self) -> PixelFormat {
        match self {
            PixelFormat::Nv12 => PixelFormat::Yuv420p,
            PixelFormat::Bgrx => PixelFormat::Yuv444p,
            other => other,
        }
    }

    /// Relative preference for a format when the pipeline downscales.
    ///
    /// Subsampled formats lose little more when scaled, packed RGB loses
    /// a lot; values are multiplied by half into the quality score.
    pub const fn lossy_scaling_factor(self) -> f64 {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => 3.0,
            PixelFormat::Yuv422p => 2.5,
            PixelFormat::Yuv444p => 2.0,
            _ => 1.0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            PixelFormat::Bgrx => "BGRX",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Rgbx => "RGBX",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
            PixelFormat::Yuv420p => "YUV420P",
            PixelFormat::Yuv422p => "YUV422P",
            PixelFormat::Yuv444p => "YUV444P",
            PixelFormat::Nv12 => "NV12",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── BufferTracker ────────────────────────────────────────────────

/// Counts image buffers that are alive.
///
/// Cloning the tracker shares the counter.
#[derive(Debug, Clone, Default)]
pub struct BufferTracker {
    live: Arc<AtomicUsize>,
}

impl BufferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked buffers not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> BufferGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        BufferGuard {
            live: Arc::clone(&self.live),
        }
    }
}

#[derive(Debug)]
struct BufferGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── ImageBuffer ──────────────────────────────────────────────────

/// An owned block of pixels captured from (or derived from) a window.
///
/// `data` holds `height` rows of `stride` bytes for packed formats. For
/// planar formats `stride` is the luma row pitch and the chroma planes
/// follow the luma plane.
#[derive(Debug)]
pub struct ImageBuffer {
    /// Position of the image inside its window.
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes (may exceed `width * bpp`).
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// When the pixels were read.
    pub timestamp: Instant,
    guard: Option<BufferGuard>,
}

impl ImageBuffer {
    /// Wrap raw pixel data. The buffer is not tracked.
    pub fn new(
        rect: Rectangle,
        stride: u32,
        format: PixelFormat,
        data: Vec<u8>,
        timestamp: Instant,
    ) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            stride,
            format,
            data,
            timestamp,
            guard: None,
        }
    }

    /// Register this buffer with `tracker` until it is dropped.
    pub fn tracked(mut self, tracker: &BufferTracker) -> Self {
        if self.guard.is_none() {
            self.guard = Some(tracker.acquire());
        }
        self
    }

    pub fn rect(&self) -> Rectangle {
        Rectangle::new(self.x, self.y, self.width, self.height)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bytes in one tightly packed row.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Returns a row slice without padding, or `None` past the end.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride as usize;
        self.data.get(start..start + self.row_bytes())
    }

    /// Copy a sub-rectangle (relative to this image) into a new buffer.
    ///
    /// The copy shares the tracker of its parent. Only packed formats
    /// can be cut.
    pub fn sub_image(&self, x: u32, y: u32, width: u32, height: u32) -> Option<ImageBuffer> {
        if self.format.is_yuv() || x + width > self.width || y + height > self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let row_len = width as usize * bpp;
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in y..y + height {
            let start = row as usize * self.stride as usize + x as usize * bpp;
            data.extend_from_slice(self.data.get(start..start + row_len)?);
        }
        Some(ImageBuffer {
            x: self.x + x,
            y: self.y + y,
            width,
            height,
            stride: row_len as u32,
            format: self.format,
            data,
            timestamp: self.timestamp,
            guard: self.guard.as_ref().map(|g| {
                g.live.fetch_add(1, Ordering::SeqCst);
                BufferGuard {
                    live: Arc::clone(&g.live),
                }
            }),
        })
    }

    /// Drop row padding so that `stride == width * bpp`.
    ///
    /// Returns `false` for planar formats, which are left untouched.
    pub fn restride(&mut self) -> bool {
        if self.format.is_yuv() {
            return false;
        }
        let row_len = self.row_bytes();
        if self.stride as usize == row_len {
            return true;
        }
        let mut packed = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height {
            let start = y as usize * self.stride as usize;
            match self.data.get(start..start + row_len) {
                Some(row) => packed.extend_from_slice(row),
                None => return false,
            }
        }
        self.data = packed;
        self.stride = row_len as u32;
        true
    }

    /// Tightly packed pixel bytes.
    pub fn packed_pixels(&self) -> Vec<u8> {
        let row_len = self.row_bytes();
        if self.stride as usize == row_len || self.format.is_yuv() {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height {
            if let Some(row) = self.row(y) {
                out.extend_from_slice(row);
            }
        }
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_image(w: u32, h: u32, stride: u32) -> ImageBuffer {
        let mut data = vec![0u8; (stride * h) as usize];
        for y in 0..h {
            for x in 0..w {
                let off = (y * stride + x * 4) as usize;
                data[off] = x as u8;
                data[off + 1] = y as u8;
            }
        }
        ImageBuffer::new(
            Rectangle::sized(w, h),
            stride,
            PixelFormat::Bgrx,
            data,
            Instant::now(),
        )
    }

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(PixelFormat::Bgra.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgb.bytes_per_pixel(), 3);
        assert!(PixelFormat::Nv12.is_yuv());
    }

    #[test]
    fn csc_equivalents() {
        assert_eq!(PixelFormat::Nv12.csc_equiv(), PixelFormat::Yuv420p);
        assert_eq!(PixelFormat::Bgrx.csc_equiv(), PixelFormat::Yuv444p);
        assert_eq!(PixelFormat::Yuv422p.csc_equiv(), PixelFormat::Yuv422p);
    }

    #[test]
    fn tracker_counts_live_buffers() {
        let tracker = BufferTracker::new();
        let img = make_image(8, 8, 32).tracked(&tracker);
        assert_eq!(tracker.live(), 1);
        let sub = img.sub_image(2, 2, 4, 4).unwrap();
        assert_eq!(tracker.live(), 2);
        drop(img);
        assert_eq!(tracker.live(), 1);
        drop(sub);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn sub_image_copies_pixels() {
        let img = make_image(8, 8, 40);
        let sub = img.sub_image(3, 5, 2, 2).unwrap();
        assert_eq!((sub.x, sub.y), (3, 5));
        assert_eq!(sub.stride, 8);
        assert_eq!(sub.row(0).unwrap()[0], 3);
        assert_eq!(sub.row(1).unwrap()[1], 6);
        assert!(img.sub_image(7, 7, 2, 2).is_none());
    }

    #[test]
    fn restride_removes_padding() {
        let mut img = make_image(4, 3, 24);
        assert!(img.restride());
        assert_eq!(img.stride, 16);
        assert_eq!(img.data.len(), 48);
        assert_eq!(img.row(2).unwrap()[1], 2);
    }
}
