//! Encoding kinds, window classes and negotiated client capabilities.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::PixelFormat;

// ── Encoding ─────────────────────────────────────────────────────

/// Every picture encoding the engine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Encoding {
    /// Zero-copy shared-memory area.
    #[serde(rename = "mmap")]
    Mmap,
    #[serde(rename = "rgb24")]
    Rgb24,
    #[serde(rename = "rgb32")]
    Rgb32,
    #[serde(rename = "png")]
    Png,
    /// Palette png.
    #[serde(rename = "png/P")]
    PngP,
    /// Greyscale png.
    #[serde(rename = "png/L")]
    PngL,
    #[serde(rename = "jpeg")]
    Jpeg,
    #[serde(rename = "webp")]
    Webp,
    #[serde(rename = "h264")]
    H264,
    #[serde(rename = "h265")]
    H265,
    #[serde(rename = "vp8")]
    Vp8,
    #[serde(rename = "vp9")]
    Vp9,
    /// Copy-rectangle instructions produced by scroll detection.
    #[serde(rename = "scroll")]
    Scroll,
}

/// Preference order used when a fallback still encoding is needed.
pub const PREFERRED_ORDER: &[Encoding] = &[
    Encoding::H264,
    Encoding::Vp9,
    Encoding::Vp8,
    Encoding::H265,
    Encoding::Png,
    Encoding::PngP,
    Encoding::PngL,
    Encoding::Webp,
    Encoding::Rgb24,
    Encoding::Rgb32,
    Encoding::Jpeg,
];

/// Fastest still encodings first, for a quick fallback frame.
pub const FAST_ORDER: &[Encoding] = &[
    Encoding::Jpeg,
    Encoding::Rgb24,
    Encoding::Rgb32,
    Encoding::Png,
    Encoding::Webp,
];

impl Encoding {
    pub const fn name(self) -> &'static str {
        match self {
            Encoding::Mmap => "mmap",
            Encoding::Rgb24 => "rgb24",
            Encoding::Rgb32 => "rgb32",
            Encoding::Png => "png",
            Encoding::PngP => "png/P",
            Encoding::PngL => "png/L",
            Encoding::Jpeg => "jpeg",
            Encoding::Webp => "webp",
            Encoding::H264 => "h264",
            Encoding::H265 => "h265",
            Encoding::Vp8 => "vp8",
            Encoding::Vp9 => "vp9",
            Encoding::Scroll => "scroll",
        }
    }

    pub const fn is_video(self) -> bool {
        matches!(
            self,
            Encoding::H264 | Encoding::H265 | Encoding::Vp8 | Encoding::Vp9
        )
    }

    /// Still encodings that never lose information.
    pub const fn is_lossless(self) -> bool {
        matches!(
            self,
            Encoding::Mmap | Encoding::Rgb24 | Encoding::Rgb32 | Encoding::Png | Encoding::Scroll
        )
    }

    pub const fn supports_alpha(self) -> bool {
        matches!(
            self,
            Encoding::Mmap | Encoding::Rgb32 | Encoding::Png | Encoding::Webp
        )
    }

    /// Encodings that may use a cached delta bucket.
    pub const fn supports_delta(self) -> bool {
        matches!(self, Encoding::Rgb24 | Encoding::Rgb32)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let enc = match s {
            "mmap" => Encoding::Mmap,
            // plain "rgb" is resolved to the alpha variant later on
            "rgb" | "rgb24" => Encoding::Rgb24,
            "rgb32" => Encoding::Rgb32,
            "png" => Encoding::Png,
            "png/P" => Encoding::PngP,
            "png/L" => Encoding::PngL,
            "jpeg" => Encoding::Jpeg,
            "webp" => Encoding::Webp,
            "h264" => Encoding::H264,
            "h265" => Encoding::H265,
            "vp8" => Encoding::Vp8,
            "vp9" => Encoding::Vp9,
            "scroll" => Encoding::Scroll,
            other => return Err(EngineError::UnknownEncoding(other.to_string())),
        };
        Ok(enc)
    }
}

// ── WindowFlags ──────────────────────────────────────────────────

bitflags! {
    /// Window class and state bits that influence scheduling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct WindowFlags: u16 {
        /// Override-redirect (menus, tooltips).
        const OVERRIDE_REDIRECT = 0x0001;
        /// System tray icon.
        const TRAY              = 0x0002;
        /// Shadow of a whole desktop.
        const SHADOW            = 0x0004;
        const FOCUSED           = 0x0008;
        const FULLSCREEN        = 0x0010;
        const MAXIMIZED         = 0x0020;
        /// Window content carries an alpha channel.
        const ALPHA             = 0x0040;
        /// Only ever send full frames for this window.
        const FULL_FRAMES_ONLY  = 0x0080;
    }
}

impl WindowFlags {
    /// Small, latency-sensitive windows that get a larger raw-RGB budget.
    pub fn is_transient_class(self) -> bool {
        self.intersects(WindowFlags::OVERRIDE_REDIRECT | WindowFlags::TRAY | WindowFlags::SHADOW)
    }
}

// ── ClientCapabilities ───────────────────────────────────────────

/// What the remote client negotiated for this connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCapabilities {
    /// Encodings the client can decode.
    pub encodings: Vec<Encoding>,
    /// Colour subsampling modes accepted per video encoding.
    pub csc_modes: BTreeMap<Encoding, Vec<PixelFormat>>,
    /// Number of delta buckets the client keeps (0 disables delta).
    pub delta_buckets: usize,
    /// Client paints `scroll` packets.
    pub scrolling: bool,
    /// Client honours the flush hint.
    pub flush: bool,
    /// Client accepts downscaled video frames.
    pub video_scaling: bool,
    /// A shared-memory area is available.
    pub mmap: bool,
    /// Audio-to-screen latency the client wants compensated, in ms.
    pub av_sync_delay_ms: u32,
    /// Pixel throughput the client can decode, if known.
    pub decode_mpixels_per_sec: Option<f64>,
    /// Bandwidth limit in bits/s (0 = unknown).
    pub bandwidth_limit: u64,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        let mut csc_modes = BTreeMap::new();
        for enc in [Encoding::H264, Encoding::H265, Encoding::Vp8, Encoding::Vp9] {
            csc_modes.insert(enc, vec![PixelFormat::Yuv420p, PixelFormat::Yuv444p]);
        }
        Self {
            encodings: vec![
                Encoding::Rgb24,
                Encoding::Rgb32,
                Encoding::Png,
                Encoding::Jpeg,
                Encoding::Webp,
                Encoding::H264,
                Encoding::Vp8,
                Encoding::Vp9,
            ],
            csc_modes,
            delta_buckets: 5,
            scrolling: true,
            flush: true,
            video_scaling: true,
            mmap: false,
            av_sync_delay_ms: 0,
            decode_mpixels_per_sec: None,
            bandwidth_limit: 0,
        }
    }
}

impl ClientCapabilities {
    pub fn supports(&self, encoding: Encoding) -> bool {
        match encoding {
            Encoding::Mmap => self.mmap,
            Encoding::Scroll => self.scrolling,
            other => self.encodings.contains(&other),
        }
    }

    pub fn video_encodings(&self) -> impl Iterator<Item = Encoding> + '_ {
        self.encodings.iter().copied().filter(|e| e.is_video())
    }

    pub fn non_video_encodings(&self) -> impl Iterator<Item = Encoding> + '_ {
        self.encodings.iter().copied().filter(|e| !e.is_video())
    }

    /// Subsampling modes the client accepts for `encoding`.
    pub fn csc_modes_for(&self, encoding: Encoding) -> &[PixelFormat] {
        self.csc_modes
            .get(&encoding)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!("h264".parse::<Encoding>().unwrap(), Encoding::H264);
        assert_eq!("png/P".parse::<Encoding>().unwrap(), Encoding::PngP);
        assert_eq!("rgb".parse::<Encoding>().unwrap(), Encoding::Rgb24);
        assert!("gif".parse::<Encoding>().is_err());
    }

    #[test]
    fn classification() {
        assert!(Encoding::Vp9.is_video());
        assert!(!Encoding::Webp.is_video());
        assert!(Encoding::Png.is_lossless());
        assert!(!Encoding::Jpeg.is_lossless());
        assert!(!Encoding::Jpeg.supports_alpha());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Encoding::PngL).unwrap();
        assert_eq!(json, "\"png/L\"");
    }

    #[test]
    fn transient_class() {
        assert!(WindowFlags::TRAY.is_transient_class());
        assert!(!(WindowFlags::FOCUSED | WindowFlags::MAXIMIZED).is_transient_class());
    }

    #[test]
    fn capabilities_support() {
        let caps = ClientCapabilities::default();
        assert!(caps.supports(Encoding::H264));
        assert!(!caps.supports(Encoding::Mmap));
        assert_eq!(caps.video_encodings().count(), 3);
        assert!(caps.csc_modes_for(Encoding::Png).is_empty());
    }
}
