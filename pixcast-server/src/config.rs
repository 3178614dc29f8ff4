//! Configuration for the pixcast host.

use std::path::Path;

use serde::{Deserialize, Serialize};

use pixcast_core::{ClientCapabilities, Encoding, EngineConfig, EngineError, WindowFlags, WindowId};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Engine tuning: batching, selection, refresh, pipelines.
    pub engine: EngineConfig,
    /// What the simulated client negotiated.
    pub session: SessionConfig,
    /// Synthetic windows and how long to drive them.
    pub demo: DemoConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Client side of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Encoding names the client decodes, e.g. "h264", "jpeg", "rgb24".
    pub encodings: Vec<String>,
    /// Delta buckets the client keeps (0 disables delta).
    pub delta_buckets: usize,
    pub scrolling: bool,
    pub mmap: bool,
    /// Audio latency to compensate in video packets.
    pub av_sync_delay_ms: u32,
    /// Link bandwidth in megabits per second (0 = unlimited).
    pub bandwidth_mbps: u64,
    /// Simulated client decode cost per megapixel.
    pub decode_ms_per_mpixel: u64,
    /// Simulated one-way network latency.
    pub latency_ms: u64,
}

/// Synthetic display settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Content updates per second.
    pub fps: u32,
    /// Stop after this many seconds (0 = until Ctrl-C).
    pub duration_secs: u64,
    /// Statistics are logged this often.
    pub stats_interval_secs: u64,
    /// Frames the simulated video encoder holds back.
    pub video_lookahead: u32,
    pub windows: Vec<DemoWindow>,
}

/// What a synthetic window shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Content {
    /// Every pixel changes every frame.
    Video,
    /// The content moves up a few lines per frame.
    Scroll,
    /// A small area near the cursor changes.
    Typing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoWindow {
    pub id: WindowId,
    pub width: u32,
    pub height: u32,
    pub content: Content,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub fullscreen: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Print the final statistics snapshot as JSON.
    pub json_stats: bool,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            encodings: ["h264", "vp9", "webp", "png", "jpeg", "rgb24", "rgb32"]
                .into_iter()
                .map(String::from)
                .collect(),
            delta_buckets: 5,
            scrolling: true,
            mmap: false,
            av_sync_delay_ms: 0,
            bandwidth_mbps: 0,
            decode_ms_per_mpixel: 4,
            latency_ms: 5,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            duration_secs: 10,
            stats_interval_secs: 2,
            video_lookahead: 0,
            windows: vec![
                DemoWindow {
                    id: 1,
                    width: 1280,
                    height: 720,
                    content: Content::Video,
                    focused: true,
                    fullscreen: false,
                },
                DemoWindow {
                    id: 2,
                    width: 800,
                    height: 600,
                    content: Content::Scroll,
                    focused: false,
                    fullscreen: false,
                },
                DemoWindow {
                    id: 3,
                    width: 640,
                    height: 480,
                    content: Content::Typing,
                    focused: false,
                    fullscreen: false,
                },
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_stats: false,
        }
    }
}

impl DemoWindow {
    pub fn flags(&self) -> WindowFlags {
        let mut flags = WindowFlags::empty();
        flags.set(WindowFlags::FOCUSED, self.focused);
        flags.set(WindowFlags::FULLSCREEN, self.fullscreen);
        flags
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Client capabilities described by `[session]`.
    pub fn capabilities(&self) -> Result<ClientCapabilities, EngineError> {
        let s = &self.session;
        let encodings = s
            .encodings
            .iter()
            .map(|name| name.parse::<Encoding>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientCapabilities {
            encodings,
            delta_buckets: s.delta_buckets,
            scrolling: s.scrolling,
            mmap: s.mmap,
            av_sync_delay_ms: s.av_sync_delay_ms,
            bandwidth_limit: s.bandwidth_mbps * 1_000_000,
            ..Default::default()
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        assert!(text.contains("[engine.batch]"));
        assert!(text.contains("[[demo.windows]]"));
        assert!(text.contains("decode_ms_per_mpixel"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.demo.windows.len(), 3);
        assert_eq!(parsed.demo.windows[1].content, Content::Scroll);
        assert_eq!(parsed.engine.batch.start_delay_ms, 50);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let parsed: ServerConfig = toml::from_str("[session]\nmmap = true\n[engine.refresh]\nenabled = false\n").unwrap();
        assert!(parsed.session.mmap);
        assert!(!parsed.engine.refresh.enabled);
        assert_eq!(parsed.session.delta_buckets, 5);
        assert_eq!(parsed.demo.fps, 30);
    }

    #[test]
    fn capabilities_reject_unknown_encodings() {
        let mut cfg = ServerConfig::default();
        let caps = cfg.capabilities().unwrap();
        assert!(caps.supports(Encoding::H264));
        assert!(!caps.supports(Encoding::Vp8));
        cfg.session.encodings.push("gif".into());
        assert!(matches!(cfg.capabilities(), Err(EngineError::UnknownEncoding(_))));
    }
}
