//! # pixcast-core
//!
//! Per-window adaptive screen-update encoding engine.
//!
//! This crate contains:
//! - **Engine**: `WindowEncodeEngine`, the clock-driven capture context
//!   that batches damage, picks encodings and tracks client acks
//! - **Batching**: per-window delay state, the batch state machine and
//!   region packing
//! - **Control**: batch delay, quality and speed feedback loops
//! - **Selection**: the encoding selector and video region detection
//! - **Pipelines**: video codec scoring, scaling and lifecycle
//! - **Window encoder**: the encode context (delta, scroll, video, stills)
//! - **Service**: `EngineService`, the Tokio host with per-window workers
//! - **Error**: `EngineError`, typed, `thiserror`-based errors

pub mod avsync;
pub mod batch;
pub mod codec;
pub mod config;
pub mod control;
pub mod delta;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod refresh;
pub mod region;
pub mod scroll;
pub mod selector;
pub mod service;
pub mod stats;
pub mod subregion;
pub mod timer;
pub mod types;
pub mod window;
pub mod worker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use batch::DamageOptions;
pub use codec::{BuiltinRegistry, StillEncoder, StillFrame};
pub use config::EngineConfig;
pub use control::ReconfigureTargets;
pub use encoding::{ClientCapabilities, Encoding, WindowFlags};
pub use engine::{CaptureBackend, DecodeResult, WindowEncodeEngine};
pub use error::{CaptureError, CodecError, EngineError};
pub use packet::{CodecOptions, DrawPacket};
pub use pipeline::CodecRegistry;
pub use region::{Rectangle, RegionSet};
pub use service::{EngineCommand, EngineHandle, EngineService};
pub use stats::{Statistics, WindowSnapshot};
pub use types::{BufferTracker, ImageBuffer, PixelFormat, WindowId};
pub use window::{EncodeOutcome, WindowEncoder, WorkItem};
pub use worker::EncodeWorkers;
