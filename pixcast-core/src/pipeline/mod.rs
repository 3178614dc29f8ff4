//! Video pipelines: codec descriptions, candidate scoring, scaling and
//! the per-window pipeline lifecycle.

pub mod manager;
pub mod scaling;
pub mod scoring;
pub mod spec;

pub use manager::{PipelineManager, PipelineRequest, VideoFrame, VideoPipeline};
pub use scaling::{ScalingHint, calculate_scaling};
pub use scoring::{NO_SCALING, PipelineOption, RunningShape, ScoreTargets};
pub use spec::{
    CodecRegistry, CscConverter, CscParams, CscSpec, EncodedFrame, EncoderParams, EncoderSpec, VideoEncoder,
};
