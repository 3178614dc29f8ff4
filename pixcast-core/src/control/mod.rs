//! Feedback control: batch delay, quality and speed.

pub mod average;
pub mod delay;
pub mod quality;

pub use average::{Factor, Smoothing, logp, time_weighted_average};
pub use delay::{
    DelayInputs, WindowDelay, baseline_delay, calculate_batch_delay, low_limit, may_skip_recalculation,
};
pub use quality::{ControlInputs, QualitySpeedController, ReconfigureTargets};
