//! Damage batching: per-window delay state, the batching state machine
//! and region packing.

pub mod config;
pub mod packing;
pub mod scheduler;

pub use config::BatchConfig;
pub use packing::{PackingInput, PlannedRegion, plan_regions};
pub use scheduler::{BatchScheduler, DamageOptions, Flush, SchedulerContext, TimerOutcome};
