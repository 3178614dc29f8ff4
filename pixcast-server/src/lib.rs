//! # pixcast-server
//!
//! Host for the pixcast encoding engine.
//!
//! Runs the engine against a synthetic display whose windows show
//! full-motion video, scrolling text and typing, encodes with software
//! stand-ins for real codecs, and feeds acks back from a simulated
//! client with configurable latency, bandwidth and decode cost. Useful
//! for watching the feedback loops (batch delay, quality, speed,
//! encoding choice) settle under different link conditions.

pub mod codecs;
pub mod config;
pub mod display;
pub mod service;
