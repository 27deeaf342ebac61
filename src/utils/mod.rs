//! Shared numeric utilities
//!
//! This module provides the pieces the layers build on: the fused activation
//! family, compensated summation, per-channel statistics, parameter
//! persistence and the deterministic RNG used for weight initialization.

pub mod activations;
pub mod kahan;
pub mod persist;
pub mod rng;
pub mod statistics;

pub use activations::{Activation, ActivationFn};
pub use kahan::{kahan_sum, KahanSum};
pub use persist::Persist;
pub use rng::SimpleRng;
pub use statistics::{channel_statistics, ChannelStats, StatisticsMode};
