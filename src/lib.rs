//! Rust Layer Engine Library
//!
//! Execution engine for neural-network layers over channel-padded tensors:
//! fused batch normalization with activations, depthwise and partial
//! depthwise convolutions, averaging and spatial resampling, wired together
//! in an arena-backed layer graph.
//!
//! # Modules
//!
//! - `tensor`: shapes, plain/blocked layouts, sub-views, reorders and buffers
//! - `backend`: tensor-primitive backend contract and the CPU implementation
//! - `layers`: Layer trait and its variants
//! - `graph`: layer arena and forward/backward executor
//! - `parallel`: parallel-for dispatcher
//! - `utils`: activations, compensated summation, statistics, persistence, RNG
//! - `config`: engine-wide execution options
//! - `architecture`: JSON graph descriptions
//! - `error`: error type shared by all of the above

pub mod architecture;
pub mod backend;
pub mod config;
pub mod error;
pub mod graph;
pub mod layers;
pub mod parallel;
pub mod tensor;
pub mod utils;

pub use config::EngineConfig;
pub use error::{LayerError, Result};
pub use graph::{Graph, LayerId};
pub use layers::{Layer, LayerSpec, LayerVariant};
pub use tensor::{DataFormat, FormatPreference, Shape};
