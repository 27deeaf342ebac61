//! Tensor geometry, memory layouts and per-layer storage
//!
//! - `shape`: `(C, D, H, W)` plus channel padding
//! - `format`: plain/blocked layouts, descriptors, sub-views and reorders
//! - `buffer`: owned activation and gradient arrays

pub mod buffer;
pub mod format;
pub mod shape;

pub use buffer::TensorBuffer;
pub use format::{
    inherit_format, reorder_data, reorder_weights, DataFormat, Descriptors, FormatPreference,
    MemoryDesc, WeightsDesc, WeightsFormat,
};
pub use shape::{padded_channels, Shape, VECTOR_SIZE};
