//! Error types shared by every layer and the graph executor
//!
//! Configuration problems (shape or layout disagreements, indivisible channel
//! groups, bad constructor parameters) are reported while the graph is built or
//! while descriptors are initialized. Backend failures are passed through
//! unchanged.

use thiserror::Error;

/// Errors raised by the layer engine.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Two connected layers disagree on the tensor shape.
    #[error("shape mismatch in layer '{layer}': {detail}")]
    ShapeMismatch { layer: String, detail: String },

    /// Inputs of a combining layer are stored in different memory layouts.
    #[error("incompatible memory formats in layer '{layer}'")]
    IncompatibleFormats { layer: String },

    /// The forward and gradient layouts of an upstream tensor differ.
    #[error("src and diff format are different in layer '{layer}'")]
    SrcDiffFormatMismatch { layer: String },

    /// Channel count cannot be split evenly into the requested groups.
    #[error("input not splittable in layer '{layer}': {channels} channels into {groups} groups")]
    NotSplittable {
        layer: String,
        channels: usize,
        groups: usize,
    },

    /// A constructor or configuration value is out of range.
    #[error("invalid parameter in layer '{layer}': {detail}")]
    InvalidParameter { layer: String, detail: String },

    /// Unbiased variance needs at least two samples per channel.
    #[error("layer '{layer}' needs batch x spatial extent >= 2 for training statistics, got {count}")]
    InsufficientStatistics { layer: String, count: usize },

    /// Backward pass requested without a preceding training forward pass.
    #[error("backward pass of layer '{layer}' requires a training forward pass")]
    BackwardWithoutForward { layer: String },

    /// A layer handle or name does not resolve to a node.
    #[error("unknown layer '{0}'")]
    UnknownLayer(String),

    /// The same upstream layer is listed twice.
    #[error("layer '{layer}' lists input '{input}' more than once")]
    DuplicateInput { layer: String, input: String },

    /// Graph used before `initialize` was called.
    #[error("graph is not initialized")]
    NotInitialized,

    /// Buffer length does not match the descriptor it is bound to.
    #[error("buffer length mismatch: expected {expected}, got {actual}")]
    BufferLength { expected: usize, actual: usize },

    /// Failure reported by the tensor-primitive backend.
    #[error("backend '{backend}' failed: {detail}")]
    Backend { backend: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, LayerError>;

impl LayerError {
    pub(crate) fn invalid(layer: &str, detail: impl Into<String>) -> Self {
        LayerError::InvalidParameter {
            layer: layer.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn shape(layer: &str, detail: impl Into<String>) -> Self {
        LayerError::ShapeMismatch {
            layer: layer.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn backend(backend: &str, detail: impl Into<String>) -> Self {
        LayerError::Backend {
            backend: backend.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the error belongs to the configuration class (fatal at build time).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LayerError::ShapeMismatch { .. }
                | LayerError::IncompatibleFormats { .. }
                | LayerError::SrcDiffFormatMismatch { .. }
                | LayerError::NotSplittable { .. }
                | LayerError::InvalidParameter { .. }
                | LayerError::InsufficientStatistics { .. }
                | LayerError::DuplicateInput { .. }
        )
    }
}
