//! Layer trait definition for the execution engine
//!
//! This module defines the contract every layer variant satisfies: descriptor
//! negotiation, forward propagation, backward propagation and the static
//! connectivity multipliers used by weight initialization. Buffers are owned by
//! the graph executor and lent to the layer for the duration of one call
//! through the context structs below.

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::parallel::Dispatcher;
use crate::tensor::{Descriptors, Shape};
use crate::utils::persist::Persist;
use serde::{Deserialize, Serialize};

/// Type tag of a layer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerType {
    Input,
    Average,
    BatchNormActivation,
    BatchNormRelu,
    DepthwiseConvolution,
    PartialDepthwiseConvolution,
    Resampling,
}

impl LayerType {
    pub fn name(self) -> &'static str {
        match self {
            LayerType::Input => "Input",
            LayerType::Average => "Average",
            LayerType::BatchNormActivation => "BatchNormActivation",
            LayerType::BatchNormRelu => "BatchNormRelu",
            LayerType::DepthwiseConvolution => "DepthwiseConvolution",
            LayerType::PartialDepthwiseConvolution => "PartialDepthwiseConvolution",
            LayerType::Resampling => "Resampling",
        }
    }
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which statistics and primitives a layer was initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Inference,
    Training,
}

impl Mode {
    pub fn from_training(training: bool) -> Self {
        if training {
            Mode::Training
        } else {
            Mode::Inference
        }
    }

    pub fn is_training(self) -> bool {
        self == Mode::Training
    }
}

/// Whether buffers and descriptors exist for a batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Materialization {
    #[default]
    Uninitialized,
    Initialized { batch_size: usize },
}

/// Arguments of [`Layer::initialize_descriptors`].
pub struct InitContext<'a> {
    pub backend: &'a dyn Backend,
    pub config: &'a EngineConfig,
    pub batch_size: usize,
    pub training: bool,
    /// Resolved output descriptors of the upstream layers, in input order.
    pub inputs: &'a [Descriptors],
}

/// Arguments of [`Layer::forward_prop`].
pub struct ForwardContext<'a> {
    pub backend: &'a dyn Backend,
    pub dispatcher: &'a Dispatcher,
    pub config: &'a EngineConfig,
    pub batch_size: usize,
    pub training: bool,
    /// Upstream activations, in input order.
    pub inputs: Vec<&'a [f32]>,
    /// The layer's own activation buffer.
    pub neurons: &'a mut [f32],
}

/// One upstream tensor as seen by a backward pass.
pub struct InputGradient<'a> {
    pub neurons: &'a [f32],
    pub neurons_d1: &'a mut [f32],
    /// The upstream tensor has more than one consumer; gradients must be added.
    pub shared: bool,
}

/// Arguments of [`Layer::backward_prop`].
pub struct BackwardContext<'a> {
    pub backend: &'a dyn Backend,
    pub dispatcher: &'a Dispatcher,
    pub config: &'a EngineConfig,
    pub batch_size: usize,
    pub inputs: Vec<InputGradient<'a>>,
    /// The layer's own activations from the paired training forward pass.
    pub neurons: &'a [f32],
    /// The layer's own gradient. Stale when `in_place` is set.
    pub neurons_d1: &'a [f32],
    /// The output gradient was handed to the single input's gradient buffer
    /// and must be rewritten there element by element.
    pub in_place: bool,
}

/// Core trait for engine layers.
///
/// Implemented by every variant (see [`crate::layers::LayerVariant`]). A layer
/// never owns its upstream tensors; the executor lends them per call.
///
/// # Example
///
/// ```ignore
/// let descriptors = layer.initialize_descriptors(&init_ctx)?;
/// layer.forward_prop(forward_ctx)?;
/// layer.backward_prop(backward_ctx)?;
/// ```
pub trait Layer {
    fn name(&self) -> &str;

    fn layer_type(&self) -> LayerType;

    /// Batch-independent output shape.
    fn shape(&self) -> Shape;

    /// Connectivity multiplier on the input side, used by weight initialization.
    fn fan_in(&self) -> usize;

    /// Connectivity multiplier on the output side, used by weight initialization.
    fn fan_out(&self) -> usize;

    /// Number of trainable values (weights and biases).
    fn parameter_count(&self) -> usize {
        0
    }

    /// Human-readable multi-line summary.
    fn description(&self) -> String;

    /// Decides this layer's layouts and builds its backend primitives.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when upstream layouts or shapes cannot be
    /// reconciled with this layer.
    fn initialize_descriptors(&mut self, ctx: &InitContext<'_>) -> Result<Descriptors>;

    /// Reads the upstream activations and writes this layer's activations.
    fn forward_prop(&mut self, ctx: ForwardContext<'_>) -> Result<()>;

    /// Propagates this layer's gradient into the upstream gradient buffers and
    /// its parameter gradients.
    ///
    /// Only valid after a training forward pass.
    fn backward_prop(&mut self, ctx: BackwardContext<'_>) -> Result<()>;

    /// Whether the layer can rewrite its input gradient in place.
    fn supports_in_place_backward(&self) -> bool {
        false
    }

    /// Re-draws trainable parameters from `seed`.
    fn reset_weights(&mut self, _seed: u64) {}

    fn persist(&self) -> Option<&dyn Persist> {
        None
    }

    fn persist_mut(&mut self) -> Option<&mut dyn Persist> {
        None
    }
}

/// First lines of every description: name, type and shape.
pub(crate) fn description_header(layer: &dyn Layer) -> String {
    format!(
        " Name:\t\t{}\n Type:\t\t{}\n Shape:\t\t{}",
        layer.name(),
        layer.layer_type(),
        layer.shape()
    )
}
