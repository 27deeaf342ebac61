//! Layer variants of the execution engine
//!
//! This module provides the [`Layer`] trait, the concrete variants and the
//! closed [`LayerVariant`] set the graph executor stores in its arena. It also
//! holds the small pieces every primitive-backed layer shares: primitive
//! caching, reorders at primitive boundaries and the write-or-merge policy for
//! input gradients.

mod r#trait;
pub mod average;
pub mod batchnorm_activation;
pub mod batchnorm_relu;
pub mod depthwise_conv;
pub mod input;
pub mod partial_depthwise_conv;
pub mod resampling;
pub mod variant;

pub use average::Average;
pub use batchnorm_activation::BatchNormActivation;
pub use batchnorm_relu::BatchNormRelu;
pub use depthwise_conv::DepthwiseConvolution;
pub use input::InputLayer;
pub use partial_depthwise_conv::PartialDepthwiseConvolution;
pub use r#trait::{
    BackwardContext, ForwardContext, InitContext, InputGradient, Layer, LayerType, Materialization, Mode,
};
pub use resampling::Resampling;
pub use variant::{LayerSpec, LayerVariant};

pub(crate) use r#trait::description_header;

use crate::backend::Backend;
use crate::error::{LayerError, Result};
use crate::tensor::MemoryDesc;
use std::borrow::Cow;

/// Backend primitive kept between calls when primitive caching is enabled.
#[derive(Debug, Clone)]
pub(crate) struct PrimitiveCache<P> {
    cached: Option<P>,
}

impl<P> Default for PrimitiveCache<P> {
    fn default() -> Self {
        Self { cached: None }
    }
}

impl<P: Copy> PrimitiveCache<P> {
    /// Stores `primitive` when caching is on and drops any stale one otherwise.
    pub(crate) fn store(&mut self, primitive: P, cache: bool) {
        self.cached = if cache { Some(primitive) } else { None };
    }

    pub(crate) fn clear(&mut self) {
        self.cached = None;
    }

    /// The cached primitive, or a freshly built one.
    pub(crate) fn get_or_build(&self, build: impl FnOnce() -> Result<P>) -> Result<P> {
        match self.cached {
            Some(primitive) => Ok(primitive),
            None => build(),
        }
    }
}

/// Error for a layer used before its descriptors were initialized.
pub(crate) fn not_initialized() -> LayerError {
    LayerError::NotInitialized
}

/// Returns `src` in the layout `to`, converting only when `from` differs.
pub(crate) fn reordered<'a>(
    backend: &dyn Backend,
    src: &'a [f32],
    from: &MemoryDesc,
    to: &MemoryDesc,
) -> Result<Cow<'a, [f32]>> {
    if from == to {
        return Ok(Cow::Borrowed(src));
    }
    let mut converted = vec![0.0; to.required_len()];
    backend.reorder(src, from, &mut converted, to)?;
    backend.wait()?;
    Ok(Cow::Owned(converted))
}

/// Runs `compute` to produce an input gradient laid out as `produced` and
/// lands it in the upstream gradient region `target`.
///
/// A sole consumer whose primitive already writes the upstream layout writes
/// straight into the upstream buffer. A shared upstream tensor receives the
/// gradient through an additive merge, and a layout change goes through a
/// reorder.
pub(crate) fn propagate_gradient<F>(
    backend: &dyn Backend,
    input: &mut InputGradient<'_>,
    target: &MemoryDesc,
    produced: &MemoryDesc,
    compute: F,
) -> Result<()>
where
    F: FnOnce(&mut [f32]) -> Result<()>,
{
    if !input.shared && produced == target {
        compute(input.neurons_d1)?;
        return backend.wait();
    }

    let mut scratch = vec![0.0; produced.required_len()];
    compute(&mut scratch)?;
    backend.wait()?;
    if input.shared {
        backend.binary_add(input.neurons_d1, target, &scratch, produced)?;
    } else {
        backend.reorder(&scratch, produced, input.neurons_d1, target)?;
    }
    backend.wait()
}

/// Checks that a layer received exactly `expected` inputs.
pub(crate) fn expect_inputs(layer: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(LayerError::invalid(
            layer,
            format!("expects {} input(s), got {}", expected, actual),
        ));
    }
    Ok(())
}
