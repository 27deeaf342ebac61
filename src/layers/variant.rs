//! Closed set of layer variants stored by the graph arena, and the
//! serializable layer specifications they are built from

use super::batchnorm_activation::NormalizationOptions;
use super::depthwise_conv::DepthwiseOptions;
use super::{
    Average, BackwardContext, BatchNormActivation, BatchNormRelu, DepthwiseConvolution, ForwardContext,
    InitContext, InputLayer, Layer, LayerType, PartialDepthwiseConvolution, Resampling,
};
use crate::backend::ResamplingAlgorithm;
use crate::error::{LayerError, Result};
use crate::tensor::{Descriptors, FormatPreference, Shape};
use crate::utils::persist::Persist;
use crate::utils::{Activation, SimpleRng};
use serde::{Deserialize, Serialize};

/// One node's layer.
#[derive(Debug, Clone)]
pub enum LayerVariant {
    Input(InputLayer),
    Average(Average),
    BatchNormActivation(BatchNormActivation),
    BatchNormRelu(BatchNormRelu),
    DepthwiseConvolution(DepthwiseConvolution),
    PartialDepthwiseConvolution(PartialDepthwiseConvolution),
    Resampling(Resampling),
}

macro_rules! dispatch {
    ($value:expr, $layer:ident => $body:expr) => {
        match $value {
            LayerVariant::Input($layer) => $body,
            LayerVariant::Average($layer) => $body,
            LayerVariant::BatchNormActivation($layer) => $body,
            LayerVariant::BatchNormRelu($layer) => $body,
            LayerVariant::DepthwiseConvolution($layer) => $body,
            LayerVariant::PartialDepthwiseConvolution($layer) => $body,
            LayerVariant::Resampling($layer) => $body,
        }
    };
}

macro_rules! impl_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for LayerVariant {
                fn from(layer: $variant) -> Self {
                    LayerVariant::$variant(layer)
                }
            }
        )*
    };
}

impl_from!(
    Average,
    BatchNormActivation,
    BatchNormRelu,
    DepthwiseConvolution,
    PartialDepthwiseConvolution,
    Resampling
);

impl From<InputLayer> for LayerVariant {
    fn from(layer: InputLayer) -> Self {
        LayerVariant::Input(layer)
    }
}

impl Layer for LayerVariant {
    fn name(&self) -> &str {
        dispatch!(self, l => l.name())
    }

    fn layer_type(&self) -> LayerType {
        dispatch!(self, l => l.layer_type())
    }

    fn shape(&self) -> Shape {
        dispatch!(self, l => l.shape())
    }

    fn fan_in(&self) -> usize {
        dispatch!(self, l => l.fan_in())
    }

    fn fan_out(&self) -> usize {
        dispatch!(self, l => l.fan_out())
    }

    fn parameter_count(&self) -> usize {
        dispatch!(self, l => l.parameter_count())
    }

    fn description(&self) -> String {
        dispatch!(self, l => l.description())
    }

    fn initialize_descriptors(&mut self, ctx: &InitContext<'_>) -> Result<Descriptors> {
        dispatch!(self, l => l.initialize_descriptors(ctx))
    }

    fn forward_prop(&mut self, ctx: ForwardContext<'_>) -> Result<()> {
        dispatch!(self, l => l.forward_prop(ctx))
    }

    fn backward_prop(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        dispatch!(self, l => l.backward_prop(ctx))
    }

    fn supports_in_place_backward(&self) -> bool {
        dispatch!(self, l => l.supports_in_place_backward())
    }

    fn reset_weights(&mut self, seed: u64) {
        dispatch!(self, l => l.reset_weights(seed))
    }

    fn persist(&self) -> Option<&dyn Persist> {
        dispatch!(self, l => l.persist())
    }

    fn persist_mut(&mut self) -> Option<&mut dyn Persist> {
        dispatch!(self, l => l.persist_mut())
    }
}

/// Serializable description of a non-input layer, tagged by `"type"`.
///
/// ```
/// use rust_layer_engine::layers::LayerSpec;
///
/// let spec: LayerSpec = serde_json::from_str(
///     r#"{ "type": "depthwise_convolution", "kernel_h": 3, "kernel_w": 3, "pad_h": 1, "pad_w": 1 }"#,
/// )
/// .unwrap();
/// assert!(matches!(spec, LayerSpec::DepthwiseConvolution { .. }));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Average {
        #[serde(default)]
        format: FormatPreference,
    },
    BatchNormActivation {
        activation: Activation,
        #[serde(flatten)]
        options: NormalizationOptions,
    },
    BatchNormRelu {
        #[serde(flatten)]
        options: NormalizationOptions,
    },
    DepthwiseConvolution {
        #[serde(flatten)]
        options: DepthwiseOptions,
    },
    PartialDepthwiseConvolution {
        groups: usize,
        group: usize,
        #[serde(flatten)]
        options: DepthwiseOptions,
    },
    Resampling {
        algorithm: ResamplingAlgorithm,
        factor_h: f32,
        factor_w: f32,
        #[serde(default)]
        format: FormatPreference,
    },
}

impl LayerSpec {
    pub fn layer_type(&self) -> LayerType {
        match self {
            LayerSpec::Average { .. } => LayerType::Average,
            LayerSpec::BatchNormActivation { .. } => LayerType::BatchNormActivation,
            LayerSpec::BatchNormRelu { .. } => LayerType::BatchNormRelu,
            LayerSpec::DepthwiseConvolution { .. } => LayerType::DepthwiseConvolution,
            LayerSpec::PartialDepthwiseConvolution { .. } => LayerType::PartialDepthwiseConvolution,
            LayerSpec::Resampling { .. } => LayerType::Resampling,
        }
    }

    /// Builds the layer for inputs of the given shapes.
    pub fn build(&self, name: &str, input_shapes: &[Shape], rng: &mut SimpleRng) -> Result<LayerVariant> {
        let single = || match input_shapes {
            [shape] => Ok(*shape),
            _ => Err(LayerError::invalid(
                name,
                format!("{} expects one input, got {}", self.layer_type(), input_shapes.len()),
            )),
        };

        let layer: LayerVariant = match self {
            LayerSpec::Average { format } => Average::new(name, input_shapes, *format)?.into(),
            LayerSpec::BatchNormActivation {
                activation,
                options,
            } => BatchNormActivation::new(name, single()?, *activation, *options)?.into(),
            LayerSpec::BatchNormRelu { options } => BatchNormRelu::new(name, single()?, *options)?.into(),
            LayerSpec::DepthwiseConvolution { options } => {
                DepthwiseConvolution::new(name, single()?, *options, rng)?.into()
            }
            LayerSpec::PartialDepthwiseConvolution {
                groups,
                group,
                options,
            } => PartialDepthwiseConvolution::new(name, single()?, *groups, *group, *options, rng)?.into(),
            LayerSpec::Resampling {
                algorithm,
                factor_h,
                factor_w,
                format,
            } => Resampling::new(name, single()?, *algorithm, *factor_h, *factor_w, *format)?.into(),
        };
        Ok(layer)
    }
}
