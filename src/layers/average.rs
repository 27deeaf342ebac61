//! Element-wise mean of several same-shaped inputs
//!
//! Forward is a scaled sum with every scale equal to `1 / N`. Backward hands
//! each input the same scaled gradient, always by accumulation, so the input
//! gradients add back up to the output gradient.

use super::{description_header, BackwardContext, ForwardContext, InitContext, Layer, LayerType};
use crate::error::{LayerError, Result};
use crate::parallel::INFERENCE_WEIGHT;
use crate::tensor::{inherit_format, Descriptors, FormatPreference, MemoryDesc, Shape};

#[derive(Debug, Clone)]
pub struct Average {
    name: String,
    shape: Shape,
    format: FormatPreference,
    scale: f32,
    scales: Vec<f32>,
    desc: Option<MemoryDesc>,
}

impl Average {
    /// Creates an average over `input_shapes.len()` inputs.
    ///
    /// # Errors
    ///
    /// Fails with fewer than two inputs or when the inputs disagree on
    /// `(C, D, H, W)`.
    pub fn new(name: &str, input_shapes: &[Shape], format: FormatPreference) -> Result<Self> {
        if input_shapes.len() < 2 {
            return Err(LayerError::invalid(name, "average needs at least two inputs"));
        }
        let shape = input_shapes[0];
        if let Some(other) = input_shapes.iter().find(|s| **s != shape) {
            return Err(LayerError::shape(
                name,
                format!("inputs {} and {} differ", shape, other),
            ));
        }
        let scale = 1.0 / input_shapes.len() as f32;
        Ok(Self {
            name: name.to_string(),
            shape,
            format,
            scale,
            scales: vec![scale; input_shapes.len()],
            desc: None,
        })
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

impl Layer for Average {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Average
    }

    fn shape(&self) -> Shape {
        self.shape
    }

    fn fan_in(&self) -> usize {
        1
    }

    fn fan_out(&self) -> usize {
        1
    }

    fn description(&self) -> String {
        format!("{}\n Scale:\t\t{}", description_header(self), self.scale)
    }

    fn initialize_descriptors(&mut self, ctx: &InitContext<'_>) -> Result<Descriptors> {
        super::expect_inputs(&self.name, self.scales.len(), ctx.inputs.len())?;
        let format = inherit_format(&self.name, self.format, &ctx.inputs[0])?;
        let desc = MemoryDesc::new(ctx.batch_size, self.shape, format);

        if ctx
            .inputs
            .iter()
            .any(|input| input.dst != desc || input.diff_dst != desc)
        {
            return Err(LayerError::IncompatibleFormats {
                layer: self.name.clone(),
            });
        }

        log::debug!("{}: averaging {} inputs in {}", self.name, self.scales.len(), format);
        self.desc = Some(desc);
        Ok(Descriptors::symmetric(desc))
    }

    fn forward_prop(&mut self, ctx: ForwardContext<'_>) -> Result<()> {
        let desc = self.desc.ok_or_else(super::not_initialized)?;
        ctx.backend.sum(&desc, &self.scales, &ctx.inputs, ctx.neurons)?;
        ctx.backend.wait()
    }

    fn backward_prop(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        let desc = self.desc.ok_or_else(super::not_initialized)?;
        let len = desc.required_len();
        let stride = desc.sample_stride();
        let scale = self.scale;
        let gradient = &ctx.neurons_d1[..len];
        let threads = ctx.dispatcher.threads_for(len * ctx.inputs.len(), INFERENCE_WEIGHT);

        for input in ctx.inputs {
            desc.check_buffer(input.neurons_d1.len())?;
            ctx.dispatcher
                .for_each_chunk(&mut input.neurons_d1[..len], stride, threads, |n, chunk| {
                    let own = &gradient[n * stride..n * stride + chunk.len()];
                    for (dst, &g) in chunk.iter_mut().zip(own) {
                        *dst += scale * g;
                    }
                });
        }
        Ok(())
    }
}
