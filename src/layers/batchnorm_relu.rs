//! Batch normalization with a fused ReLU, executed by the backend primitive
//!
//! Unlike [`super::BatchNormActivation`], the statistics and the normalization
//! run inside the backend's batch-normalization primitive. The layer packs its
//! scale and shift into one `[scale; shift]` buffer of `2 * PaddedC` values,
//! keeps the ReLU mask workspace between the passes and maintains the running
//! estimates itself. The primitive reports the biased variance, so the running
//! variance is fed `variance * count / (count - 1)`.

use super::{
    description_header, propagate_gradient, reordered, BackwardContext, ForwardContext, InitContext, Layer,
    LayerType, PrimitiveCache,
};
use crate::backend::{Backend, BatchNormDesc, BatchNormPrimitive, BatchStatistics, NormalizationFlags};
use crate::error::{LayerError, Result};
use crate::layers::batchnorm_activation::NormalizationOptions;
use crate::tensor::{inherit_format, DataFormat, Descriptors, FormatPreference, MemoryDesc, Shape};
use crate::utils::persist::{read_f32s, write_f32s, Persist, FLOAT_SIZE};
use crate::utils::statistics::ema;
use std::io::{Read, Write};

#[derive(Debug, Clone)]
pub struct BatchNormRelu {
    name: String,
    shape: Shape,
    options: NormalizationOptions,
    one_minus_momentum: f32,

    weights: Vec<f32>,
    biases: Vec<f32>,
    weights_d1: Vec<f32>,
    biases_d1: Vec<f32>,
    scale_shift: Vec<f32>,

    running_mean: Vec<f32>,
    running_variance: Vec<f32>,
    mean: Vec<f32>,
    variance: Vec<f32>,
    workspace: Vec<u8>,

    desc: Option<BatchNormDesc>,
    primitive: PrimitiveCache<BatchNormPrimitive>,
    src: Option<MemoryDesc>,
    diff_src: Option<MemoryDesc>,
}

impl BatchNormRelu {
    /// Creates the layer. `alpha` and `beta` of the options are ignored.
    pub fn new(name: &str, input_shape: Shape, options: NormalizationOptions) -> Result<Self> {
        options.validate(name)?;
        if input_shape.is_empty() {
            return Err(LayerError::invalid(name, "input shape is empty"));
        }
        let padded = input_shape.padded_c();
        let mut scale_shift = vec![1.0; 2 * padded];
        scale_shift[padded..].iter_mut().for_each(|v| *v = 0.0);
        Ok(Self {
            name: name.to_string(),
            shape: input_shape,
            options,
            one_minus_momentum: 1.0 - options.momentum,
            weights: vec![1.0; padded],
            biases: vec![0.0; padded],
            weights_d1: vec![0.0; padded],
            biases_d1: vec![0.0; padded],
            scale_shift,
            running_mean: vec![0.0; padded],
            running_variance: vec![1.0; padded],
            mean: vec![0.0; padded],
            variance: vec![1.0; padded],
            workspace: Vec::new(),
            desc: None,
            primitive: PrimitiveCache::default(),
            src: None,
            diff_src: None,
        })
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn running_variance(&self) -> &[f32] {
        &self.running_variance
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn variance(&self) -> &[f32] {
        &self.variance
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases
    }

    pub fn weights_d1(&self) -> &[f32] {
        &self.weights_d1
    }

    pub fn biases_d1(&self) -> &[f32] {
        &self.biases_d1
    }

    fn pack_scale_shift(&mut self) {
        let padded = self.shape.padded_c();
        for c in 0..self.shape.c {
            self.scale_shift[c] = self.weights[c];
            self.scale_shift[padded + c] = if self.options.has_bias { self.biases[c] } else { 0.0 };
        }
    }

    fn current_primitive(&self, backend: &dyn Backend) -> Result<BatchNormPrimitive> {
        let desc = self.desc.ok_or_else(super::not_initialized)?;
        self.primitive.get_or_build(|| backend.batch_normalization(&desc))
    }
}

impl Layer for BatchNormRelu {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::BatchNormRelu
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

    fn parameter_count(&self) -> usize {
        match (self.options.scaling, self.options.has_bias) {
            (false, _) => 0,
            (true, false) => self.shape.c,
            (true, true) => 2 * self.shape.c,
        }
    }

    fn description(&self) -> String {
        let c = self.shape.c as f32;
        let mean = self.running_mean[..self.shape.c].iter().sum::<f32>() / c;
        let variance = self.running_variance[..self.shape.c].iter().sum::<f32>() / c;
        format!(
            "{}\n Scaling:\t{}\n Momentum:\t{}\n Eps:\t\t{:e}\n Mean:\t\t{:.6}\n Variance:\t{:.6}",
            description_header(self),
            if self.options.scaling { "Yes" } else { "No" },
            self.options.momentum,
            self.options.eps,
            mean,
            variance
        )
    }

    fn initialize_descriptors(&mut self, ctx: &InitContext<'_>) -> Result<Descriptors> {
        super::expect_inputs(&self.name, 1, ctx.inputs.len())?;
        let upstream = ctx.inputs[0];
        if upstream.dst.shape != self.shape {
            return Err(LayerError::shape(
                &self.name,
                format!("input is {}, layer expects {}", upstream.dst.shape, self.shape),
            ));
        }
        let count = ctx.batch_size * self.shape.dhw();
        if ctx.training && count < 2 {
            return Err(LayerError::InsufficientStatistics {
                layer: self.name.clone(),
                count,
            });
        }

        let format = inherit_format(&self.name, self.options.format, &upstream)?;
        let desc = BatchNormDesc {
            src: upstream.dst,
            eps: self.options.eps,
            flags: NormalizationFlags {
                global_stats: !ctx.training,
                scale_shift: self.options.scaling,
                fuse_relu: true,
            },
            format: match format {
                DataFormat::Plain => FormatPreference::Plain,
                DataFormat::Blocked => FormatPreference::Blocked,
            },
        };
        let primitive = ctx.backend.batch_normalization(&desc)?;

        log::debug!(
            "{}: {} in {}, reorder src: {}, reorder diff src: {}",
            self.name,
            if ctx.training { "training" } else { "inference" },
            primitive.dst.format,
            primitive.src != upstream.dst,
            primitive.diff_src != upstream.diff_dst
        );

        self.workspace = if ctx.training {
            vec![0u8; primitive.workspace_len]
        } else {
            Vec::new()
        };
        self.desc = Some(desc);
        self.src = Some(upstream.dst);
        self.diff_src = Some(upstream.diff_dst);
        self.primitive.store(primitive, ctx.config.cache_primitives);
        Ok(Descriptors {
            dst: primitive.dst,
            diff_dst: primitive.diff_dst,
        })
    }

    fn forward_prop(&mut self, ctx: ForwardContext<'_>) -> Result<()> {
        let prim = self.current_primitive(ctx.backend)?;
        let src_desc = self.src.ok_or_else(super::not_initialized)?;
        let src = reordered(ctx.backend, ctx.inputs[0], &src_desc, &prim.src)?;
        if self.options.scaling {
            self.pack_scale_shift();
        }
        let scale_shift = if self.options.scaling {
            Some(self.scale_shift.as_slice())
        } else {
            None
        };
        let channels = self.shape.c;

        if ctx.training {
            ctx.backend.batch_normalization_forward(
                &prim,
                &src,
                BatchStatistics::Compute {
                    mean: &mut self.mean[..channels],
                    variance: &mut self.variance[..channels],
                },
                scale_shift,
                ctx.neurons,
                Some(self.workspace.as_mut_slice()),
            )?;
            ctx.backend.wait()?;

            let count = (ctx.batch_size * self.shape.dhw()) as f32;
            let unbiased_factor = count / (count - 1.0);
            for c in 0..channels {
                self.running_mean[c] = ema(self.running_mean[c], self.mean[c], self.options.momentum, self.one_minus_momentum);
                self.running_variance[c] = ema(
                    self.running_variance[c],
                    self.variance[c] * unbiased_factor,
                    self.options.momentum,
                    self.one_minus_momentum,
                );
            }
        } else {
            ctx.backend.batch_normalization_forward(
                &prim,
                &src,
                BatchStatistics::Global {
                    mean: &self.running_mean[..channels],
                    variance: &self.running_variance[..channels],
                },
                scale_shift,
                ctx.neurons,
                None,
            )?;
            ctx.backend.wait()?;
        }
        Ok(())
    }

    fn backward_prop(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        super::expect_inputs(&self.name, 1, ctx.inputs.len())?;
        let prim = self.current_primitive(ctx.backend)?;
        let (src_desc, diff_src_desc) = match (self.src, self.diff_src) {
            (Some(src), Some(diff)) => (src, diff),
            _ => return Err(super::not_initialized()),
        };
        let backend = ctx.backend;
        let gradient = ctx.neurons_d1;
        let mut inputs = ctx.inputs;
        let input = &mut inputs[0];
        let src = reordered(backend, input.neurons, &src_desc, &prim.src)?;

        let padded = self.shape.padded_c();
        let mut diff_scale_shift = vec![0.0f32; 2 * padded];
        let scaling = self.options.scaling;
        let scale_shift = if scaling { Some(self.scale_shift.as_slice()) } else { None };
        let (mean, variance, workspace) = (&self.mean, &self.variance, &self.workspace);

        propagate_gradient(backend, input, &diff_src_desc, &prim.diff_src, |diff_src| {
            backend.batch_normalization_backward(
                &prim,
                &src,
                gradient,
                mean,
                variance,
                scale_shift,
                workspace,
                diff_src,
                if scaling { Some(diff_scale_shift.as_mut_slice()) } else { None },
            )
        })?;

        if scaling {
            for c in 0..self.shape.c {
                self.weights_d1[c] += diff_scale_shift[c];
                if self.options.has_bias {
                    self.biases_d1[c] += diff_scale_shift[padded + c];
                }
            }
        }
        Ok(())
    }

    fn reset_weights(&mut self, _seed: u64) {
        self.weights.iter_mut().for_each(|v| *v = 1.0);
        self.biases.iter_mut().for_each(|v| *v = 0.0);
        self.running_mean.iter_mut().for_each(|v| *v = 0.0);
        self.running_variance.iter_mut().for_each(|v| *v = 1.0);
        self.weights_d1.iter_mut().for_each(|v| *v = 0.0);
        self.biases_d1.iter_mut().for_each(|v| *v = 0.0);
        self.pack_scale_shift();
    }

    fn persist(&self) -> Option<&dyn Persist> {
        Some(self)
    }

    fn persist_mut(&mut self) -> Option<&mut dyn Persist> {
        Some(self)
    }
}

/// Running mean, running variance, scale, then shift when `has_bias` is set.
///
/// The scale vector is stored even with `scaling` off, where it stays at its
/// initial ones, so a stream's layout depends only on `C` and `has_bias`.
/// [`Layer::parameter_count`] counts trainable values and reports 0 there.
impl Persist for BatchNormRelu {
    fn weights_size(&self) -> usize {
        let c = self.shape.c;
        let generic = if self.options.has_bias { 2 * c } else { c };
        (2 * c + generic) * FLOAT_SIZE
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let c = self.shape.c;
        write_f32s(writer, &self.running_mean[..c])?;
        write_f32s(writer, &self.running_variance[..c])?;
        write_f32s(writer, &self.weights[..c])?;
        if self.options.has_bias {
            write_f32s(writer, &self.biases[..c])?;
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<()> {
        let c = self.shape.c;
        read_f32s(reader, &mut self.running_mean[..c])?;
        read_f32s(reader, &mut self.running_variance[..c])?;
        read_f32s(reader, &mut self.weights[..c])?;
        if self.options.has_bias {
            read_f32s(reader, &mut self.biases[..c])?;
        }
        self.pack_scale_shift();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_shift_packing() {
        let mut layer = BatchNormRelu::new("bnr", Shape::vector(3), NormalizationOptions::default()).unwrap();
        layer.weights_mut()[1] = 2.0;
        layer.biases_mut()[2] = -1.0;
        layer.pack_scale_shift();
        assert_eq!(&layer.scale_shift[..3], &[1.0, 2.0, 1.0]);
        assert_eq!(&layer.scale_shift[8..11], &[0.0, 0.0, -1.0]);
    }

    #[test]
    fn test_round_trip_restores_statistics() {
        let mut layer = BatchNormRelu::new("bnr", Shape::vector(2), NormalizationOptions::default()).unwrap();
        layer.running_mean[0] = 0.5;
        layer.running_variance[1] = 2.0;
        layer.weights[1] = 3.0;
        let mut bytes = Vec::new();
        layer.save(&mut bytes).unwrap();
        assert_eq!(bytes.len(), layer.weights_size());

        let mut restored = BatchNormRelu::new("bnr", Shape::vector(2), NormalizationOptions::default()).unwrap();
        restored.load(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored.running_mean()[0], 0.5);
        assert_eq!(restored.running_variance()[1], 2.0);
        assert_eq!(restored.scale_shift[1], 3.0);
    }
}
