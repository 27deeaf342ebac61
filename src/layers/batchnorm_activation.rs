//! Batch normalization fused with a pluggable activation
//!
//! This layer normalizes each channel over the `batch x D x H x W` extent,
//! applies an optional learned scale and shift and then an activation from the
//! closed [`Activation`] family. The arithmetic runs on the engine's own
//! parallel loops rather than on the backend.
//!
//! # Training forward
//!
//! 1. Per channel, accumulate the batch mean and variance with compensated
//!    summation, in single-pass or two-pass form.
//! 2. Update the running estimates: `running = momentum * running +
//!    (1 - momentum) * batch`, feeding the unbiased variance into the running
//!    variance.
//! 3. `y = f((x - mean) * inv_std * scale + shift)`, with
//!    `inv_std = 1 / sqrt(variance + eps)`.
//!
//! Inference skips the first two steps and normalizes with the running
//! estimates.
//!
//! # Backward
//!
//! With `dy' = dy * f'(pre-activation)` and `x_c = x - mean`:
//!
//! ```text
//! d_scale = inv_std * Σ dy' * x_c
//! d_shift = Σ dy'
//! dx      = scale * inv_std * (dy' - x_c * inv_std * d_scale / count - d_shift / count)
//! ```
//!
//! `dx` is added into a shared upstream gradient and written otherwise.

use super::{description_header, BackwardContext, ForwardContext, InitContext, Layer, LayerType};
use crate::error::{LayerError, Result};
use crate::parallel::{INFERENCE_WEIGHT, TRAINING_WEIGHT};
use crate::tensor::{inherit_format, Descriptors, FormatPreference, MemoryDesc, Shape};
use crate::utils::activations::{Activation, ActivationFn};
use crate::utils::kahan::KahanSum;
use crate::utils::persist::{read_f32s, write_f32s, Persist, FLOAT_SIZE};
use crate::utils::statistics::{channel_statistics, ema, StatisticsMode};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Constructor parameters of a fused normalization layer.
///
/// `alpha` and `beta` of 0 select the activation's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationOptions {
    pub alpha: f32,
    pub beta: f32,
    pub momentum: f32,
    pub eps: f32,
    /// Learned per-channel scale (and shift when `has_bias`).
    pub scaling: bool,
    pub has_bias: bool,
    pub format: FormatPreference,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            beta: 0.0,
            momentum: 0.99,
            eps: 1e-4,
            scaling: true,
            has_bias: true,
            format: FormatPreference::Any,
        }
    }
}

impl NormalizationOptions {
    pub(crate) fn validate(&self, layer: &str) -> Result<()> {
        if !(self.momentum > 0.0 && self.momentum < 1.0) {
            return Err(LayerError::invalid(
                layer,
                format!("momentum {} must lie in (0, 1)", self.momentum),
            ));
        }
        if !(self.eps > 0.0) {
            return Err(LayerError::invalid(layer, format!("eps {} must be positive", self.eps)));
        }
        Ok(())
    }
}

/// How the input gradient is landed in the upstream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GradientWrite {
    Overwrite,
    Accumulate,
    /// The output gradient already sits in the upstream buffer.
    InPlace,
}

/// Batch normalization followed by an activation.
///
/// All per-channel vectors have length `PaddedC`; lanes past `C` keep their
/// initial values and never influence logical channels.
///
/// # Example
///
/// ```
/// use rust_layer_engine::layers::batchnorm_activation::{BatchNormActivation, NormalizationOptions};
/// use rust_layer_engine::tensor::Shape;
/// use rust_layer_engine::utils::Activation;
///
/// let layer = BatchNormActivation::new(
///     "bn1",
///     Shape::image(3, 4, 4),
///     Activation::Relu,
///     NormalizationOptions::default(),
/// )
/// .unwrap();
/// assert_eq!(layer.running_mean().len(), 8);
/// assert_eq!(layer.running_variance()[0], 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct BatchNormActivation {
    name: String,
    shape: Shape,
    activation: ActivationFn,
    options: NormalizationOptions,
    one_minus_momentum: f32,

    weights: Vec<f32>,
    biases: Vec<f32>,
    weights_d1: Vec<f32>,
    biases_d1: Vec<f32>,

    // Persist across batches
    running_mean: Vec<f32>,
    running_variance: Vec<f32>,

    // Valid from a training forward pass until the next one
    mean: Vec<f32>,
    variance: Vec<f32>,
    inv_std: Vec<f32>,

    dst: Option<MemoryDesc>,
    src: Option<MemoryDesc>,
    diff_src: Option<MemoryDesc>,
    statistics_mode: StatisticsMode,
}

impl BatchNormActivation {
    /// Creates the layer for an input of `input_shape`.
    ///
    /// # Errors
    ///
    /// Rejects momentum outside `(0, 1)`, a non-positive epsilon and an empty shape.
    pub fn new(
        name: &str,
        input_shape: Shape,
        activation: Activation,
        options: NormalizationOptions,
    ) -> Result<Self> {
        options.validate(name)?;
        if input_shape.is_empty() {
            return Err(LayerError::invalid(name, "input shape is empty"));
        }
        let padded = input_shape.padded_c();
        Ok(Self {
            name: name.to_string(),
            shape: input_shape,
            activation: activation.resolve(options.alpha, options.beta),
            options,
            one_minus_momentum: 1.0 - options.momentum,
            weights: vec![1.0; padded],
            biases: vec![0.0; padded],
            weights_d1: vec![0.0; padded],
            biases_d1: vec![0.0; padded],
            running_mean: vec![0.0; padded],
            running_variance: vec![1.0; padded],
            mean: vec![0.0; padded],
            variance: vec![1.0; padded],
            inv_std: vec![0.0; padded],
            dst: None,
            src: None,
            diff_src: None,
            statistics_mode: StatisticsMode::default(),
        })
    }

    pub fn activation(&self) -> &ActivationFn {
        &self.activation
    }

    pub fn options(&self) -> &NormalizationOptions {
        &self.options
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn running_variance(&self) -> &[f32] {
        &self.running_variance
    }

    /// Batch mean of the last training forward pass.
    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    /// Biased batch variance of the last training forward pass.
    pub fn variance(&self) -> &[f32] {
        &self.variance
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
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

    /// Clears accumulated parameter gradients.
    pub fn zero_parameter_gradients(&mut self) {
        self.weights_d1.iter_mut().for_each(|v| *v = 0.0);
        self.biases_d1.iter_mut().for_each(|v| *v = 0.0);
    }

    #[inline]
    fn scale_shift(&self, c: usize) -> (f32, f32) {
        let scale = if self.options.scaling { self.weights[c] } else { 1.0 };
        let shift = if self.options.scaling && self.options.has_bias {
            self.biases[c]
        } else {
            0.0
        };
        (scale, shift)
    }

    fn descriptors(&self) -> Result<(MemoryDesc, MemoryDesc, MemoryDesc)> {
        match (self.dst, self.src, self.diff_src) {
            (Some(dst), Some(src), Some(diff_src)) => Ok((dst, src, diff_src)),
            _ => Err(super::not_initialized()),
        }
    }

    /// Computes batch statistics, updates the running estimates and fills
    /// `mean`, `variance` and `inv_std`.
    fn update_statistics(&mut self, ctx: &ForwardContext<'_>, src: &MemoryDesc, threads: usize) {
        let input = ctx.inputs[0];
        let mode = self.statistics_mode;
        let stats = ctx
            .dispatcher
            .map(self.shape.c, threads, |c| channel_statistics(input, src, c, mode));

        for (c, s) in stats.iter().enumerate() {
            self.mean[c] = s.mean;
            self.variance[c] = s.variance;
            self.inv_std[c] = 1.0 / (s.variance + self.options.eps).sqrt();
            self.running_mean[c] = ema(self.running_mean[c], s.mean, self.options.momentum, self.one_minus_momentum);
            self.running_variance[c] = ema(
                self.running_variance[c],
                s.unbiased_variance,
                self.options.momentum,
                self.one_minus_momentum,
            );
        }
    }
}

impl Layer for BatchNormActivation {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::BatchNormActivation
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
            "{}\n Activation:\t{}\n Alpha:\t\t{}\n Beta:\t\t{}\n Scaling:\t{}\n Momentum:\t{}\n Eps:\t\t{:e}\n Mean:\t\t{:.6}\n Variance:\t{:.6}",
            description_header(self),
            self.activation.kind().name(),
            self.activation.alpha(),
            self.activation.beta(),
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
        let dst = MemoryDesc::new(ctx.batch_size, self.shape, format);
        self.dst = Some(dst);
        self.src = Some(upstream.dst);
        self.diff_src = Some(upstream.diff_dst);
        self.statistics_mode = ctx.config.statistics_mode;

        log::debug!(
            "{}: {} in {} ({:?} statistics), input in {}",
            self.name,
            if ctx.training { "training" } else { "inference" },
            format,
            self.statistics_mode,
            upstream.dst.format
        );
        Ok(Descriptors::symmetric(dst))
    }

    fn forward_prop(&mut self, ctx: ForwardContext<'_>) -> Result<()> {
        let (dst, src, _) = self.descriptors()?;
        src.check_buffer(ctx.inputs[0].len())?;
        dst.check_buffer(ctx.neurons.len())?;

        let elements = ctx.batch_size * self.shape.cdhw();
        let weight = if ctx.training { TRAINING_WEIGHT } else { INFERENCE_WEIGHT };
        let threads = ctx.dispatcher.threads_for(elements, weight);

        if ctx.training {
            self.update_statistics(&ctx, &src, threads);
        }

        let (mean, inv_std): (Vec<f32>, Vec<f32>) = if ctx.training {
            (self.mean.clone(), self.inv_std.clone())
        } else {
            let inv = self
                .running_variance
                .iter()
                .map(|v| 1.0 / (v + self.options.eps).sqrt())
                .collect();
            (self.running_mean.clone(), inv)
        };
        let affine: Vec<(f32, f32)> = (0..self.shape.c).map(|c| self.scale_shift(c)).collect();

        let input = ctx.inputs[0];
        let activation = self.activation;
        let dhw = self.shape.dhw();
        let channels = self.shape.c;

        ctx.dispatcher
            .for_each_chunk(&mut ctx.neurons[..dst.required_len()], dst.sample_stride(), threads, |n, out| {
                for c in 0..channels {
                    let (scale, shift) = affine[c];
                    let weighted_inv_std = scale * inv_std[c];
                    let (src_start, src_step) = src.channel_run(c);
                    let (dst_start, dst_step) = dst.channel_run(c);
                    let base = n * src.sample_stride() + src_start;
                    for s in 0..dhw {
                        let x = input[base + s * src_step];
                        out[dst_start + s * dst_step] = activation.forward((x - mean[c]) * weighted_inv_std + shift);
                    }
                }
            });
        Ok(())
    }

    fn backward_prop(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        let (dst, src, diff_src) = self.descriptors()?;
        super::expect_inputs(&self.name, 1, ctx.inputs.len())?;

        let dispatcher = ctx.dispatcher;
        let mut inputs = ctx.inputs;
        let input = &mut inputs[0];
        let write = if ctx.in_place {
            GradientWrite::InPlace
        } else if input.shared {
            GradientWrite::Accumulate
        } else {
            GradientWrite::Overwrite
        };
        if write == GradientWrite::InPlace && diff_src != dst {
            return Err(LayerError::IncompatibleFormats {
                layer: self.name.clone(),
            });
        }
        diff_src.check_buffer(input.neurons_d1.len())?;
        src.check_buffer(input.neurons.len())?;

        let channels = self.shape.c;
        let dhw = self.shape.dhw();
        let batch = ctx.batch_size;
        let count = (batch * dhw) as f32;
        let threads = dispatcher.threads_for(batch * self.shape.cdhw(), TRAINING_WEIGHT);
        let activation = self.activation;
        let x = input.neurons;
        let mean = &self.mean;
        let inv_std = &self.inv_std;
        let affine: Vec<(f32, f32)> = (0..channels).map(|c| self.scale_shift(c)).collect();

        // per channel: (Σ dy' * x_c, Σ dy')
        let sums = {
            let (gradient, gradient_desc): (&[f32], MemoryDesc) = if write == GradientWrite::InPlace {
                (&*input.neurons_d1, diff_src)
            } else {
                dst.check_buffer(ctx.neurons_d1.len())?;
                (ctx.neurons_d1, dst)
            };
            dispatcher.map(channels, threads, |c| {
                let (scale, shift) = affine[c];
                let weighted_inv_std = scale * inv_std[c];
                let mut diff_gamma = KahanSum::new();
                let mut diff_beta = KahanSum::new();
                for n in 0..batch {
                    for s in 0..dhw {
                        let centered = x[src.offset(n, c, s)] - mean[c];
                        let dy = gradient[gradient_desc.offset(n, c, s)]
                            * activation.derivative(centered * weighted_inv_std + shift);
                        diff_gamma.add(dy * centered);
                        diff_beta.add(dy);
                    }
                }
                (diff_gamma.value() * inv_std[c], diff_beta.value())
            })
        };

        if self.options.scaling {
            for (c, &(diff_gamma, diff_beta)) in sums.iter().enumerate() {
                self.weights_d1[c] += diff_gamma;
                if self.options.has_bias {
                    self.biases_d1[c] += diff_beta;
                }
            }
        }

        let own_gradient = ctx.neurons_d1;
        let stride = diff_src.sample_stride();
        let mean = &self.mean;
        let inv_std = &self.inv_std;

        dispatcher.for_each_chunk(
            &mut input.neurons_d1[..diff_src.required_len()],
            stride,
            threads,
            |n, chunk| {
                for c in 0..channels {
                    let (scale, shift) = affine[c];
                    let weighted_inv_std = scale * inv_std[c];
                    let (diff_gamma, diff_beta) = sums[c];
                    let gamma_term = diff_gamma * inv_std[c] / count;
                    let beta_term = diff_beta / count;
                    for s in 0..dhw {
                        let idx = diff_src.sample_offset(c, s);
                        let centered = x[src.offset(n, c, s)] - mean[c];
                        let upstream = match write {
                            GradientWrite::InPlace => chunk[idx],
                            _ => own_gradient[dst.offset(n, c, s)],
                        };
                        let dy = upstream * activation.derivative(centered * weighted_inv_std + shift);
                        let dx = weighted_inv_std * (dy - centered * gamma_term - beta_term);
                        match write {
                            GradientWrite::Accumulate => chunk[idx] += dx,
                            GradientWrite::Overwrite | GradientWrite::InPlace => chunk[idx] = dx,
                        }
                    }
                }
            },
        );
        Ok(())
    }

    fn supports_in_place_backward(&self) -> bool {
        true
    }

    fn reset_weights(&mut self, _seed: u64) {
        self.weights.iter_mut().for_each(|v| *v = 1.0);
        self.biases.iter_mut().for_each(|v| *v = 0.0);
        self.running_mean.iter_mut().for_each(|v| *v = 0.0);
        self.running_variance.iter_mut().for_each(|v| *v = 1.0);
        self.zero_parameter_gradients();
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
impl Persist for BatchNormActivation {
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
        Ok(())
    }
}
