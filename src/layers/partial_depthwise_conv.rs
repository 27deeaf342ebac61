//! Depthwise convolution over one channel group of a shared input
//!
//! The input's channels are split into `groups` equal slices and the layer
//! convolves slice `group` (1-based). The slice is addressed as a channel
//! window of the upstream buffers, never copied, so several partial layers
//! can read and write disjoint parts of the same tensor.

use super::depthwise_conv::{ConvolutionCore, DepthwiseOptions};
use super::{description_header, BackwardContext, ForwardContext, InitContext, Layer, LayerType};
use crate::backend::ConvGeometry;
use crate::error::{LayerError, Result};
use crate::tensor::{Descriptors, Shape};
use crate::utils::persist::Persist;
use crate::utils::SimpleRng;
use std::io::{Read, Write};

#[derive(Debug, Clone)]
pub struct PartialDepthwiseConvolution {
    name: String,
    input_shape: Shape,
    groups: usize,
    group: usize,
    multiplier: usize,
    core: ConvolutionCore,
}

impl PartialDepthwiseConvolution {
    /// Creates the layer for slice `group` of `groups`.
    ///
    /// # Errors
    ///
    /// [`LayerError::NotSplittable`] when the channel count (or its padded
    /// count) does not divide evenly into `groups`; uneven slices are not
    /// supported.
    pub fn new(
        name: &str,
        input_shape: Shape,
        groups: usize,
        group: usize,
        options: DepthwiseOptions,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        if groups == 0 || group == 0 || group > groups {
            return Err(LayerError::invalid(
                name,
                format!("group {} outside 1..={}", group, groups),
            ));
        }
        if input_shape.c % groups != 0 || input_shape.padded_c() % groups != 0 {
            return Err(LayerError::NotSplittable {
                layer: name.to_string(),
                channels: input_shape.c,
                groups,
            });
        }
        let channels = input_shape.c / groups;
        let core = ConvolutionCore::new(name, input_shape.with_channels(channels), channels, &options)?;
        let mut layer = Self {
            name: name.to_string(),
            input_shape,
            groups,
            group,
            multiplier: options.multiplier,
            core,
        };
        let (fan_in, fan_out) = (layer.fan_in(), layer.fan_out());
        layer.core.reset(rng, fan_in, fan_out);
        Ok(layer)
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn group(&self) -> usize {
        self.group
    }

    /// Input channels per slice.
    pub fn slice_channels(&self) -> usize {
        self.input_shape.c / self.groups
    }

    /// First input channel of the slice this layer reads.
    pub fn channel_offset(&self) -> usize {
        (self.group - 1) * self.slice_channels()
    }

    pub fn geometry(&self) -> ConvGeometry {
        self.core.geometry()
    }

    pub fn weights(&self) -> &[f32] {
        &self.core.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        self.core.weights_mut()
    }

    pub fn biases(&self) -> &[f32] {
        &self.core.biases
    }

    pub fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.core.biases
    }

    pub fn weights_d1(&self) -> &[f32] {
        &self.core.weights_d1
    }

    pub fn biases_d1(&self) -> &[f32] {
        &self.core.biases_d1
    }
}

impl Layer for PartialDepthwiseConvolution {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::PartialDepthwiseConvolution
    }

    fn shape(&self) -> Shape {
        self.core.dst_shape()
    }

    fn fan_in(&self) -> usize {
        let g = self.core.geometry();
        self.groups * g.kernel_h * g.kernel_w
    }

    fn fan_out(&self) -> usize {
        let g = self.core.geometry();
        self.multiplier * g.kernel_h * g.kernel_w / (g.stride_h * g.stride_w)
    }

    fn parameter_count(&self) -> usize {
        self.core.parameter_count()
    }

    fn description(&self) -> String {
        let g = self.core.geometry();
        format!(
            "{}\n Groups:\t{}\n Group:\t\t{}\n Multiplier:\t{}\n Kernel:\t{}x{}\n Dilates:\t{}x{}\n Stride:\t{}x{}\n Padding:\t{}x{}\n Connections:\t{}",
            description_header(self),
            self.groups,
            self.group,
            self.multiplier,
            g.kernel_h,
            g.kernel_w,
            g.dilation_h,
            g.dilation_w,
            g.stride_h,
            g.stride_w,
            g.pad_h,
            g.pad_w,
            self.slice_channels() * self.multiplier * g.kernel_h * g.kernel_w
        )
    }

    fn initialize_descriptors(&mut self, ctx: &InitContext<'_>) -> Result<Descriptors> {
        super::expect_inputs(&self.name, 1, ctx.inputs.len())?;
        let upstream = ctx.inputs[0];
        if upstream.dst.shape != self.input_shape {
            return Err(LayerError::shape(
                &self.name,
                format!("input is {}, layer expects {}", upstream.dst.shape, self.input_shape),
            ));
        }
        let (offset, channels) = (self.channel_offset(), self.slice_channels());
        let src = upstream.dst.submemory(offset, channels)?;
        let diff_src = upstream.diff_dst.submemory(offset, channels)?;
        log::trace!(
            "{}: reading channels {}..{} of {}",
            self.name,
            offset,
            offset + channels,
            self.input_shape.c
        );
        self.core.initialize(&self.name, ctx, src, diff_src)
    }

    fn forward_prop(&mut self, ctx: ForwardContext<'_>) -> Result<()> {
        self.core.forward(&self.name, ctx)
    }

    fn backward_prop(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        self.core.backward(&self.name, ctx)
    }

    fn reset_weights(&mut self, seed: u64) {
        let (fan_in, fan_out) = (self.fan_in(), self.fan_out());
        self.core.reset(&mut SimpleRng::new(seed), fan_in, fan_out);
    }

    fn persist(&self) -> Option<&dyn Persist> {
        Some(self)
    }

    fn persist_mut(&mut self) -> Option<&mut dyn Persist> {
        Some(self)
    }
}

impl Persist for PartialDepthwiseConvolution {
    fn weights_size(&self) -> usize {
        self.core.weights_size()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.core.save(writer)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.core.load(reader)
    }
}
