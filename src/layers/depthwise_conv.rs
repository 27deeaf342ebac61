//! Depthwise convolution and the grouped convolution machinery it shares
//! with [`super::PartialDepthwiseConvolution`]
//!
//! Each input channel is convolved with `multiplier` kernels of its own, so
//! `C_out = multiplier * C_in`. Weights are stored canonically as
//! `(C_in, multiplier, 1, kH, kW)`. When the backend asks for another weight
//! order the layer reorders once and keeps the converted copy until the
//! canonical weights change.

use super::{
    description_header, propagate_gradient, reordered, BackwardContext, ForwardContext, InitContext, Layer,
    LayerType, PrimitiveCache,
};
use crate::backend::{Backend, ConvGeometry, ConvolutionDesc, ConvolutionPrimitive};
use crate::error::{LayerError, Result};
use crate::tensor::{Descriptors, FormatPreference, MemoryDesc, Shape, WeightsDesc, WeightsFormat};
use crate::utils::persist::{read_f32s, write_f32s, Persist, FLOAT_SIZE};
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

fn one() -> usize {
    1
}

fn yes() -> bool {
    true
}

/// Construction parameters of a depthwise convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthwiseOptions {
    #[serde(flatten)]
    pub geometry: ConvGeometry,
    #[serde(default = "one")]
    pub multiplier: usize,
    #[serde(default = "yes")]
    pub has_bias: bool,
    #[serde(default)]
    pub format: FormatPreference,
}

impl DepthwiseOptions {
    pub fn new(geometry: ConvGeometry) -> Self {
        Self {
            geometry,
            multiplier: 1,
            has_bias: true,
            format: FormatPreference::Any,
        }
    }

    pub fn with_multiplier(self, multiplier: usize) -> Self {
        Self { multiplier, ..self }
    }

    pub fn without_bias(self) -> Self {
        Self {
            has_bias: false,
            ..self
        }
    }

    pub fn with_format(self, format: FormatPreference) -> Self {
        Self { format, ..self }
    }
}

/// Weights converted to the order a primitive asked for.
#[derive(Debug, Clone)]
struct PackedWeights {
    desc: WeightsDesc,
    values: Vec<f32>,
}

/// Grouped convolution state shared by the depthwise layers: parameters,
/// the packed-weights cache and the primitive bound to an input window.
#[derive(Debug, Clone)]
pub(crate) struct ConvolutionCore {
    geometry: ConvGeometry,
    has_bias: bool,
    format: FormatPreference,
    weights_desc: WeightsDesc,
    dst_shape: Shape,

    pub(crate) weights: Vec<f32>,
    pub(crate) biases: Vec<f32>,
    pub(crate) weights_d1: Vec<f32>,
    pub(crate) biases_d1: Vec<f32>,
    packed: Option<PackedWeights>,

    desc: Option<ConvolutionDesc>,
    primitive: PrimitiveCache<ConvolutionPrimitive>,
    src: Option<MemoryDesc>,
    diff_src: Option<MemoryDesc>,
}

impl ConvolutionCore {
    /// Depthwise convolution over `groups` channels of a `window` shaped input.
    pub(crate) fn new(name: &str, window: Shape, groups: usize, options: &DepthwiseOptions) -> Result<Self> {
        let g = options.geometry;
        if options.multiplier == 0 {
            return Err(LayerError::invalid(name, "channel multiplier must be positive"));
        }
        if window.d != 1 {
            return Err(LayerError::invalid(name, "depthwise convolution is 2-D only"));
        }
        let (out_h, out_w) = g.output_size(window.h, window.w).ok_or_else(|| {
            LayerError::invalid(
                name,
                format!("kernel {}x{} does not fit input {}", g.kernel_h, g.kernel_w, window),
            )
        })?;
        let weights_desc = WeightsDesc {
            groups,
            out_per_group: options.multiplier,
            in_per_group: 1,
            kernel_h: g.kernel_h,
            kernel_w: g.kernel_w,
            format: WeightsFormat::Canonical,
        };
        let dst_shape = Shape::new(groups * options.multiplier, 1, out_h, out_w);
        let bias_len = if options.has_bias { dst_shape.c } else { 0 };

        Ok(Self {
            geometry: g,
            has_bias: options.has_bias,
            format: options.format,
            weights_desc,
            dst_shape,
            weights: vec![0.0; weights_desc.count()],
            biases: vec![0.0; bias_len],
            weights_d1: vec![0.0; weights_desc.count()],
            biases_d1: vec![0.0; bias_len],
            packed: None,
            desc: None,
            primitive: PrimitiveCache::default(),
            src: None,
            diff_src: None,
        })
    }

    pub(crate) fn dst_shape(&self) -> Shape {
        self.dst_shape
    }

    pub(crate) fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    pub(crate) fn has_bias(&self) -> bool {
        self.has_bias
    }

    pub(crate) fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    /// Xavier-uniform weights, zero biases, and a dropped packed copy.
    pub(crate) fn reset(&mut self, rng: &mut SimpleRng, fan_in: usize, fan_out: usize) {
        rng.fill_xavier(&mut self.weights, fan_in, fan_out);
        self.biases.iter_mut().for_each(|v| *v = 0.0);
        self.weights_d1.iter_mut().for_each(|v| *v = 0.0);
        self.biases_d1.iter_mut().for_each(|v| *v = 0.0);
        self.packed = None;
    }

    /// Mutable canonical weights; the packed copy is rebuilt on next use.
    pub(crate) fn weights_mut(&mut self) -> &mut [f32] {
        self.packed = None;
        &mut self.weights
    }

    pub(crate) fn initialize(
        &mut self,
        name: &str,
        ctx: &InitContext<'_>,
        src: MemoryDesc,
        diff_src: MemoryDesc,
    ) -> Result<Descriptors> {
        let desc = ConvolutionDesc {
            src,
            dst_shape: self.dst_shape,
            weights: self.weights_desc,
            geometry: self.geometry,
            has_bias: self.has_bias,
            format: self.format,
        };
        let primitive = ctx.backend.convolution(&desc)?;

        log::debug!(
            "{}: dst {}, weights {:?}, reorder src: {}, reorder diff src: {}, reorder weights: {}",
            name,
            primitive.dst.format,
            primitive.weights.format,
            primitive.src != src,
            primitive.diff_src != diff_src,
            primitive.weights != self.weights_desc
        );

        self.desc = Some(desc);
        self.src = Some(src);
        self.diff_src = Some(diff_src);
        self.primitive.store(primitive, ctx.config.cache_primitives);
        Ok(Descriptors {
            dst: primitive.dst,
            diff_dst: primitive.diff_dst,
        })
    }

    fn current_primitive(&self, backend: &dyn Backend) -> Result<ConvolutionPrimitive> {
        let desc = self.desc.ok_or_else(super::not_initialized)?;
        self.primitive.get_or_build(|| backend.convolution(&desc))
    }

    pub(crate) fn forward(&mut self, name: &str, ctx: ForwardContext<'_>) -> Result<()> {
        let prim = self.current_primitive(ctx.backend)?;
        let src_desc = self.src.ok_or_else(super::not_initialized)?;
        let src = reordered(ctx.backend, ctx.inputs[0], &src_desc, &prim.src)?;
        let weights = packed_weights(
            name,
            ctx.backend,
            &self.weights,
            &self.weights_desc,
            &mut self.packed,
            &prim.weights,
        )?;
        let bias = if self.has_bias { Some(self.biases.as_slice()) } else { None };

        ctx.backend
            .convolution_forward(&prim, &src, weights, bias, ctx.neurons)?;
        ctx.backend.wait()
    }

    pub(crate) fn backward(&mut self, name: &str, ctx: BackwardContext<'_>) -> Result<()> {
        super::expect_inputs(name, 1, ctx.inputs.len())?;
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
        let diff_bias = if self.has_bias {
            Some(self.biases_d1.as_mut_slice())
        } else {
            None
        };
        if prim.diff_weights == self.weights_desc {
            backend.convolution_backward_weights(&prim, &src, gradient, &mut self.weights_d1, diff_bias)?;
            backend.wait()?;
        } else {
            let mut scratch = vec![0.0; prim.diff_weights.len()];
            backend.convolution_backward_weights(&prim, &src, gradient, &mut scratch, diff_bias)?;
            backend.wait()?;
            backend.reorder_weights(&scratch, &prim.diff_weights, &mut self.weights_d1, &self.weights_desc)?;
            backend.wait()?;
        }

        let weights = packed_weights(
            name,
            backend,
            &self.weights,
            &self.weights_desc,
            &mut self.packed,
            &prim.weights,
        )?;
        propagate_gradient(backend, input, &diff_src_desc, &prim.diff_src, |diff_src| {
            backend.convolution_backward_data(&prim, gradient, weights, diff_src)
        })
    }

    pub(crate) fn weights_size(&self) -> usize {
        (self.weights.len() + self.biases.len()) * FLOAT_SIZE
    }

    pub(crate) fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_f32s(writer, &self.weights)?;
        write_f32s(writer, &self.biases)
    }

    pub(crate) fn load(&mut self, reader: &mut dyn Read) -> Result<()> {
        read_f32s(reader, &mut self.weights)?;
        read_f32s(reader, &mut self.biases)?;
        self.packed = None;
        Ok(())
    }
}

/// Weights in the order `target`, converting and caching on first request.
fn packed_weights<'a>(
    name: &str,
    backend: &dyn Backend,
    canonical: &'a [f32],
    canonical_desc: &WeightsDesc,
    packed: &'a mut Option<PackedWeights>,
    target: &WeightsDesc,
) -> Result<&'a [f32]> {
    if target == canonical_desc {
        return Ok(canonical);
    }
    let fresh = matches!(packed.as_ref(), Some(p) if p.desc == *target);
    if !fresh {
        let mut values = vec![0.0; target.len()];
        backend.reorder_weights(canonical, canonical_desc, &mut values, target)?;
        backend.wait()?;
        log::debug!("{}: cached weights reordered to {:?}", name, target.format);
        *packed = Some(PackedWeights {
            desc: *target,
            values,
        });
    }
    packed
        .as_ref()
        .map(|p| p.values.as_slice())
        .ok_or_else(super::not_initialized)
}

/// Depthwise convolution over every input channel.
#[derive(Debug, Clone)]
pub struct DepthwiseConvolution {
    name: String,
    input_shape: Shape,
    multiplier: usize,
    core: ConvolutionCore,
}

impl DepthwiseConvolution {
    /// Creates the layer and draws Xavier-uniform weights from `rng`.
    pub fn new(name: &str, input_shape: Shape, options: DepthwiseOptions, rng: &mut SimpleRng) -> Result<Self> {
        let core = ConvolutionCore::new(name, input_shape, input_shape.c, &options)?;
        let mut layer = Self {
            name: name.to_string(),
            input_shape,
            multiplier: options.multiplier,
            core,
        };
        let (fan_in, fan_out) = (layer.fan_in(), layer.fan_out());
        layer.core.reset(rng, fan_in, fan_out);
        Ok(layer)
    }

    pub fn multiplier(&self) -> usize {
        self.multiplier
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

impl Layer for DepthwiseConvolution {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::DepthwiseConvolution
    }

    fn shape(&self) -> Shape {
        self.core.dst_shape()
    }

    fn fan_in(&self) -> usize {
        let g = self.core.geometry();
        g.kernel_h * g.kernel_w
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
            "{}\n Multiplier:\t{}\n Kernel:\t{}x{}\n Dilates:\t{}x{}\n Stride:\t{}x{}\n Padding:\t{}x{}\n Bias:\t\t{}",
            description_header(self),
            self.multiplier,
            g.kernel_h,
            g.kernel_w,
            g.dilation_h,
            g.dilation_w,
            g.stride_h,
            g.stride_w,
            g.pad_h,
            g.pad_w,
            if self.core.has_bias() { "Yes" } else { "No" }
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
        self.core
            .initialize(&self.name, ctx, upstream.dst, upstream.diff_dst)
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

impl Persist for DepthwiseConvolution {
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
