//! Nearest or bilinear spatial resampling by independent height and width factors

use super::{
    description_header, propagate_gradient, reordered, BackwardContext, ForwardContext, InitContext, Layer,
    LayerType, PrimitiveCache,
};
use crate::backend::{Backend, ResamplingAlgorithm, ResamplingDesc, ResamplingPrimitive};
use crate::error::{LayerError, Result};
use crate::tensor::{inherit_format, DataFormat, Descriptors, FormatPreference, MemoryDesc, Shape};

/// `trunc(extent * factor)`, rejected when it collapses to zero.
fn scaled_extent(name: &str, extent: usize, factor: f32) -> Result<usize> {
    if !(factor.is_finite() && factor > 0.0) {
        return Err(LayerError::invalid(name, format!("scale factor {} must be positive", factor)));
    }
    let scaled = (extent as f64 * factor as f64) as usize;
    if scaled == 0 {
        return Err(LayerError::invalid(
            name,
            format!("scaling {} by {} leaves nothing", extent, factor),
        ));
    }
    Ok(scaled)
}

#[derive(Debug, Clone)]
pub struct Resampling {
    name: String,
    input_shape: Shape,
    shape: Shape,
    algorithm: ResamplingAlgorithm,
    factor_h: f32,
    factor_w: f32,
    format: FormatPreference,
    desc: Option<ResamplingDesc>,
    primitive: PrimitiveCache<ResamplingPrimitive>,
    src: Option<MemoryDesc>,
    diff_src: Option<MemoryDesc>,
}

impl Resampling {
    pub fn new(
        name: &str,
        input_shape: Shape,
        algorithm: ResamplingAlgorithm,
        factor_h: f32,
        factor_w: f32,
        format: FormatPreference,
    ) -> Result<Self> {
        let shape = Shape::new(
            input_shape.c,
            input_shape.d,
            scaled_extent(name, input_shape.h, factor_h)?,
            scaled_extent(name, input_shape.w, factor_w)?,
        );
        Ok(Self {
            name: name.to_string(),
            input_shape,
            shape,
            algorithm,
            factor_h,
            factor_w,
            format,
            desc: None,
            primitive: PrimitiveCache::default(),
            src: None,
            diff_src: None,
        })
    }

    pub fn algorithm(&self) -> ResamplingAlgorithm {
        self.algorithm
    }

    pub fn factors(&self) -> (f32, f32) {
        (self.factor_h, self.factor_w)
    }

    fn current_primitive(&self, backend: &dyn Backend) -> Result<ResamplingPrimitive> {
        let desc = self.desc.ok_or_else(super::not_initialized)?;
        self.primitive.get_or_build(|| backend.resampling(&desc))
    }
}

impl Layer for Resampling {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Resampling
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
        format!(
            "{}\n Scaling:\t{:.4}x{:.4}\n Algorithm:\t{}",
            description_header(self),
            self.factor_h,
            self.factor_w,
            match self.algorithm {
                ResamplingAlgorithm::Linear => "linear",
                ResamplingAlgorithm::Nearest => "nearest",
            }
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
        let format = inherit_format(&self.name, self.format, &upstream)?;
        let desc = ResamplingDesc {
            src: upstream.dst,
            dst_shape: self.shape,
            algorithm: self.algorithm,
            format: match format {
                DataFormat::Plain => FormatPreference::Plain,
                DataFormat::Blocked => FormatPreference::Blocked,
            },
        };
        let primitive = ctx.backend.resampling(&desc)?;
        log::debug!(
            "{}: {} -> {} in {}",
            self.name,
            self.input_shape,
            self.shape,
            primitive.dst.format
        );

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
        ctx.backend.resampling_forward(&prim, &src, ctx.neurons)?;
        ctx.backend.wait()
    }

    fn backward_prop(&mut self, ctx: BackwardContext<'_>) -> Result<()> {
        super::expect_inputs(&self.name, 1, ctx.inputs.len())?;
        let prim = self.current_primitive(ctx.backend)?;
        let diff_src = self.diff_src.ok_or_else(super::not_initialized)?;
        let backend = ctx.backend;
        let gradient = ctx.neurons_d1;
        let mut inputs = ctx.inputs;
        propagate_gradient(backend, &mut inputs[0], &diff_src, &prim.diff_src, |out| {
            backend.resampling_backward(&prim, gradient, out)
        })
    }
}
