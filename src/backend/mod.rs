//! Tensor-primitive backend contract
//!
//! Layers own geometry, layouts and gradient bookkeeping; the arithmetic of
//! convolution, primitive batch normalization, resampling and elementwise
//! sums is delegated to a [`Backend`]. A backend is asked for a primitive
//! descriptor first, which tells the layer which layouts the primitive wants.
//! The layer inserts reorders where those differ from its own buffers, then
//! executes the primitive and waits on the backend before returning.

pub mod cpu;

pub use cpu::CpuBackend;

use crate::error::Result;
use crate::tensor::{FormatPreference, MemoryDesc, Shape, WeightsDesc};
use serde::{Deserialize, Serialize};

/// Kernel, stride, dilation and padding of a 2-D convolution.
///
/// Dilation follows the "1 means dense" convention: the effective kernel
/// extent is `1 + (kernel - 1) * dilation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub kernel_h: usize,
    pub kernel_w: usize,
    #[serde(default = "one")]
    pub stride_h: usize,
    #[serde(default = "one")]
    pub stride_w: usize,
    #[serde(default = "one")]
    pub dilation_h: usize,
    #[serde(default = "one")]
    pub dilation_w: usize,
    #[serde(default)]
    pub pad_h: usize,
    #[serde(default)]
    pub pad_w: usize,
}

fn one() -> usize {
    1
}

impl ConvGeometry {
    /// Square kernel with stride 1, no dilation and no padding.
    pub fn square(kernel: usize) -> Self {
        Self {
            kernel_h: kernel,
            kernel_w: kernel,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            pad_h: 0,
            pad_w: 0,
        }
    }

    pub fn with_stride(self, stride: usize) -> Self {
        Self {
            stride_h: stride,
            stride_w: stride,
            ..self
        }
    }

    pub fn with_dilation(self, dilation: usize) -> Self {
        Self {
            dilation_h: dilation,
            dilation_w: dilation,
            ..self
        }
    }

    pub fn with_padding(self, pad: usize) -> Self {
        Self {
            pad_h: pad,
            pad_w: pad,
            ..self
        }
    }

    pub fn dilated_kernel_h(&self) -> usize {
        1 + (self.kernel_h - 1) * self.dilation_h
    }

    pub fn dilated_kernel_w(&self) -> usize {
        1 + (self.kernel_w - 1) * self.dilation_w
    }

    pub fn is_valid(&self) -> bool {
        self.kernel_h > 0
            && self.kernel_w > 0
            && self.stride_h > 0
            && self.stride_w > 0
            && self.dilation_h > 0
            && self.dilation_w > 0
    }

    pub fn has_padding(&self) -> bool {
        self.pad_h > 0 || self.pad_w > 0
    }

    /// Output `(H, W)` for an input of `in_h x in_w`, or `None` when the
    /// dilated kernel does not fit in the padded input.
    pub fn output_size(&self, in_h: usize, in_w: usize) -> Option<(usize, usize)> {
        if !self.is_valid() {
            return None;
        }
        Some((
            output_dim(in_h, self.dilated_kernel_h(), self.stride_h, self.pad_h)?,
            output_dim(in_w, self.dilated_kernel_w(), self.stride_w, self.pad_w)?,
        ))
    }
}

/// `((input - dilated_kernel + 2 * pad) / stride) + 1`.
pub fn output_dim(input: usize, dilated_kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    let padded = input + 2 * pad;
    if padded < dilated_kernel || stride == 0 {
        return None;
    }
    Some((padded - dilated_kernel) / stride + 1)
}

/// Request for a grouped convolution primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvolutionDesc {
    /// Input as the layer stores it (possibly a channel window).
    pub src: MemoryDesc,
    pub dst_shape: Shape,
    /// Weights in the layer's canonical order.
    pub weights: WeightsDesc,
    pub geometry: ConvGeometry,
    pub has_bias: bool,
    pub format: FormatPreference,
}

/// Layouts a convolution primitive was built for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvolutionPrimitive {
    pub src: MemoryDesc,
    pub weights: WeightsDesc,
    pub dst: MemoryDesc,
    pub diff_src: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub diff_weights: WeightsDesc,
    pub geometry: ConvGeometry,
    pub has_bias: bool,
}

/// Behaviour switches of the batch-normalization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormalizationFlags {
    /// Normalize with supplied statistics instead of batch statistics.
    pub global_stats: bool,
    /// Apply the packed `[scale; shift]` buffer.
    pub scale_shift: bool,
    /// Apply ReLU to the output and remember the mask in the workspace.
    pub fuse_relu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormDesc {
    pub src: MemoryDesc,
    pub eps: f32,
    pub flags: NormalizationFlags,
    pub format: FormatPreference,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormPrimitive {
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub diff_src: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub eps: f32,
    pub flags: NormalizationFlags,
    /// Bytes of workspace the forward pass fills for the backward pass.
    pub workspace_len: usize,
}

/// Statistics binding for a batch-normalization forward call.
pub enum BatchStatistics<'a> {
    /// Computed from the batch and written out.
    Compute {
        mean: &'a mut [f32],
        variance: &'a mut [f32],
    },
    /// Supplied by the caller (running estimates).
    Global { mean: &'a [f32], variance: &'a [f32] },
}

/// Spatial resampling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingAlgorithm {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResamplingDesc {
    pub src: MemoryDesc,
    pub dst_shape: Shape,
    pub algorithm: ResamplingAlgorithm,
    pub format: FormatPreference,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResamplingPrimitive {
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub diff_src: MemoryDesc,
    pub diff_dst: MemoryDesc,
    pub algorithm: ResamplingAlgorithm,
}

/// Executes tensor primitives on some device.
///
/// Every execute call may be asynchronous; callers invoke [`Backend::wait`]
/// before reading results.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn convolution(&self, desc: &ConvolutionDesc) -> Result<ConvolutionPrimitive>;

    fn convolution_forward(
        &self,
        prim: &ConvolutionPrimitive,
        src: &[f32],
        weights: &[f32],
        bias: Option<&[f32]>,
        dst: &mut [f32],
    ) -> Result<()>;

    /// Writes (not accumulates) weight and bias gradients.
    fn convolution_backward_weights(
        &self,
        prim: &ConvolutionPrimitive,
        src: &[f32],
        diff_dst: &[f32],
        diff_weights: &mut [f32],
        diff_bias: Option<&mut [f32]>,
    ) -> Result<()>;

    /// Writes the input gradient over `prim.diff_src`'s elements.
    fn convolution_backward_data(
        &self,
        prim: &ConvolutionPrimitive,
        diff_dst: &[f32],
        weights: &[f32],
        diff_src: &mut [f32],
    ) -> Result<()>;

    fn batch_normalization(&self, desc: &BatchNormDesc) -> Result<BatchNormPrimitive>;

    fn batch_normalization_forward(
        &self,
        prim: &BatchNormPrimitive,
        src: &[f32],
        statistics: BatchStatistics<'_>,
        scale_shift: Option<&[f32]>,
        dst: &mut [f32],
        workspace: Option<&mut [u8]>,
    ) -> Result<()>;

    /// Writes the input gradient and, with scale/shift, its `[dscale; dshift]` gradient.
    #[allow(clippy::too_many_arguments)]
    fn batch_normalization_backward(
        &self,
        prim: &BatchNormPrimitive,
        src: &[f32],
        diff_dst: &[f32],
        mean: &[f32],
        variance: &[f32],
        scale_shift: Option<&[f32]>,
        workspace: &[u8],
        diff_src: &mut [f32],
        diff_scale_shift: Option<&mut [f32]>,
    ) -> Result<()>;

    fn resampling(&self, desc: &ResamplingDesc) -> Result<ResamplingPrimitive>;

    fn resampling_forward(&self, prim: &ResamplingPrimitive, src: &[f32], dst: &mut [f32]) -> Result<()>;

    /// Writes the input gradient over `prim.diff_src`'s elements.
    fn resampling_backward(
        &self,
        prim: &ResamplingPrimitive,
        diff_dst: &[f32],
        diff_src: &mut [f32],
    ) -> Result<()>;

    /// `dst = Σ scales[i] * srcs[i]`, all laid out as `desc`.
    fn sum(&self, desc: &MemoryDesc, scales: &[f32], srcs: &[&[f32]], dst: &mut [f32]) -> Result<()>;

    /// `dst += src` over the logical elements of both descriptors.
    fn binary_add(
        &self,
        dst: &mut [f32],
        dst_desc: &MemoryDesc,
        src: &[f32],
        src_desc: &MemoryDesc,
    ) -> Result<()>;

    fn reorder(&self, src: &[f32], from: &MemoryDesc, dst: &mut [f32], to: &MemoryDesc) -> Result<()>;

    fn reorder_weights(
        &self,
        src: &[f32],
        from: &WeightsDesc,
        dst: &mut [f32],
        to: &WeightsDesc,
    ) -> Result<()>;

    /// Blocks until all submitted work has finished.
    fn wait(&self) -> Result<()>;
}
