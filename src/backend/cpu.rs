//! Reference CPU backend
//!
//! Straightforward loop kernels parallelized over batch samples (or groups for
//! weight gradients) through the [`Dispatcher`]. Every kernel addresses memory
//! through its descriptors, so plain, blocked and channel-window layouts all
//! work; the preferred layouts only decide what the primitives ask layers for.

use super::{
    Backend, BatchNormDesc, BatchNormPrimitive, BatchStatistics, ConvolutionDesc,
    ConvolutionPrimitive, ResamplingAlgorithm, ResamplingDesc, ResamplingPrimitive,
};
use crate::error::{LayerError, Result};
use crate::parallel::Dispatcher;
use crate::tensor::{
    reorder_data, reorder_weights, DataFormat, FormatPreference, MemoryDesc, WeightsDesc,
    WeightsFormat,
};
use crate::utils::kahan::KahanSum;
use crate::utils::statistics::{channel_statistics, StatisticsMode};

const NAME: &str = "cpu";

/// Reference backend executing synchronously on a rayon pool.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    dispatcher: Dispatcher,
    data_format: DataFormat,
    weights_format: WeightsFormat,
}

impl CpuBackend {
    /// Backend preferring plain activations and canonical weights.
    pub fn new() -> Result<Self> {
        Ok(Self::with_dispatcher(Dispatcher::new()?))
    }

    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            data_format: DataFormat::Plain,
            weights_format: WeightsFormat::Canonical,
        }
    }

    /// Changes the layouts this backend asks layers for.
    pub fn with_layouts(mut self, data_format: DataFormat, weights_format: WeightsFormat) -> Self {
        self.data_format = data_format;
        self.weights_format = weights_format;
        self
    }

    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    pub fn weights_format(&self) -> WeightsFormat {
        self.weights_format
    }

    fn choose(&self, preference: FormatPreference) -> DataFormat {
        preference.fixed().unwrap_or(self.data_format)
    }

    fn fail(detail: impl Into<String>) -> LayerError {
        LayerError::backend(NAME, detail)
    }
}

/// Keeps `desc` (including a channel window) when it is already in `format`.
fn bind(desc: &MemoryDesc, format: DataFormat) -> MemoryDesc {
    if desc.format == format {
        *desc
    } else {
        desc.standalone(format)
    }
}

fn check_len(len: usize, expected: usize) -> Result<()> {
    if len < expected {
        return Err(LayerError::BufferLength {
            expected,
            actual: len,
        });
    }
    Ok(())
}

#[inline]
fn tap(out: usize, stride: usize, k: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    let pos = (out * stride + k * dilation) as isize - pad as isize;
    if pos < 0 || pos as usize >= extent {
        None
    } else {
        Some(pos as usize)
    }
}

/// Output index reached from input index `input` through kernel tap `k`, if any.
#[inline]
fn inverse_tap(input: usize, stride: usize, k: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    let t = (input + pad) as isize - (k * dilation) as isize;
    if t < 0 || t as usize % stride != 0 {
        return None;
    }
    let out = t as usize / stride;
    if out >= extent {
        None
    } else {
        Some(out)
    }
}

fn nearest_index(out: usize, out_len: usize, in_len: usize) -> usize {
    let pos = ((out as f32 + 0.5) * in_len as f32 / out_len as f32).floor() as usize;
    pos.min(in_len - 1)
}

fn linear_taps(out: usize, out_len: usize, in_len: usize) -> (usize, usize, f32) {
    let pos = ((out as f32 + 0.5) * in_len as f32 / out_len as f32 - 0.5).clamp(0.0, (in_len - 1) as f32);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(in_len - 1);
    (lo, hi, pos - lo as f32)
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn convolution(&self, desc: &ConvolutionDesc) -> Result<ConvolutionPrimitive> {
        let src_shape = desc.src.shape;
        let w = desc.weights;
        if src_shape.d != 1 || desc.dst_shape.d != 1 {
            return Err(Self::fail("only 2-D convolutions are supported"));
        }
        if w.groups * w.in_per_group != src_shape.c {
            return Err(Self::fail(format!(
                "weights expect {} input channels, source has {}",
                w.groups * w.in_per_group,
                src_shape.c
            )));
        }
        if w.groups * w.out_per_group != desc.dst_shape.c {
            return Err(Self::fail(format!(
                "weights produce {} channels, destination has {}",
                w.groups * w.out_per_group,
                desc.dst_shape.c
            )));
        }
        if w.kernel_h != desc.geometry.kernel_h || w.kernel_w != desc.geometry.kernel_w {
            return Err(Self::fail("kernel size differs from weights"));
        }
        match desc.geometry.output_size(src_shape.h, src_shape.w) {
            Some((h, wd)) if h == desc.dst_shape.h && wd == desc.dst_shape.w => {}
            _ => return Err(Self::fail("destination size does not match geometry")),
        }

        let format = self.choose(desc.format);
        let src = bind(&desc.src, format);
        let dst = MemoryDesc::new(desc.src.batch, desc.dst_shape, format);
        let weights = w.with_format(self.weights_format);

        Ok(ConvolutionPrimitive {
            src,
            weights,
            dst,
            diff_src: src,
            diff_dst: dst,
            diff_weights: weights,
            geometry: desc.geometry,
            has_bias: desc.has_bias,
        })
    }

    fn convolution_forward(
        &self,
        prim: &ConvolutionPrimitive,
        src: &[f32],
        weights: &[f32],
        bias: Option<&[f32]>,
        dst: &mut [f32],
    ) -> Result<()> {
        let p = *prim;
        let wd = p.weights;
        check_len(src.len(), p.src.required_len())?;
        check_len(dst.len(), p.dst.required_len())?;
        check_len(weights.len(), wd.len())?;
        let bias = if p.has_bias { bias } else { None };
        if let Some(b) = bias {
            check_len(b.len(), p.dst.shape.c)?;
        }

        let g = p.geometry;
        let (in_h, in_w) = (p.src.shape.h, p.src.shape.w);
        let (out_h, out_w) = (p.dst.shape.h, p.dst.shape.w);
        let work = p.dst.batch * p.dst.shape.cdhw() * wd.in_per_group * g.kernel_h * g.kernel_w;
        let threads = self.dispatcher.threads_for(work, 1);

        self.dispatcher.for_each_chunk(
            &mut dst[..p.dst.required_len()],
            p.dst.sample_stride(),
            threads,
            |n, out| {
                for oc in 0..p.dst.shape.c {
                    let group = oc / wd.out_per_group;
                    let o = oc % wd.out_per_group;
                    let b = bias.map_or(0.0, |b| b[oc]);
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let mut acc = b;
                            for i in 0..wd.in_per_group {
                                let ic = group * wd.in_per_group + i;
                                for ky in 0..g.kernel_h {
                                    let Some(iy) = tap(oy, g.stride_h, ky, g.dilation_h, g.pad_h, in_h) else {
                                        continue;
                                    };
                                    for kx in 0..g.kernel_w {
                                        let Some(ix) = tap(ox, g.stride_w, kx, g.dilation_w, g.pad_w, in_w) else {
                                            continue;
                                        };
                                        acc += src[p.src.offset(n, ic, iy * in_w + ix)]
                                            * weights[wd.offset(group, o, i, ky, kx)];
                                    }
                                }
                            }
                            out[p.dst.sample_offset(oc, oy * out_w + ox)] = acc;
                        }
                    }
                }
            },
        );
        Ok(())
    }

    fn convolution_backward_weights(
        &self,
        prim: &ConvolutionPrimitive,
        src: &[f32],
        diff_dst: &[f32],
        diff_weights: &mut [f32],
        diff_bias: Option<&mut [f32]>,
    ) -> Result<()> {
        let p = *prim;
        let wd = p.diff_weights;
        check_len(src.len(), p.src.required_len())?;
        check_len(diff_dst.len(), p.diff_dst.required_len())?;
        check_len(diff_weights.len(), wd.len())?;

        let g = p.geometry;
        let (in_h, in_w) = (p.src.shape.h, p.src.shape.w);
        let (out_h, out_w) = (p.diff_dst.shape.h, p.diff_dst.shape.w);
        let batch = p.src.batch;
        let work = batch * p.diff_dst.shape.cdhw() * wd.in_per_group * g.kernel_h * g.kernel_w;
        let threads = self.dispatcher.threads_for(work, 1);

        let per_group = self.dispatcher.map(wd.groups, threads, |group| {
            let mut grads = Vec::with_capacity(wd.out_per_group * wd.in_per_group * g.kernel_h * g.kernel_w);
            let mut bias = Vec::with_capacity(wd.out_per_group);
            for o in 0..wd.out_per_group {
                let oc = group * wd.out_per_group + o;
                for i in 0..wd.in_per_group {
                    let ic = group * wd.in_per_group + i;
                    for ky in 0..g.kernel_h {
                        for kx in 0..g.kernel_w {
                            let mut acc = KahanSum::new();
                            for n in 0..batch {
                                for oy in 0..out_h {
                                    let Some(iy) = tap(oy, g.stride_h, ky, g.dilation_h, g.pad_h, in_h) else {
                                        continue;
                                    };
                                    for ox in 0..out_w {
                                        let Some(ix) = tap(ox, g.stride_w, kx, g.dilation_w, g.pad_w, in_w) else {
                                            continue;
                                        };
                                        acc.add(
                                            diff_dst[p.diff_dst.offset(n, oc, oy * out_w + ox)]
                                                * src[p.src.offset(n, ic, iy * in_w + ix)],
                                        );
                                    }
                                }
                            }
                            grads.push(acc.value());
                        }
                    }
                }
                let mut acc = KahanSum::new();
                for n in 0..batch {
                    for s in 0..out_h * out_w {
                        acc.add(diff_dst[p.diff_dst.offset(n, oc, s)]);
                    }
                }
                bias.push(acc.value());
            }
            (grads, bias)
        });

        diff_weights[..wd.len()].iter_mut().for_each(|v| *v = 0.0);
        for (group, (grads, _)) in per_group.iter().enumerate() {
            let mut values = grads.iter();
            for o in 0..wd.out_per_group {
                for i in 0..wd.in_per_group {
                    for ky in 0..g.kernel_h {
                        for kx in 0..g.kernel_w {
                            if let Some(&v) = values.next() {
                                diff_weights[wd.offset(group, o, i, ky, kx)] = v;
                            }
                        }
                    }
                }
            }
        }

        if let Some(diff_bias) = diff_bias {
            check_len(diff_bias.len(), p.diff_dst.shape.c)?;
            for (group, (_, bias)) in per_group.iter().enumerate() {
                for (o, &v) in bias.iter().enumerate() {
                    diff_bias[group * wd.out_per_group + o] = v;
                }
            }
        }
        Ok(())
    }

    fn convolution_backward_data(
        &self,
        prim: &ConvolutionPrimitive,
        diff_dst: &[f32],
        weights: &[f32],
        diff_src: &mut [f32],
    ) -> Result<()> {
        let p = *prim;
        let wd = p.weights;
        check_len(diff_dst.len(), p.diff_dst.required_len())?;
        check_len(weights.len(), wd.len())?;
        check_len(diff_src.len(), p.diff_src.required_len())?;

        let g = p.geometry;
        let (in_h, in_w) = (p.diff_src.shape.h, p.diff_src.shape.w);
        let (out_h, out_w) = (p.diff_dst.shape.h, p.diff_dst.shape.w);
        let work = p.diff_src.batch * p.diff_src.shape.cdhw() * wd.out_per_group * g.kernel_h * g.kernel_w;
        let threads = self.dispatcher.threads_for(work, 1);

        self.dispatcher.for_each_chunk(
            &mut diff_src[..p.diff_src.required_len()],
            p.diff_src.sample_stride(),
            threads,
            |n, chunk| {
                for ic in 0..p.diff_src.shape.c {
                    let group = ic / wd.in_per_group;
                    let i = ic % wd.in_per_group;
                    for iy in 0..in_h {
                        for ix in 0..in_w {
                            let mut acc = 0.0f32;
                            for o in 0..wd.out_per_group {
                                let oc = group * wd.out_per_group + o;
                                for ky in 0..g.kernel_h {
                                    let Some(oy) = inverse_tap(iy, g.stride_h, ky, g.dilation_h, g.pad_h, out_h) else {
                                        continue;
                                    };
                                    for kx in 0..g.kernel_w {
                                        let Some(ox) = inverse_tap(ix, g.stride_w, kx, g.dilation_w, g.pad_w, out_w) else {
                                            continue;
                                        };
                                        acc += diff_dst[p.diff_dst.offset(n, oc, oy * out_w + ox)]
                                            * weights[wd.offset(group, o, i, ky, kx)];
                                    }
                                }
                            }
                            chunk[p.diff_src.sample_offset(ic, iy * in_w + ix)] = acc;
                        }
                    }
                }
            },
        );
        Ok(())
    }

    fn batch_normalization(&self, desc: &BatchNormDesc) -> Result<BatchNormPrimitive> {
        if !(desc.eps > 0.0) {
            return Err(Self::fail("epsilon must be positive"));
        }
        let format = desc.format.fixed().unwrap_or(desc.src.format);
        let src = bind(&desc.src, format);
        let dst = desc.src.standalone(format);
        let workspace_len = if desc.flags.fuse_relu { dst.required_len() } else { 0 };
        Ok(BatchNormPrimitive {
            src,
            dst,
            diff_src: src,
            diff_dst: dst,
            eps: desc.eps,
            flags: desc.flags,
            workspace_len,
        })
    }

    fn batch_normalization_forward(
        &self,
        prim: &BatchNormPrimitive,
        src: &[f32],
        statistics: BatchStatistics<'_>,
        scale_shift: Option<&[f32]>,
        dst: &mut [f32],
        workspace: Option<&mut [u8]>,
    ) -> Result<()> {
        let p = *prim;
        let channels = p.src.shape.c;
        let padded = p.src.shape.padded_c();
        let dhw = p.src.shape.dhw();
        check_len(src.len(), p.src.required_len())?;
        check_len(dst.len(), p.dst.required_len())?;
        let scale_shift = if p.flags.scale_shift { scale_shift } else { None };
        if let Some(ss) = scale_shift {
            check_len(ss.len(), 2 * padded)?;
        }
        let threads = self
            .dispatcher
            .threads_for(p.src.batch * p.src.shape.cdhw(), crate::parallel::TRAINING_WEIGHT);

        let (mean, variance): (&[f32], &[f32]) = match statistics {
            BatchStatistics::Compute { mean, variance } => {
                check_len(mean.len(), channels)?;
                check_len(variance.len(), channels)?;
                let stats = self.dispatcher.map(channels, threads, |c| {
                    channel_statistics(src, &p.src, c, StatisticsMode::TwoPass)
                });
                for (c, s) in stats.iter().enumerate() {
                    mean[c] = s.mean;
                    variance[c] = s.variance;
                }
                let mean: &[f32] = mean;
                let variance: &[f32] = variance;
                (mean, variance)
            }
            BatchStatistics::Global { mean, variance } => {
                check_len(mean.len(), channels)?;
                check_len(variance.len(), channels)?;
                (mean, variance)
            }
        };

        let fuse_relu = p.flags.fuse_relu;
        self.dispatcher.for_each_chunk(
            &mut dst[..p.dst.required_len()],
            p.dst.sample_stride(),
            threads,
            |n, out| {
                for c in 0..channels {
                    let inv_std = 1.0 / (variance[c] + p.eps).sqrt();
                    let (scale, shift) = scale_shift.map_or((1.0, 0.0), |ss| (ss[c], ss[padded + c]));
                    let (src_start, src_step) = p.src.channel_run(c);
                    let (dst_start, dst_step) = p.dst.channel_run(c);
                    let base = n * p.src.sample_stride() + src_start;
                    for s in 0..dhw {
                        let x = src[base + s * src_step];
                        let mut y = (x - mean[c]) * inv_std * scale + shift;
                        if fuse_relu && y < 0.0 {
                            y = 0.0;
                        }
                        out[dst_start + s * dst_step] = y;
                    }
                }
            },
        );

        if fuse_relu {
            if let Some(ws) = workspace {
                check_len(ws.len(), p.workspace_len)?;
                for n in 0..p.dst.batch {
                    for c in 0..channels {
                        for s in 0..dhw {
                            let idx = p.dst.offset(n, c, s);
                            ws[idx] = u8::from(dst[idx] > 0.0);
                        }
                    }
                }
            }
        }
        Ok(())
    }

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
    ) -> Result<()> {
        let p = *prim;
        let channels = p.src.shape.c;
        let padded = p.src.shape.padded_c();
        let dhw = p.src.shape.dhw();
        let batch = p.src.batch;
        check_len(src.len(), p.src.required_len())?;
        check_len(diff_dst.len(), p.diff_dst.required_len())?;
        check_len(diff_src.len(), p.diff_src.required_len())?;
        check_len(mean.len(), channels)?;
        check_len(variance.len(), channels)?;
        let fuse_relu = p.flags.fuse_relu;
        if fuse_relu {
            check_len(workspace.len(), p.workspace_len)?;
        }
        let scale_shift = if p.flags.scale_shift { scale_shift } else { None };
        if let Some(ss) = scale_shift {
            check_len(ss.len(), 2 * padded)?;
        }

        let count = (batch * dhw) as f32;
        let threads = self
            .dispatcher
            .threads_for(batch * p.src.shape.cdhw(), crate::parallel::TRAINING_WEIGHT);
        let gradient = |n: usize, c: usize, s: usize| -> f32 {
            let g = diff_dst[p.diff_dst.offset(n, c, s)];
            if fuse_relu && workspace[p.dst.offset(n, c, s)] == 0 {
                0.0
            } else {
                g
            }
        };

        // per channel: (Σ dy, Σ dy * x_hat)
        let sums = self.dispatcher.map(channels, threads, |c| {
            let inv_std = 1.0 / (variance[c] + p.eps).sqrt();
            let mut sum_dy = KahanSum::new();
            let mut sum_dy_xhat = KahanSum::new();
            for n in 0..batch {
                for s in 0..dhw {
                    let dy = gradient(n, c, s);
                    sum_dy.add(dy);
                    sum_dy_xhat.add(dy * (src[p.src.offset(n, c, s)] - mean[c]) * inv_std);
                }
            }
            (sum_dy.value(), sum_dy_xhat.value())
        });

        let global = p.flags.global_stats;
        self.dispatcher.for_each_chunk(
            &mut diff_src[..p.diff_src.required_len()],
            p.diff_src.sample_stride(),
            threads,
            |n, chunk| {
                for c in 0..channels {
                    let inv_std = 1.0 / (variance[c] + p.eps).sqrt();
                    let scale = scale_shift.map_or(1.0, |ss| ss[c]);
                    let (sum_dy, sum_dy_xhat) = sums[c];
                    for s in 0..dhw {
                        let dy = gradient(n, c, s);
                        let dx = if global {
                            dy
                        } else {
                            let x_hat = (src[p.src.offset(n, c, s)] - mean[c]) * inv_std;
                            dy - sum_dy / count - x_hat * sum_dy_xhat / count
                        };
                        chunk[p.diff_src.sample_offset(c, s)] = dx * inv_std * scale;
                    }
                }
            },
        );

        if let Some(dss) = diff_scale_shift {
            check_len(dss.len(), 2 * padded)?;
            for (c, &(sum_dy, sum_dy_xhat)) in sums.iter().enumerate() {
                dss[c] = sum_dy_xhat;
                dss[padded + c] = sum_dy;
            }
        }
        Ok(())
    }

    fn resampling(&self, desc: &ResamplingDesc) -> Result<ResamplingPrimitive> {
        if desc.dst_shape.c != desc.src.shape.c || desc.dst_shape.d != desc.src.shape.d {
            return Err(Self::fail("resampling changes only height and width"));
        }
        if desc.dst_shape.h == 0 || desc.dst_shape.w == 0 || desc.src.shape.h == 0 || desc.src.shape.w == 0 {
            return Err(Self::fail("resampling to or from an empty plane"));
        }
        let dst = MemoryDesc::new(desc.src.batch, desc.dst_shape, self.choose(desc.format));
        Ok(ResamplingPrimitive {
            src: desc.src,
            dst,
            diff_src: desc.src,
            diff_dst: dst,
            algorithm: desc.algorithm,
        })
    }

    fn resampling_forward(&self, prim: &ResamplingPrimitive, src: &[f32], dst: &mut [f32]) -> Result<()> {
        let p = *prim;
        check_len(src.len(), p.src.required_len())?;
        check_len(dst.len(), p.dst.required_len())?;
        let (depth, in_h, in_w) = (p.src.shape.d, p.src.shape.h, p.src.shape.w);
        let (out_h, out_w) = (p.dst.shape.h, p.dst.shape.w);
        let threads = self.dispatcher.threads_for(p.dst.batch * p.dst.shape.cdhw(), 1);

        self.dispatcher.for_each_chunk(
            &mut dst[..p.dst.required_len()],
            p.dst.sample_stride(),
            threads,
            |n, out| {
                for c in 0..p.dst.shape.c {
                    for z in 0..depth {
                        let src_plane = z * in_h * in_w;
                        let dst_plane = z * out_h * out_w;
                        for oy in 0..out_h {
                            for ox in 0..out_w {
                                let value = match p.algorithm {
                                    ResamplingAlgorithm::Nearest => {
                                        let iy = nearest_index(oy, out_h, in_h);
                                        let ix = nearest_index(ox, out_w, in_w);
                                        src[p.src.offset(n, c, src_plane + iy * in_w + ix)]
                                    }
                                    ResamplingAlgorithm::Linear => {
                                        let (y0, y1, fy) = linear_taps(oy, out_h, in_h);
                                        let (x0, x1, fx) = linear_taps(ox, out_w, in_w);
                                        let at = |y: usize, x: usize| src[p.src.offset(n, c, src_plane + y * in_w + x)];
                                        (1.0 - fy) * ((1.0 - fx) * at(y0, x0) + fx * at(y0, x1))
                                            + fy * ((1.0 - fx) * at(y1, x0) + fx * at(y1, x1))
                                    }
                                };
                                out[p.dst.sample_offset(c, dst_plane + oy * out_w + ox)] = value;
                            }
                        }
                    }
                }
            },
        );
        Ok(())
    }

    fn resampling_backward(
        &self,
        prim: &ResamplingPrimitive,
        diff_dst: &[f32],
        diff_src: &mut [f32],
    ) -> Result<()> {
        let p = *prim;
        check_len(diff_dst.len(), p.diff_dst.required_len())?;
        check_len(diff_src.len(), p.diff_src.required_len())?;
        let (depth, in_h, in_w) = (p.diff_src.shape.d, p.diff_src.shape.h, p.diff_src.shape.w);
        let (out_h, out_w) = (p.diff_dst.shape.h, p.diff_dst.shape.w);
        let threads = self.dispatcher.threads_for(p.diff_dst.batch * p.diff_dst.shape.cdhw(), 1);

        self.dispatcher.for_each_chunk(
            &mut diff_src[..p.diff_src.required_len()],
            p.diff_src.sample_stride(),
            threads,
            |n, chunk| {
                for c in 0..p.diff_src.shape.c {
                    for s in 0..p.diff_src.shape.dhw() {
                        chunk[p.diff_src.sample_offset(c, s)] = 0.0;
                    }
                    for z in 0..depth {
                        let src_plane = z * in_h * in_w;
                        let dst_plane = z * out_h * out_w;
                        for oy in 0..out_h {
                            for ox in 0..out_w {
                                let g = diff_dst[p.diff_dst.offset(n, c, dst_plane + oy * out_w + ox)];
                                let mut add = |y: usize, x: usize, w: f32| {
                                    chunk[p.diff_src.sample_offset(c, src_plane + y * in_w + x)] += w * g;
                                };
                                match p.algorithm {
                                    ResamplingAlgorithm::Nearest => {
                                        add(nearest_index(oy, out_h, in_h), nearest_index(ox, out_w, in_w), 1.0);
                                    }
                                    ResamplingAlgorithm::Linear => {
                                        let (y0, y1, fy) = linear_taps(oy, out_h, in_h);
                                        let (x0, x1, fx) = linear_taps(ox, out_w, in_w);
                                        add(y0, x0, (1.0 - fy) * (1.0 - fx));
                                        add(y0, x1, (1.0 - fy) * fx);
                                        add(y1, x0, fy * (1.0 - fx));
                                        add(y1, x1, fy * fx);
                                    }
                                }
                            }
                        }
                    }
                }
            },
        );
        Ok(())
    }

    fn sum(&self, desc: &MemoryDesc, scales: &[f32], srcs: &[&[f32]], dst: &mut [f32]) -> Result<()> {
        if scales.len() != srcs.len() || srcs.is_empty() {
            return Err(Self::fail("sum needs one scale per source"));
        }
        let len = desc.required_len();
        check_len(dst.len(), len)?;
        for src in srcs {
            check_len(src.len(), len)?;
        }
        let stride = desc.sample_stride();
        let threads = self.dispatcher.threads_for(len * srcs.len(), 1);

        self.dispatcher.for_each_chunk(&mut dst[..len], stride, threads, |n, out| {
            let base = n * stride;
            for (j, v) in out.iter_mut().enumerate() {
                *v = scales
                    .iter()
                    .zip(srcs.iter())
                    .map(|(&scale, src)| scale * src[base + j])
                    .sum();
            }
        });
        Ok(())
    }

    fn binary_add(
        &self,
        dst: &mut [f32],
        dst_desc: &MemoryDesc,
        src: &[f32],
        src_desc: &MemoryDesc,
    ) -> Result<()> {
        if !dst_desc.same_extent(src_desc) {
            return Err(Self::fail("binary add of tensors with different extents"));
        }
        check_len(dst.len(), dst_desc.required_len())?;
        check_len(src.len(), src_desc.required_len())?;

        let stride = dst_desc.sample_stride();
        let dense = dst_desc == src_desc && !dst_desc.is_view();
        let dhw = dst_desc.shape.dhw();
        let threads = self.dispatcher.threads_for(dst_desc.batch * dst_desc.shape.cdhw(), 1);

        self.dispatcher.for_each_chunk(&mut dst[..dst_desc.required_len()], stride, threads, |n, out| {
            if dense {
                let base = n * stride;
                for (j, v) in out.iter_mut().enumerate() {
                    *v += src[base + j];
                }
            } else {
                for c in 0..dst_desc.shape.c {
                    for s in 0..dhw {
                        out[dst_desc.sample_offset(c, s)] += src[src_desc.offset(n, c, s)];
                    }
                }
            }
        });
        Ok(())
    }

    fn reorder(&self, src: &[f32], from: &MemoryDesc, dst: &mut [f32], to: &MemoryDesc) -> Result<()> {
        reorder_data(&self.dispatcher, src, from, dst, to)
    }

    fn reorder_weights(
        &self,
        src: &[f32],
        from: &WeightsDesc,
        dst: &mut [f32],
        to: &WeightsDesc,
    ) -> Result<()> {
        reorder_weights(src, from, dst, to)
    }

    fn wait(&self) -> Result<()> {
        Ok(())
    }
}
