//! Memory layouts, descriptors and reorder kernels
//!
//! Activations are stored either in a plain `N C D H W` order or in a blocked
//! order where groups of [`VECTOR_SIZE`] channels are interleaved innermost.
//! A [`MemoryDesc`] names the layout of one buffer and can describe a
//! contiguous channel sub-range of a larger tensor without copying it.

use super::shape::{padded_channels, Shape, VECTOR_SIZE};
use crate::error::{LayerError, Result};
use crate::parallel::Dispatcher;
use serde::{Deserialize, Serialize};

/// Physical activation layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// `N C D H W`, per-sample stride `C * DHW`.
    Plain,
    /// `N C/8 D H W 8c`, per-sample stride `PaddedC * DHW`.
    Blocked,
}

impl std::fmt::Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataFormat::Plain => write!(f, "nchw"),
            DataFormat::Blocked => write!(f, "nChw{}c", VECTOR_SIZE),
        }
    }
}

/// Layout requested by a layer at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatPreference {
    /// Follow the upstream layer (or whatever the backend prefers).
    #[default]
    Any,
    Plain,
    Blocked,
}

impl FormatPreference {
    /// Fixed layout, if any.
    pub fn fixed(self) -> Option<DataFormat> {
        match self {
            FormatPreference::Any => None,
            FormatPreference::Plain => Some(DataFormat::Plain),
            FormatPreference::Blocked => Some(DataFormat::Blocked),
        }
    }
}

/// Layout of a batch of activations, optionally a channel window into a larger tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDesc {
    pub batch: usize,
    /// Logical extent described by this view.
    pub shape: Shape,
    pub format: DataFormat,
    /// Channel count of the tensor the strides come from.
    pub parent_channels: usize,
    /// First channel of the view inside the parent.
    pub channel_offset: usize,
}

impl MemoryDesc {
    pub fn new(batch: usize, shape: Shape, format: DataFormat) -> Self {
        Self {
            batch,
            shape,
            format,
            parent_channels: shape.c,
            channel_offset: 0,
        }
    }

    /// View of `channels` channels starting at `offset`, sharing this descriptor's strides.
    pub fn submemory(&self, offset: usize, channels: usize) -> Result<Self> {
        if channels == 0 || offset + channels > self.shape.c {
            return Err(LayerError::shape(
                "submemory",
                format!(
                    "channel window {}..{} outside tensor of {} channels",
                    offset,
                    offset + channels,
                    self.shape.c
                ),
            ));
        }
        Ok(Self {
            batch: self.batch,
            shape: self.shape.with_channels(channels),
            format: self.format,
            parent_channels: self.parent_channels,
            channel_offset: self.channel_offset + offset,
        })
    }

    /// Same extent and layout but a standalone (non-view) buffer.
    pub fn standalone(&self, format: DataFormat) -> Self {
        Self::new(self.batch, self.shape, format)
    }

    pub fn is_view(&self) -> bool {
        self.channel_offset != 0 || self.parent_channels != self.shape.c
    }

    /// Distance between consecutive samples in the underlying buffer.
    pub fn sample_stride(&self) -> usize {
        let dhw = self.shape.dhw();
        match self.format {
            DataFormat::Plain => self.parent_channels * dhw,
            DataFormat::Blocked => padded_channels(self.parent_channels) * dhw,
        }
    }

    /// Minimum buffer length able to hold the whole batch.
    pub fn required_len(&self) -> usize {
        self.batch * self.sample_stride()
    }

    /// Offset of channel `c`, spatial index `s` inside one sample.
    #[inline]
    pub fn sample_offset(&self, c: usize, s: usize) -> usize {
        let cc = c + self.channel_offset;
        match self.format {
            DataFormat::Plain => cc * self.shape.dhw() + s,
            DataFormat::Blocked => {
                (cc / VECTOR_SIZE) * self.shape.dhw() * VECTOR_SIZE + s * VECTOR_SIZE + cc % VECTOR_SIZE
            }
        }
    }

    /// Absolute offset of element `(n, c, s)`.
    #[inline]
    pub fn offset(&self, n: usize, c: usize, s: usize) -> usize {
        n * self.sample_stride() + self.sample_offset(c, s)
    }

    /// Start (relative to the sample) and step of channel `c` across its spatial extent.
    #[inline]
    pub fn channel_run(&self, c: usize) -> (usize, usize) {
        let step = match self.format {
            DataFormat::Plain => 1,
            DataFormat::Blocked => VECTOR_SIZE,
        };
        (self.sample_offset(c, 0), step)
    }

    /// True when both descriptors cover the same logical elements.
    pub fn same_extent(&self, other: &MemoryDesc) -> bool {
        self.batch == other.batch && self.shape == other.shape
    }

    pub(crate) fn check_buffer(&self, len: usize) -> Result<()> {
        let expected = self.required_len();
        if len < expected {
            return Err(LayerError::BufferLength {
                expected,
                actual: len,
            });
        }
        Ok(())
    }
}

/// Forward and gradient layouts published by a layer after descriptor initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptors {
    pub dst: MemoryDesc,
    pub diff_dst: MemoryDesc,
}

impl Descriptors {
    pub fn symmetric(desc: MemoryDesc) -> Self {
        Self {
            dst: desc,
            diff_dst: desc,
        }
    }

    pub fn format(&self) -> DataFormat {
        self.dst.format
    }
}

/// Chooses the layout of a layer that keeps its input's layout when left free.
///
/// Fails when the upstream forward and gradient layouts disagree, since the
/// layer would not know which one to follow.
pub fn inherit_format(
    layer: &str,
    preference: FormatPreference,
    upstream: &Descriptors,
) -> Result<DataFormat> {
    match preference.fixed() {
        Some(format) => Ok(format),
        None => {
            if upstream.dst.format != upstream.diff_dst.format {
                return Err(LayerError::SrcDiffFormatMismatch {
                    layer: layer.to_string(),
                });
            }
            Ok(upstream.dst.format)
        }
    }
}

/// Order of grouped convolution weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsFormat {
    /// `g o i kh kw`.
    Canonical,
    /// Groups interleaved by [`VECTOR_SIZE`] innermost.
    Blocked,
}

/// Grouped convolution weights `(groups, out/group, in/group, kh, kw)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightsDesc {
    pub groups: usize,
    pub out_per_group: usize,
    pub in_per_group: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub format: WeightsFormat,
}

impl WeightsDesc {
    pub fn with_format(&self, format: WeightsFormat) -> Self {
        Self { format, ..*self }
    }

    fn per_group(&self) -> usize {
        self.out_per_group * self.in_per_group * self.kernel_h * self.kernel_w
    }

    /// Number of meaningful weights.
    pub fn count(&self) -> usize {
        self.groups * self.per_group()
    }

    /// Buffer length including group padding.
    pub fn len(&self) -> usize {
        match self.format {
            WeightsFormat::Canonical => self.count(),
            WeightsFormat::Blocked => padded_channels(self.groups) * self.per_group(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    pub fn offset(&self, g: usize, o: usize, i: usize, y: usize, x: usize) -> usize {
        let inner = ((o * self.in_per_group + i) * self.kernel_h + y) * self.kernel_w + x;
        match self.format {
            WeightsFormat::Canonical => g * self.per_group() + inner,
            WeightsFormat::Blocked => {
                ((g / VECTOR_SIZE) * self.per_group() + inner) * VECTOR_SIZE + g % VECTOR_SIZE
            }
        }
    }
}

/// Copies the logical elements of `src` into `dst`, converting layouts.
///
/// Works for views on either side; elements of `dst` outside `to` are untouched.
pub fn reorder_data(
    dispatcher: &Dispatcher,
    src: &[f32],
    from: &MemoryDesc,
    dst: &mut [f32],
    to: &MemoryDesc,
) -> Result<()> {
    if !from.same_extent(to) {
        return Err(LayerError::shape(
            "reorder",
            format!(
                "cannot reorder {} x {} into {} x {}",
                from.batch, from.shape, to.batch, to.shape
            ),
        ));
    }
    from.check_buffer(src.len())?;
    to.check_buffer(dst.len())?;

    let shape = to.shape;
    let dhw = shape.dhw();
    let stride = to.sample_stride();
    let threads = dispatcher.threads_for(to.batch * shape.cdhw(), 1);
    let dst = &mut dst[..to.required_len()];

    dispatcher.for_each_chunk(dst, stride, threads, |n, sample| {
        for c in 0..shape.c {
            let (src_start, src_step) = from.channel_run(c);
            let (dst_start, dst_step) = to.channel_run(c);
            let src_base = n * from.sample_stride() + src_start;
            for s in 0..dhw {
                sample[dst_start + s * dst_step] = src[src_base + s * src_step];
            }
        }
    });
    Ok(())
}

/// Converts convolution weights between orders. Padding lanes of a blocked target are zeroed.
pub fn reorder_weights(
    src: &[f32],
    from: &WeightsDesc,
    dst: &mut [f32],
    to: &WeightsDesc,
) -> Result<()> {
    if from.with_format(to.format) != *to {
        return Err(LayerError::shape(
            "reorder_weights",
            "weight geometries differ".to_string(),
        ));
    }
    if src.len() < from.len() || dst.len() < to.len() {
        return Err(LayerError::BufferLength {
            expected: to.len(),
            actual: dst.len(),
        });
    }

    dst[..to.len()].iter_mut().for_each(|v| *v = 0.0);
    for g in 0..to.groups {
        for o in 0..to.out_per_group {
            for i in 0..to.in_per_group {
                for y in 0..to.kernel_h {
                    for x in 0..to.kernel_w {
                        dst[to.offset(g, o, i, y, x)] = src[from.offset(g, o, i, y, x)];
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(len: usize) -> Vec<f32> {
        (0..len).map(|v| v as f32).collect()
    }

    #[test]
    fn test_blocked_offsets_interleave_channels() {
        let desc = MemoryDesc::new(1, Shape::image(10, 2, 2), DataFormat::Blocked);
        assert_eq!(desc.sample_stride(), 16 * 4);
        assert_eq!(desc.sample_offset(0, 0), 0);
        assert_eq!(desc.sample_offset(1, 0), 1);
        assert_eq!(desc.sample_offset(0, 1), 8);
        assert_eq!(desc.sample_offset(9, 3), 32 + 3 * 8 + 1);
    }

    #[test]
    fn test_plain_blocked_roundtrip_preserves_values() {
        let dispatcher = Dispatcher::with_threads(2).unwrap();
        let plain = MemoryDesc::new(2, Shape::image(3, 2, 3), DataFormat::Plain);
        let blocked = plain.standalone(DataFormat::Blocked);
        let src = iota(plain.required_len());
        let mut mid = vec![0.0; blocked.required_len()];
        let mut back = vec![0.0; plain.required_len()];

        reorder_data(&dispatcher, &src, &plain, &mut mid, &blocked).unwrap();
        assert_eq!(mid[blocked.offset(1, 2, 5)], src[plain.offset(1, 2, 5)]);
        reorder_data(&dispatcher, &mid, &blocked, &mut back, &plain).unwrap();
        assert_eq!(src, back);
    }

    #[test]
    fn test_submemory_addresses_channel_window() {
        let parent = MemoryDesc::new(2, Shape::image(6, 1, 2), DataFormat::Plain);
        let view = parent.submemory(4, 2).unwrap();
        assert!(view.is_view());
        assert_eq!(view.sample_stride(), parent.sample_stride());
        assert_eq!(view.offset(1, 0, 1), parent.offset(1, 4, 1));
        assert!(parent.submemory(5, 2).is_err());
    }

    #[test]
    fn test_reorder_into_view_leaves_other_channels() {
        let dispatcher = Dispatcher::with_threads(1).unwrap();
        let parent = MemoryDesc::new(1, Shape::image(4, 1, 2), DataFormat::Plain);
        let view = parent.submemory(2, 2).unwrap();
        let src = vec![1.0, 2.0, 3.0, 4.0];
        let mut dst = vec![-1.0; parent.required_len()];
        reorder_data(&dispatcher, &src, &view.standalone(DataFormat::Plain), &mut dst, &view).unwrap();
        assert_eq!(dst, vec![-1.0, -1.0, -1.0, -1.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_inherit_format_rejects_src_diff_mismatch() {
        let dst = MemoryDesc::new(1, Shape::vector(4), DataFormat::Plain);
        let upstream = Descriptors {
            dst,
            diff_dst: dst.standalone(DataFormat::Blocked),
        };
        let err = inherit_format("bn", FormatPreference::Any, &upstream).unwrap_err();
        assert!(matches!(err, LayerError::SrcDiffFormatMismatch { .. }));
        assert_eq!(
            inherit_format("bn", FormatPreference::Plain, &upstream).unwrap(),
            DataFormat::Plain
        );
    }

    #[test]
    fn test_weights_blocked_roundtrip() {
        let canonical = WeightsDesc {
            groups: 3,
            out_per_group: 2,
            in_per_group: 1,
            kernel_h: 3,
            kernel_w: 3,
            format: WeightsFormat::Canonical,
        };
        let blocked = canonical.with_format(WeightsFormat::Blocked);
        assert_eq!(blocked.len(), 8 * 18);
        let src = iota(canonical.len());
        let mut mid = vec![0.0; blocked.len()];
        let mut back = vec![0.0; canonical.len()];
        reorder_weights(&src, &canonical, &mut mid, &blocked).unwrap();
        reorder_weights(&mid, &blocked, &mut back, &canonical).unwrap();
        assert_eq!(src, back);
    }
}
