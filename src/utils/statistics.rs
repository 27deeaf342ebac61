//! Per-channel batch statistics with compensated accumulation

use crate::tensor::MemoryDesc;
use crate::utils::kahan::KahanSum;
use serde::{Deserialize, Serialize};

/// How batch mean and variance are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsMode {
    /// One sweep accumulating `Σx` and `Σx²`. Faster, loses precision when
    /// the mean is large compared to the spread.
    SinglePass,
    /// Mean first, then `Σ(x - mean)²`.
    #[default]
    TwoPass,
}

/// Mean and variances of one channel over `batch * D * H * W` values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelStats {
    pub mean: f32,
    /// Divided by `count`, used for normalization.
    pub variance: f32,
    /// Divided by `count - 1`, used for the running estimate.
    pub unbiased_variance: f32,
}

fn channel_values<'a>(
    src: &'a [f32],
    desc: &'a MemoryDesc,
    c: usize,
) -> impl Iterator<Item = f32> + 'a {
    let (start, step) = desc.channel_run(c);
    let stride = desc.sample_stride();
    let dhw = desc.shape.dhw();
    (0..desc.batch).flat_map(move |n| {
        let base = n * stride + start;
        (0..dhw).map(move |s| src[base + s * step])
    })
}

/// Statistics of channel `c` of `src` laid out as `desc`.
///
/// Variances are clamped at zero; cancellation in the single-pass form can
/// otherwise leave them slightly negative.
pub fn channel_statistics(
    src: &[f32],
    desc: &MemoryDesc,
    c: usize,
    mode: StatisticsMode,
) -> ChannelStats {
    let count = desc.batch * desc.shape.dhw();
    if count == 0 {
        return ChannelStats::default();
    }
    let n = count as f32;
    let dof = count.saturating_sub(1).max(1) as f32;

    match mode {
        StatisticsMode::SinglePass => {
            let mut sum = KahanSum::new();
            let mut sum_sq = KahanSum::new();
            for x in channel_values(src, desc, c) {
                sum.add(x);
                sum_sq.add(x * x);
            }
            let mean = sum.value() / n;
            let centered = sum_sq.value() - n * mean * mean;
            ChannelStats {
                mean,
                variance: (centered / n).max(0.0),
                unbiased_variance: (centered / dof).max(0.0),
            }
        }
        StatisticsMode::TwoPass => {
            let mean = channel_values(src, desc, c).collect::<KahanSum>().value() / n;
            let centered = channel_values(src, desc, c)
                .map(|x| {
                    let d = x - mean;
                    d * d
                })
                .collect::<KahanSum>()
                .value();
            ChannelStats {
                mean,
                variance: (centered / n).max(0.0),
                unbiased_variance: (centered / dof).max(0.0),
            }
        }
    }
}

/// One exponential-moving-average step: `momentum * running + (1 - momentum) * value`.
#[inline]
pub fn ema(running: f32, value: f32, momentum: f32, one_minus_momentum: f32) -> f32 {
    momentum * running + one_minus_momentum * value
}
