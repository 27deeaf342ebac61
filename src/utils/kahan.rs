//! Compensated (Kahan) summation
//!
//! Per-channel statistics add up `batch * D * H * W` terms. Plain f32
//! accumulation loses several digits at that length; tracking the low-order
//! bits that each addition drops keeps the error independent of the count.

/// Running compensated sum.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KahanSum {
    sum: f32,
    compensation: f32,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f32) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.sum
    }
}

impl std::iter::FromIterator<f32> for KahanSum {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        let mut acc = KahanSum::new();
        for v in iter {
            acc.add(v);
        }
        acc
    }
}

/// Compensated sum of an iterator.
pub fn kahan_sum<I: IntoIterator<Item = f32>>(values: I) -> f32 {
    values.into_iter().collect::<KahanSum>().value()
}
