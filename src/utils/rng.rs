//! Deterministic xorshift generator used for weight initialization.

/// Small xorshift PRNG; the same seed always yields the same weights.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e3779b97f4a7c15 } else { seed };
        Self { state }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Uniform in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.next_u32() as f32 / u32::MAX as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Fills `weights` from the Xavier/Glorot uniform distribution
    /// `U(-limit, limit)` with `limit = sqrt(6 / (fan_in + fan_out))`.
    pub fn fill_xavier(&mut self, weights: &mut [f32], fan_in: usize, fan_out: usize) {
        let limit = (6.0f32 / (fan_in + fan_out).max(1) as f32).sqrt();
        for w in weights.iter_mut() {
            *w = self.gen_range_f32(-limit, limit);
        }
    }
}
