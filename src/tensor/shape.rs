//! Batch-independent tensor geometry and channel padding

use serde::{Deserialize, Serialize};

/// Number of f32 lanes in one hardware vector. Channel counts are padded to it.
pub const VECTOR_SIZE: usize = 8;

/// Rounds `channels` up to the next multiple of [`VECTOR_SIZE`].
pub fn padded_channels(channels: usize) -> usize {
    channels.div_ceil(VECTOR_SIZE) * VECTOR_SIZE
}

/// Per-sample shape `(C, D, H, W)` of a layer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub c: usize,
    #[serde(default = "one")]
    pub d: usize,
    pub h: usize,
    pub w: usize,
}

fn one() -> usize {
    1
}

impl Shape {
    pub fn new(c: usize, d: usize, h: usize, w: usize) -> Self {
        Self { c, d, h, w }
    }

    /// Two-dimensional feature map (`D = 1`).
    pub fn image(c: usize, h: usize, w: usize) -> Self {
        Self { c, d: 1, h, w }
    }

    /// Flat feature vector (`D = H = W = 1`).
    pub fn vector(c: usize) -> Self {
        Self { c, d: 1, h: 1, w: 1 }
    }

    pub fn padded_c(&self) -> usize {
        padded_channels(self.c)
    }

    /// Spatial extent `D * H * W`.
    pub fn dhw(&self) -> usize {
        self.d * self.h * self.w
    }

    pub fn cdhw(&self) -> usize {
        self.c * self.dhw()
    }

    pub fn padded_cdhw(&self) -> usize {
        self.padded_c() * self.dhw()
    }

    /// Same shape with a different channel count.
    pub fn with_channels(&self, c: usize) -> Self {
        Self { c, ..*self }
    }

    pub fn is_empty(&self) -> bool {
        self.c == 0 || self.dhw() == 0
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.d == 1 {
            write!(f, "{}x{}x{}", self.c, self.h, self.w)
        } else {
            write!(f, "{}x{}x{}x{}", self.c, self.d, self.h, self.w)
        }
    }
}
