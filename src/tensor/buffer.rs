//! Activation and gradient storage owned by every layer

use super::shape::Shape;

/// Owned activation (`neurons`) and gradient (`neurons_d1`) arrays of one layer.
///
/// Both are sized `batch * PaddedCDHW` so any layout fits. The gradient array
/// may be released between passes when lean gradient buffers are enabled.
#[derive(Debug, Default, Clone)]
pub struct TensorBuffer {
    pub neurons: Vec<f32>,
    pub neurons_d1: Vec<f32>,
    batch_size: usize,
    sample_len: usize,
}

impl TensorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates zeroed storage for `batch_size` samples of `shape`.
    ///
    /// Returns true when storage was actually reallocated. A call with the
    /// same batch size and shape keeps the existing arrays.
    pub fn resize(&mut self, batch_size: usize, shape: &Shape, with_gradient: bool) -> bool {
        let sample_len = shape.padded_cdhw();
        if self.batch_size == batch_size && self.sample_len == sample_len && !self.neurons.is_empty() {
            return false;
        }
        self.batch_size = batch_size;
        self.sample_len = sample_len;
        self.neurons = vec![0.0; self.len()];
        self.neurons_d1 = if with_gradient {
            vec![0.0; self.len()]
        } else {
            Vec::new()
        };
        true
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Allocated length of either array (`batch * PaddedCDHW`).
    pub fn len(&self) -> usize {
        self.batch_size * self.sample_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_gradient(&self) -> bool {
        self.neurons_d1.len() == self.len() && !self.neurons_d1.is_empty()
    }

    /// Makes sure the gradient array exists and is zero.
    pub fn zero_gradient(&mut self) {
        let len = self.len();
        if self.neurons_d1.len() != len {
            self.neurons_d1 = vec![0.0; len];
        } else {
            self.neurons_d1.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Allocates a zeroed gradient array only if none is present.
    ///
    /// Returns true when a new array was allocated.
    pub fn ensure_gradient(&mut self) -> bool {
        if self.has_gradient() {
            return false;
        }
        self.neurons_d1 = vec![0.0; self.len()];
        true
    }

    /// Drops the gradient array.
    pub fn release_gradient(&mut self) {
        self.neurons_d1 = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_pads_channels() {
        let mut buffer = TensorBuffer::new();
        assert!(buffer.resize(4, &Shape::image(3, 2, 2), true));
        assert_eq!(buffer.len(), 4 * 8 * 4);
        assert_eq!(buffer.neurons.len(), buffer.len());
        assert!(buffer.has_gradient());
    }

    #[test]
    fn test_resize_same_batch_keeps_storage() {
        let mut buffer = TensorBuffer::new();
        buffer.resize(2, &Shape::vector(8), true);
        buffer.neurons[0] = 5.0;
        assert!(!buffer.resize(2, &Shape::vector(8), true));
        assert_eq!(buffer.neurons[0], 5.0);
        assert!(buffer.resize(3, &Shape::vector(8), true));
        assert_eq!(buffer.neurons[0], 0.0);
    }

    #[test]
    fn test_lean_gradient_lifecycle() {
        let mut buffer = TensorBuffer::new();
        buffer.resize(1, &Shape::vector(8), false);
        assert!(!buffer.has_gradient());
        assert!(buffer.ensure_gradient());
        assert!(!buffer.ensure_gradient());
        buffer.neurons_d1[3] = 1.0;
        buffer.zero_gradient();
        assert!(buffer.neurons_d1.iter().all(|&v| v == 0.0));
        buffer.release_gradient();
        assert!(!buffer.has_gradient());
    }
}
