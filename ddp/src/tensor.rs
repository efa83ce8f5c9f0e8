use serde::{Deserialize, Serialize};

/// Model parameter exchanged between ranks.
///
/// Flat `f32` storage with a row-major shape, the layout the transports
/// move over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Flattened tensor data
    pub data: Vec<f32>,
    /// Shape of the tensor (e.g., [100] for 1D, [10, 10] for 2D)
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with the given data and shape
    ///
    /// # Panics
    /// Panics if the data length doesn't match the product of the shape dimensions.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape product {}",
            data.len(),
            expected_len
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Create a tensor filled with a constant value
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![value; len],
            shape,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sum of all elements, accumulated in `f64`.
    pub fn checksum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }
}
