//! Activation functions as modules.

use super::module::Module;
use crate::tensor::Tensor;

/// Rectified Linear Unit: max(0, x)
///
/// # Example
///
/// ```
/// use masked_backbone::nn::{Module, ReLU};
/// use masked_backbone::tensor::Tensor;
///
/// let y = ReLU::new().forward(&Tensor::from_slice(&[-1.0, 0.0, 2.0]));
/// assert_eq!(y.data(), &[0.0, 0.0, 2.0]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl ReLU {
    /// Create a new ReLU activation.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.relu()
    }
}
