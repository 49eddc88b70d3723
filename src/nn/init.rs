//! Weight initialization.
//!
//! Trunk weights are normally overwritten by a checkpoint; the random
//! initialization only matters for shape-level tests and for running the
//! extractor without pretrained weights. Convolutions follow the ResNet
//! convention of Kaiming-normal in fan-out mode, normalization buffers start
//! at the identity transform.
//!
//! # References
//!
//! - He, K., et al. (2015). Delving deep into rectifiers: Surpassing human-level
//!   performance on `ImageNet` classification. ICCV.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tensor::Tensor;

/// Kaiming normal initialization (He et al., 2015).
///
/// Samples from N(0, std) where std = sqrt(2 / `fan`). Pass the fan-out
/// (`out_channels * kernel_h * kernel_w`) for convolution weights.
///
/// # Arguments
///
/// * `shape` - Shape of the tensor
/// * `fan` - Fan used to scale the distribution
/// * `seed` - Optional random seed for reproducibility
#[must_use]
pub fn kaiming_normal(shape: &[usize], fan: usize, seed: Option<u64>) -> Tensor {
    let std = (2.0 / fan.max(1) as f32).sqrt();
    normal(shape, 0.0, std, seed)
}

/// Normal distribution initialization.
///
/// Samples from N(mean, std).
pub(crate) fn normal(shape: &[usize], mean: f32, std: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    // Box-Muller transform
    let data: Vec<f32> = (0..numel)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            mean + std * z
        })
        .collect();

    Tensor::from_vec(data, shape)
}

/// Constant initialization.
pub(crate) fn constant(shape: &[usize], value: f32) -> Tensor {
    Tensor::full(shape, value)
}

/// Zeros initialization.
pub(crate) fn zeros(shape: &[usize]) -> Tensor {
    constant(shape, 0.0)
}
