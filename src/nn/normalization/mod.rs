//! Frozen normalization for pretrained convolutional trunks.
//!
//! Detection backbones are fine-tuned with small per-device batches, where
//! batch statistics are too noisy to normalize with. The trunk therefore
//! uses batch normalization with *frozen* statistics: the affine transform
//! derived from a checkpoint is applied as-is and never updated.
//!
//! # References
//!
//! - Ioffe, S., & Szegedy, C. (2015). Batch normalization: Accelerating
//!   deep network training. ICML.
//! - Carion, N., et al. (2020). End-to-end object detection with
//!   transformers. ECCV.

use tracing::trace;

use super::init::{constant, zeros};
use super::module::{state_key, Module};
use super::serialize::StateLoader;
use crate::error::{BackboneError, Result};
use crate::tensor::Tensor;

/// Legacy counter key written by trainable batch-norm layers.
pub const NUM_BATCHES_TRACKED: &str = "num_batches_tracked";

/// Default epsilon, matching trainable batch normalization.
pub const DEFAULT_EPS: f32 = 1e-5;

/// 2D batch normalization with fixed statistics and affine parameters.
///
/// Per channel `c`:
///
/// ```text
/// scale[c] = weight[c] / sqrt(running_var[c] + eps)
/// y = x * scale[c] + (bias[c] - running_mean[c] * scale[c])
/// ```
///
/// `eps` is added before the square root, so a channel with zero variance
/// still produces finite output. The four vectors are buffers, not
/// parameters: [`Module::parameters`] is empty and switching to training
/// mode does not change the forward pass.
///
/// `eps` is fixed at construction ([`DEFAULT_EPS`] unless given to
/// [`FrozenBatchNorm2d::from_params`]) and is not persisted: the named state
/// holds only the four per-channel vectors, and loading never changes `eps`.
///
/// # Example
///
/// ```
/// use masked_backbone::nn::{FrozenBatchNorm2d, Module};
/// use masked_backbone::tensor::Tensor;
///
/// let bn = FrozenBatchNorm2d::new(2);
/// let x = Tensor::ones(&[1, 2, 3, 3]);
/// let y = bn.forward(&x);
/// assert_eq!(y.shape(), x.shape());
/// ```
#[derive(Debug, Clone)]
pub struct FrozenBatchNorm2d {
    num_features: usize,
    eps: f32,
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    /// Tracked only so the `Module` mode API round-trips.
    training: bool,
}

impl FrozenBatchNorm2d {
    /// Identity-initialized layer: weight 1, bias 0, mean 0, var 1.
    #[must_use]
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: DEFAULT_EPS,
            weight: constant(&[num_features], 1.0),
            bias: zeros(&[num_features]),
            running_mean: zeros(&[num_features]),
            running_var: constant(&[num_features], 1.0),
            training: false,
        }
    }

    /// Build from explicit per-channel vectors.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::ShapeMismatch`] if the vectors differ in
    /// length and [`BackboneError::InvalidConfig`] if `eps` is not a
    /// positive finite number.
    pub fn from_params(
        weight: &[f32],
        bias: &[f32],
        running_mean: &[f32],
        running_var: &[f32],
        eps: f32,
    ) -> Result<Self> {
        let c = weight.len();
        for (name, v) in [
            ("bias", bias),
            ("running_mean", running_mean),
            ("running_var", running_var),
        ] {
            if v.len() != c {
                return Err(BackboneError::shape_mismatch(name, &[c], &[v.len()]));
            }
        }
        if !(eps.is_finite() && eps > 0.0) {
            return Err(BackboneError::InvalidConfig {
                param: "eps".to_string(),
                value: eps.to_string(),
                constraint: "a positive finite number".to_string(),
            });
        }
        Ok(Self {
            num_features: c,
            eps,
            weight: Tensor::from_slice(weight),
            bias: Tensor::from_slice(bias),
            running_mean: Tensor::from_slice(running_mean),
            running_var: Tensor::from_slice(running_var),
            training: false,
        })
    }

    /// Number of channels.
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Epsilon added to the variance.
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Per-channel scale.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Per-channel shift.
    #[must_use]
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Stored channel means.
    #[must_use]
    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    /// Stored channel variances.
    #[must_use]
    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }

    /// Fold the four vectors into one `(scale, shift)` pair per channel.
    #[must_use]
    pub fn scale_and_shift(&self) -> (Vec<f32>, Vec<f32>) {
        let mut scale = Vec::with_capacity(self.num_features);
        let mut shift = Vec::with_capacity(self.num_features);
        for c in 0..self.num_features {
            let s = self.weight.data()[c] / (self.running_var.data()[c] + self.eps).sqrt();
            scale.push(s);
            shift.push(self.bias.data()[c] - self.running_mean.data()[c] * s);
        }
        (scale, shift)
    }
}

impl Module for FrozenBatchNorm2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        assert!(
            input.ndim() >= 2,
            "FrozenBatchNorm2d expects input [N, C, ...], got {}D",
            input.ndim()
        );
        let shape = input.shape();
        assert_eq!(
            shape[1], self.num_features,
            "Expected {} features, got {}",
            self.num_features, shape[1]
        );

        let inner: usize = shape[2..].iter().product();
        let (scale, shift) = self.scale_and_shift();

        let mut output = Vec::with_capacity(input.numel());
        for (i, chunk) in input.data().chunks(inner.max(1)).enumerate() {
            let c = i % self.num_features;
            output.extend(chunk.iter().map(|&x| x * scale[c] + shift[c]));
        }

        let mut out = Tensor::from_vec(output, shape);
        out.cast_(input.dtype());
        out
    }

    fn visit_state(&self, prefix: &str, visitor: &mut dyn FnMut(String, &Tensor)) {
        visitor(state_key(prefix, "weight"), &self.weight);
        visitor(state_key(prefix, "bias"), &self.bias);
        visitor(state_key(prefix, "running_mean"), &self.running_mean);
        visitor(state_key(prefix, "running_var"), &self.running_var);
    }

    fn load_state(&mut self, loader: &mut StateLoader<'_>, prefix: &str) -> Result<()> {
        let shape = [self.num_features];
        let weight = loader.take(&state_key(prefix, "weight"), &shape)?;
        let bias = loader.take(&state_key(prefix, "bias"), &shape)?;
        let running_mean = loader.take(&state_key(prefix, "running_mean"), &shape)?;
        let running_var = loader.take(&state_key(prefix, "running_var"), &shape)?;

        let legacy = state_key(prefix, NUM_BATCHES_TRACKED);
        if loader.discard(&legacy) {
            trace!(key = %legacy, "discarded batch counter");
        }

        self.weight = weight;
        self.bias = bias;
        self.running_mean = running_mean;
        self.running_var = running_var;
        Ok(())
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn training(&self) -> bool {
        self.training
    }
}


#[cfg(test)]
#[path = "tests_frozen_contract.rs"]
mod tests_frozen_contract;
