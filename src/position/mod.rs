//! Sinusoidal 2D position encoding for masked feature maps.
//!
//! The encoding follows the DETR family: each valid pixel gets a
//! cumulative row and column coordinate (padding does not advance it),
//! optionally normalized to `[0, 2π)` per image, and every coordinate is
//! expanded into interleaved sine/cosine features at geometrically spaced
//! frequencies.
//!
//! # References
//!
//! - Vaswani, A., et al. (2017). Attention is all you need. `NeurIPS`.
//! - Carion, N., et al. (2020). End-to-end object detection with
//!   transformers. ECCV.

use std::f32::consts::PI;

use crate::backbone::PositionEncoder;
use crate::error::{BackboneError, Result};
use crate::tensor::{Mask, MaskedTensor, Tensor};

/// Default frequency base.
pub const DEFAULT_TEMPERATURE: f32 = 10_000.0;

const NORMALIZE_EPS: f32 = 1e-6;

/// Sine/cosine position embedding over the valid region of a mask.
///
/// Output shape is `[B, 2 * num_pos_feats, H, W]`: the first
/// `num_pos_feats` channels encode the row coordinate, the rest the column
/// coordinate. Within each half, even channels carry `sin` and odd channels
/// carry `cos` of the same frequency.
///
/// ```
/// use masked_backbone::position::PositionEmbeddingSine;
/// use masked_backbone::tensor::Mask;
///
/// let encoder = PositionEmbeddingSine::from_hidden_dim(8).unwrap();
/// let pos = encoder.embed(&Mask::all_valid(2, 3, 5));
/// assert_eq!(pos.shape(), &[2, 8, 3, 5]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionEmbeddingSine {
    num_pos_feats: usize,
    temperature: f32,
    normalize: bool,
    scale: f32,
}

impl PositionEmbeddingSine {
    /// Encoder with `num_pos_feats` channels per axis, normalized to `2π`.
    ///
    /// # Panics
    ///
    /// Panics if `num_pos_feats` is zero.
    #[must_use]
    pub fn new(num_pos_feats: usize) -> Self {
        assert!(num_pos_feats > 0, "num_pos_feats must be positive");
        Self {
            num_pos_feats,
            temperature: DEFAULT_TEMPERATURE,
            normalize: true,
            scale: 2.0 * PI,
        }
    }

    /// Encoder whose output width equals a detector's `hidden_dim`.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::InvalidConfig`] unless `hidden_dim` is a
    /// positive even number.
    pub fn from_hidden_dim(hidden_dim: usize) -> Result<Self> {
        if hidden_dim == 0 || hidden_dim % 2 != 0 {
            return Err(BackboneError::InvalidConfig {
                param: "hidden_dim".to_string(),
                value: hidden_dim.to_string(),
                constraint: "a positive even number".to_string(),
            });
        }
        Ok(Self::new(hidden_dim / 2))
    }

    /// Set the frequency base.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Use raw cumulative coordinates instead of normalized ones.
    #[must_use]
    pub fn without_normalize(mut self) -> Self {
        self.normalize = false;
        self
    }

    /// Set the range normalized coordinates are scaled to.
    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Channels per axis.
    #[must_use]
    pub fn num_pos_feats(&self) -> usize {
        self.num_pos_feats
    }

    /// Total output channels.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        2 * self.num_pos_feats
    }

    /// Whether coordinates are normalized per image.
    #[must_use]
    pub fn normalize(&self) -> bool {
        self.normalize
    }

    /// Embed the valid region of `mask` as an `F32` tensor.
    #[must_use]
    pub fn embed(&self, mask: &Mask) -> Tensor {
        let (batch, h, w) = (mask.batch(), mask.spatial_size().0, mask.spatial_size().1);
        let npf = self.num_pos_feats;
        let plane = h * w;
        let inv_freq: Vec<f32> = (0..npf)
            .map(|i| {
                let exponent = (2 * (i / 2)) as f32 / npf as f32;
                1.0 / self.temperature.powf(exponent)
            })
            .collect();

        let mut out = vec![0.0_f32; batch * 2 * npf * plane];
        for b in 0..batch {
            let (y_embed, x_embed) = self.coordinates(mask, b);
            let image = &mut out[b * 2 * npf * plane..(b + 1) * 2 * npf * plane];
            for (axis, embed) in [&y_embed, &x_embed].into_iter().enumerate() {
                for (i, &f) in inv_freq.iter().enumerate() {
                    let channel = &mut image[(axis * npf + i) * plane..(axis * npf + i + 1) * plane];
                    for (dst, &coord) in channel.iter_mut().zip(embed.iter()) {
                        let angle = coord * f;
                        *dst = if i % 2 == 0 { angle.sin() } else { angle.cos() };
                    }
                }
            }
        }
        Tensor::from_vec(out, &[batch, 2 * npf, h, w])
    }

    /// Cumulative row and column coordinates of image `b`, one per pixel.
    fn coordinates(&self, mask: &Mask, b: usize) -> (Vec<f32>, Vec<f32>) {
        let (h, w) = mask.spatial_size();
        let mut y_embed = vec![0.0_f32; h * w];
        let mut x_embed = vec![0.0_f32; h * w];

        for y in 0..h {
            let mut run = 0.0_f32;
            for x in 0..w {
                if !mask.is_padded(b, y, x) {
                    run += 1.0;
                }
                x_embed[y * w + x] = run;
            }
        }
        for x in 0..w {
            let mut run = 0.0_f32;
            for y in 0..h {
                if !mask.is_padded(b, y, x) {
                    run += 1.0;
                }
                y_embed[y * w + x] = run;
            }
        }

        if self.normalize && h > 0 && w > 0 {
            for y in 0..h {
                let row_total = x_embed[y * w + w - 1];
                for x in 0..w {
                    let v = &mut x_embed[y * w + x];
                    *v = (*v - 0.5) / (row_total + NORMALIZE_EPS) * self.scale;
                }
            }
            for x in 0..w {
                let col_total = y_embed[(h - 1) * w + x];
                for y in 0..h {
                    let v = &mut y_embed[y * w + x];
                    *v = (*v - 0.5) / (col_total + NORMALIZE_EPS) * self.scale;
                }
            }
        }
        (y_embed, x_embed)
    }
}

impl PositionEncoder for PositionEmbeddingSine {
    fn encode(&self, features: &MaskedTensor) -> Result<Tensor> {
        Ok(self.embed(features.mask()))
    }

    fn out_channels(&self) -> Option<usize> {
        Some(PositionEmbeddingSine::out_channels(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t: &Tensor, b: usize, c: usize, y: usize, x: usize) -> f32 {
        let (_, ch, h, w) = t.dims4();
        t.data()[((b * ch + c) * h + y) * w + x]
    }

    #[test]
    fn test_output_shape() {
        let enc = PositionEmbeddingSine::new(4);
        let pos = enc.embed(&Mask::all_valid(3, 5, 7));
        assert_eq!(pos.shape(), &[3, 8, 5, 7]);
        assert!(pos.all_finite());
    }

    #[test]
    fn test_from_hidden_dim() {
        assert_eq!(PositionEmbeddingSine::from_hidden_dim(256).expect("even").num_pos_feats(), 128);
        assert!(matches!(
            PositionEmbeddingSine::from_hidden_dim(7),
            Err(BackboneError::InvalidConfig { .. })
        ));
        assert!(PositionEmbeddingSine::from_hidden_dim(0).is_err());
    }

    #[test]
    fn test_single_pixel_normalized_to_pi() {
        // (1 - 0.5) / 1 * 2π = π at frequency 1
        let pos = PositionEmbeddingSine::new(2).embed(&Mask::all_valid(1, 1, 1));
        assert!(at(&pos, 0, 0, 0, 0).abs() < 1e-4);
        assert!((at(&pos, 0, 1, 0, 0) + 1.0).abs() < 1e-4);
        assert!(at(&pos, 0, 2, 0, 0).abs() < 1e-4);
        assert!((at(&pos, 0, 3, 0, 0) + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_unnormalized_coordinates_count_from_one() {
        let enc = PositionEmbeddingSine::new(2).without_normalize();
        let pos = enc.embed(&Mask::all_valid(1, 3, 4));
        for y in 0..3 {
            for x in 0..4 {
                assert!((at(&pos, 0, 0, y, x) - ((y + 1) as f32).sin()).abs() < 1e-6);
                assert!((at(&pos, 0, 1, y, x) - ((y + 1) as f32).cos()).abs() < 1e-6);
                assert!((at(&pos, 0, 2, y, x) - ((x + 1) as f32).sin()).abs() < 1e-6);
                assert!((at(&pos, 0, 3, y, x) - ((x + 1) as f32).cos()).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_padding_does_not_advance_coordinates() {
        let mask = Mask::from_image_sizes(&[(2, 2)], 2, 4);
        let pos = PositionEmbeddingSine::new(2).without_normalize().embed(&mask);
        for x in 2..4 {
            assert_eq!(at(&pos, 0, 2, 0, x), at(&pos, 0, 2, 0, 1));
        }
    }

    #[test]
    fn test_normalization_is_per_image() {
        let mask = Mask::from_image_sizes(&[(4, 4), (2, 2)], 4, 4);
        let pos = PositionEmbeddingSine::new(2).with_scale(1.0).embed(&mask);
        // last valid column: (n - 0.5) / n
        assert!((at(&pos, 0, 2, 0, 3) - 0.875_f32.sin()).abs() < 1e-4);
        assert!((at(&pos, 1, 2, 0, 1) - 0.75_f32.sin()).abs() < 1e-4);
        assert_eq!(at(&pos, 1, 2, 0, 3), at(&pos, 1, 2, 0, 1));
    }

    #[test]
    fn test_frequencies_pair_up() {
        let enc = PositionEmbeddingSine::new(4).without_normalize().with_temperature(16.0);
        let pos = enc.embed(&Mask::all_valid(1, 1, 2));
        // channels 2 and 3 share frequency 16^(-2/4) = 0.25
        let angle = 2.0_f32 * 0.25;
        assert!((at(&pos, 0, 6, 0, 1) - angle.sin()).abs() < 1e-6);
        assert!((at(&pos, 0, 7, 0, 1) - angle.cos()).abs() < 1e-6);
    }

    #[test]
    fn test_encode_ignores_feature_values() {
        let enc = PositionEmbeddingSine::new(4);
        let mask = Mask::from_image_sizes(&[(3, 2)], 3, 3);
        let a = MaskedTensor::new(Tensor::zeros(&[1, 5, 3, 3]), mask.clone()).expect("shapes");
        let b = MaskedTensor::new(Tensor::full(&[1, 5, 3, 3], 9.0), mask).expect("shapes");
        assert_eq!(enc.encode(&a).expect("ok"), enc.encode(&b).expect("ok"));
    }

    #[test]
    fn test_scale_stretches_range() {
        let mask = Mask::all_valid(1, 1, 1);
        let pos = PositionEmbeddingSine::new(2).with_scale(1.0).embed(&mask);
        assert!((at(&pos, 0, 0, 0, 0) - 0.5_f32.sin()).abs() < 1e-4);
    }
}
