//! Batched images with padding masks.

use super::{DType, Mask, Tensor};
use crate::error::{BackboneError, Result};

/// Extractor input: a padded image batch and its (optional) padding mask.
///
/// The mask is optional at the type level only so that callers assembling
/// batches by hand can forget it; every extraction entry point rejects a
/// batch without one.
#[derive(Debug, Clone)]
pub struct NestedTensor {
    /// Images, `[B, C, H, W]`
    pub tensors: Tensor,
    /// Padding mask, `[B, H, W]`, `true` = padding
    pub mask: Option<Mask>,
}

impl NestedTensor {
    /// Pair a batch with its mask.
    #[must_use]
    pub fn new(tensors: Tensor, mask: Option<Mask>) -> Self {
        Self { tensors, mask }
    }

    /// Pad a list of `[C, h_i, w_i]` images into one `[B, C, H_max, W_max]`
    /// batch, placing each image at the top-left corner, and build the
    /// matching padding mask.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty, an image is not 3D, or the
    /// channel counts differ.
    pub fn from_images(images: &[Tensor]) -> Result<Self> {
        let first = images.first().ok_or_else(|| BackboneError::InvalidConfig {
            param: "images".to_string(),
            value: "[]".to_string(),
            constraint: "at least one image".to_string(),
        })?;
        if first.ndim() != 3 {
            return Err(BackboneError::shape_mismatch("image [C, H, W]", &[3], first.shape()));
        }
        let channels = first.shape()[0];
        let mut sizes = Vec::with_capacity(images.len());
        for image in images {
            if image.ndim() != 3 || image.shape()[0] != channels {
                return Err(BackboneError::shape_mismatch(
                    "image [C, H, W]",
                    &[channels],
                    image.shape(),
                ));
            }
            sizes.push((image.shape()[1], image.shape()[2]));
        }
        let height = sizes.iter().map(|s| s.0).max().unwrap_or(0);
        let width = sizes.iter().map(|s| s.1).max().unwrap_or(0);

        let mut data = vec![0.0; images.len() * channels * height * width];
        for (b, image) in images.iter().enumerate() {
            let (h, w) = (image.shape()[1], image.shape()[2]);
            for c in 0..channels {
                for y in 0..h {
                    let dst = ((b * channels + c) * height + y) * width;
                    let src = (c * h + y) * w;
                    data[dst..dst + w].copy_from_slice(&image.data()[src..src + w]);
                }
            }
        }
        let mut tensors = Tensor::from_vec(data, &[images.len(), channels, height, width]);
        tensors.cast_(first.dtype());
        let mask = Mask::from_image_sizes(&sizes, height, width);
        Ok(Self::new(tensors, Some(mask)))
    }

    /// Borrow the mask, or fail with a precondition error naming `context`.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::MissingMask`] when the batch has no mask.
    pub fn require_mask(&self, context: &str) -> Result<&Mask> {
        self.mask
            .as_ref()
            .ok_or_else(|| BackboneError::missing_mask(context))
    }
}

/// A feature map paired with a mask at the same spatial resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedTensor {
    tensor: Tensor,
    mask: Mask,
}

impl MaskedTensor {
    /// Pair a `[B, C, H, W]` tensor with a `[B, H, W]` mask.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::ShapeMismatch`] if the tensor is not 4D or
    /// the batch or spatial sizes disagree.
    pub fn new(tensor: Tensor, mask: Mask) -> Result<Self> {
        if tensor.ndim() != 4 {
            return Err(BackboneError::shape_mismatch(
                "feature map [B, C, H, W]",
                &[mask.batch(), 0, mask.spatial_size().0, mask.spatial_size().1],
                tensor.shape(),
            ));
        }
        let (b, _, h, w) = tensor.dims4();
        if [b, h, w] != mask.shape() {
            return Err(BackboneError::shape_mismatch(
                "mask [B, H, W]",
                &[b, h, w],
                mask.shape(),
            ));
        }
        Ok(Self { tensor, mask })
    }

    /// Pair a tensor with `mask` resized to the tensor's own resolution.
    ///
    /// Resizing relative to the activation keeps the pair consistent by
    /// construction.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::ShapeMismatch`] if the batch sizes differ.
    pub fn with_resized_mask(tensor: Tensor, mask: &Mask) -> Result<Self> {
        if tensor.ndim() != 4 || tensor.shape()[0] != mask.batch() {
            return Err(BackboneError::shape_mismatch(
                "feature map batch",
                &[mask.batch()],
                tensor.shape(),
            ));
        }
        let (h, w) = tensor.spatial_size();
        let resized = mask.interpolate_nearest(h, w);
        Self::new(tensor, resized)
    }

    /// The feature map.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// The padding mask.
    #[must_use]
    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Element type of the feature map.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_images_pads_and_masks() {
        let a = Tensor::ones(&[3, 2, 3]);
        let b = Tensor::full(&[3, 4, 2], 2.0);
        let nested = NestedTensor::from_images(&[a, b]).expect("same channel count");

        assert_eq!(nested.tensors.shape(), &[2, 3, 4, 3]);
        let mask = nested.mask.as_ref().expect("mask built");
        assert_eq!(mask.shape(), &[2, 4, 3]);
        assert!(!mask.is_padded(0, 1, 2));
        assert!(mask.is_padded(0, 2, 0));
        assert!(mask.is_padded(1, 0, 2));

        // padding is zero-filled, content copied
        let data = nested.tensors.data();
        assert_eq!(data[0], 1.0);
        assert_eq!(data[2 * 3 * 4 * 3 / 2], 2.0);
        assert_eq!(data[3 * 3 - 1], 0.0);
    }

    #[test]
    fn test_from_images_rejects_channel_mismatch() {
        let a = Tensor::ones(&[3, 2, 2]);
        let b = Tensor::ones(&[1, 2, 2]);
        assert!(matches!(
            NestedTensor::from_images(&[a, b]),
            Err(BackboneError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_images_rejects_empty() {
        assert!(NestedTensor::from_images(&[]).is_err());
    }

    #[test]
    fn test_require_mask() {
        let without = NestedTensor::new(Tensor::zeros(&[1, 3, 2, 2]), None);
        let err = without.require_mask("primary extraction").unwrap_err();
        assert!(matches!(err, BackboneError::MissingMask { .. }));

        let with = NestedTensor::new(Tensor::zeros(&[1, 3, 2, 2]), Some(Mask::all_valid(1, 2, 2)));
        assert!(with.require_mask("primary extraction").is_ok());
    }

    #[test]
    fn test_masked_tensor_rejects_resolution_mismatch() {
        let err = MaskedTensor::new(Tensor::zeros(&[1, 4, 3, 3]), Mask::all_valid(1, 3, 4))
            .unwrap_err();
        assert!(err.to_string().contains("mask [B, H, W]"));
    }

    #[test]
    fn test_masked_tensor_rejects_non_4d() {
        assert!(MaskedTensor::new(Tensor::zeros(&[4, 3, 3]), Mask::all_valid(1, 3, 3)).is_err());
    }

    #[test]
    fn test_with_resized_mask_follows_tensor() {
        let mask = Mask::from_image_sizes(&[(8, 4)], 8, 8);
        let pair = MaskedTensor::with_resized_mask(Tensor::zeros(&[1, 2, 2, 2]), &mask)
            .expect("batch sizes agree");
        assert_eq!(pair.mask().shape(), &[1, 2, 2]);
        assert_eq!(pair.mask().data(), &[false, true, false, true]);
    }

    #[test]
    fn test_with_resized_mask_rejects_batch_mismatch() {
        let mask = Mask::all_valid(2, 4, 4);
        assert!(MaskedTensor::with_resized_mask(Tensor::zeros(&[1, 2, 2, 2]), &mask).is_err());
    }
}
