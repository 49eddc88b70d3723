//! Multi-scale feature extraction with padding-mask propagation.

use std::fmt;

use tracing::trace;

use super::config::{tapped_stages, LevelMetadata};
use super::trunk::{Stage, Trunk};
use crate::error::{BackboneError, Result};
use crate::tensor::{Mask, MaskedTensor, NestedTensor, Tensor};

/// Ordinal level identifier; `0` is the shallowest tapped stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelKey(pub usize);

impl fmt::Display for LevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One resolution level: a feature map with its resized padding mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    /// Position among the tapped stages
    pub key: LevelKey,
    /// Feature map and mask
    pub features: MaskedTensor,
}

impl Level {
    /// Feature tensor `[B, C, H, W]`.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        self.features.tensor()
    }

    /// Padding mask `[B, H, W]`.
    #[must_use]
    pub fn mask(&self) -> &Mask {
        self.features.mask()
    }
}

/// Runs a frozen trunk and taps intermediate stages.
///
/// In multi-level mode `layer2`, `layer3` and `layer4` are tapped as levels
/// `0`, `1` and `2`; otherwise only `layer4` is tapped as level `0`. After
/// each tapped stage the input mask is resized, by nearest-neighbour
/// sampling, to that stage's spatial size.
///
/// The extractor holds no mutable state, so a shared reference can serve
/// concurrent callers.
pub struct MultiScaleExtractor<T> {
    trunk: T,
    multi_level: bool,
    metadata: LevelMetadata,
}

impl<T: Trunk> MultiScaleExtractor<T> {
    /// Wrap `trunk`, fixing the level mode.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::UnsupportedVariant`] if the trunk's stage
    /// widths are not the modeled `[512, 1024, 2048]`.
    pub fn new(trunk: T, multi_level: bool) -> Result<Self> {
        let metadata = LevelMetadata::from_trunk(&trunk, multi_level)?;
        Ok(Self {
            trunk,
            multi_level,
            metadata,
        })
    }

    /// The wrapped trunk.
    pub fn trunk(&self) -> &T {
        &self.trunk
    }

    /// Level mode fixed at construction.
    pub fn multi_level(&self) -> bool {
        self.multi_level
    }

    /// Strides and channel counts of the construction-time mode.
    pub fn metadata(&self) -> &LevelMetadata {
        &self.metadata
    }

    /// Primary extraction in the construction-time mode.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::MissingMask`] if the batch has no mask and
    /// [`BackboneError::ShapeMismatch`] if the images do not have the
    /// trunk's input channel count or the mask does not cover the batch.
    pub fn forward(&self, input: &NestedTensor) -> Result<Vec<Level>> {
        self.extract(input, self.multi_level, "primary extraction")
    }

    /// Support-branch extraction; `multi_level` overrides the
    /// construction-time mode for this call only.
    ///
    /// # Errors
    ///
    /// Same as [`MultiScaleExtractor::forward`].
    pub fn forward_support(&self, input: &NestedTensor, multi_level: bool) -> Result<Vec<Level>> {
        self.extract(input, multi_level, "support extraction")
    }

    fn extract(&self, input: &NestedTensor, multi_level: bool, context: &str) -> Result<Vec<Level>> {
        let mask = input.require_mask(context)?;
        let images = &input.tensors;
        let (b, h, w) = (mask.batch(), mask.spatial_size().0, mask.spatial_size().1);
        let channels = self.trunk.in_channels();
        if images.ndim() != 4 || images.shape()[1] != channels {
            return Err(BackboneError::shape_mismatch(
                "images [B, C, H, W]",
                &[b, channels, h, w],
                images.shape(),
            ));
        }
        let (ib, _, ih, iw) = images.dims4();
        if [ib, ih, iw] != [b, h, w] {
            return Err(BackboneError::shape_mismatch("input mask", &[ib, ih, iw], mask.shape()));
        }

        let taps = tapped_stages(multi_level);
        let deepest = taps.last().copied().unwrap_or(Stage::Layer4);
        let mut levels = Vec::with_capacity(taps.len());
        let mut x = self.trunk.run_stage(Stage::Stem, images);

        for stage in Stage::ALL.into_iter().skip(1) {
            if stage > deepest {
                break;
            }
            x = self.trunk.run_stage(stage, &x);
            if let Some(key) = taps.iter().position(|&s| s == stage) {
                let features = MaskedTensor::with_resized_mask(x.clone(), mask)?;
                trace!(
                    context,
                    stage = %stage,
                    key,
                    shape = ?features.tensor().shape(),
                    padded = features.mask().count_padded(),
                    "tapped level"
                );
                levels.push(Level {
                    key: LevelKey(key),
                    features,
                });
            }
        }
        Ok(levels)
    }
}

impl<T: Trunk> fmt::Debug for MultiScaleExtractor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiScaleExtractor")
            .field("trunk", &self.trunk.name())
            .field("multi_level", &self.multi_level)
            .field("metadata", &self.metadata)
            .finish()
    }
}
