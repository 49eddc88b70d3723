//! Level composition: pairs every extracted level with its position
//! encoding.

use std::fmt;

use super::config::LevelMetadata;
use super::extractor::{Level, MultiScaleExtractor};
use super::trunk::Trunk;
use crate::error::{BackboneError, Result};
use crate::tensor::{MaskedTensor, NestedTensor, Tensor};

/// Produces a positional encoding for one feature level.
///
/// Implementations must be pure: the output depends only on the level's
/// tensor shape and mask. The result is `[B, D, H, W]` with the level's
/// batch and spatial size; its element type is overwritten by the caller.
pub trait PositionEncoder: Send + Sync {
    /// Encode one level.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn encode(&self, features: &MaskedTensor) -> Result<Tensor>;

    /// Channel count `D` of the output, if fixed.
    fn out_channels(&self) -> Option<usize> {
        None
    }
}

impl<F> PositionEncoder for F
where
    F: Fn(&MaskedTensor) -> Result<Tensor> + Send + Sync,
{
    fn encode(&self, features: &MaskedTensor) -> Result<Tensor> {
        self(features)
    }
}

/// Output of a [`Joiner`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedFeatures {
    /// Levels sorted by ascending key
    pub features: Vec<Level>,
    /// `positions[i]` encodes `features[i]`, in its element type
    pub positions: Vec<Tensor>,
}

impl JoinedFeatures {
    /// Number of levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether no level was produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Iterate `(level, position)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Level, &Tensor)> {
        self.features.iter().zip(self.positions.iter())
    }
}

/// Composes a [`MultiScaleExtractor`] with a [`PositionEncoder`].
pub struct Joiner<T, P> {
    extractor: MultiScaleExtractor<T>,
    encoder: P,
}

impl<T: Trunk, P: PositionEncoder> Joiner<T, P> {
    /// Join an extractor and an encoder.
    pub fn new(extractor: MultiScaleExtractor<T>, encoder: P) -> Self {
        Self { extractor, encoder }
    }

    /// The wrapped extractor.
    pub fn extractor(&self) -> &MultiScaleExtractor<T> {
        &self.extractor
    }

    /// The wrapped encoder.
    pub fn encoder(&self) -> &P {
        &self.encoder
    }

    /// Level metadata of the construction-time mode.
    pub fn metadata(&self) -> &LevelMetadata {
        self.extractor.metadata()
    }

    /// Output stride of each primary level.
    pub fn strides(&self) -> &[usize] {
        self.extractor.metadata().strides()
    }

    /// Channel count of each primary level.
    pub fn num_channels(&self) -> &[usize] {
        self.extractor.metadata().num_channels()
    }

    /// Primary pass: extract, encode, pair.
    ///
    /// # Errors
    ///
    /// Propagates extraction and encoder errors; returns
    /// [`BackboneError::ShapeMismatch`] if an encoding does not cover its
    /// level.
    pub fn forward(&self, input: &NestedTensor) -> Result<JoinedFeatures> {
        let levels = self.extractor.forward(input)?;
        self.compose(levels)
    }

    /// Support-branch pass with an explicit level mode.
    ///
    /// # Errors
    ///
    /// Same as [`Joiner::forward`].
    pub fn forward_support(&self, input: &NestedTensor, multi_level: bool) -> Result<JoinedFeatures> {
        let levels = self.extractor.forward_support(input, multi_level)?;
        self.compose(levels)
    }

    fn compose(&self, mut levels: Vec<Level>) -> Result<JoinedFeatures> {
        levels.sort_by_key(|level| level.key);
        let positions = levels
            .iter()
            .map(|level| self.encode_level(level))
            .collect::<Result<Vec<_>>>()?;
        Ok(JoinedFeatures {
            features: levels,
            positions,
        })
    }

    fn encode_level(&self, level: &Level) -> Result<Tensor> {
        let mut pos = self.encoder.encode(&level.features)?;
        let (b, _, h, w) = level.tensor().dims4();
        let shape = pos.shape();
        if shape.len() != 4 || shape[0] != b || shape[2] != h || shape[3] != w {
            return Err(BackboneError::shape_mismatch(
                "position encoding [B, D, H, W]",
                &[b, self.encoder.out_channels().unwrap_or(0), h, w],
                shape,
            ));
        }
        pos.cast_(level.features.dtype());
        Ok(pos)
    }
}

impl<T: Trunk, P> fmt::Debug for Joiner<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joiner")
            .field("extractor", &self.extractor)
            .finish_non_exhaustive()
    }
}
