//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use masked_backbone::prelude::*;
//! ```

pub use crate::backbone::{
    build_backbone, Backbone, BackboneConfig, JoinedFeatures, Joiner, Level, LevelKey,
    LevelMetadata, MultiScaleExtractor, PositionEncoder, Stage, Trunk,
};
pub use crate::error::{BackboneError, Result};
pub use crate::models::{ResNet, ResNetVariant};
pub use crate::nn::{FrozenBatchNorm2d, Module, StateDict};
pub use crate::position::PositionEmbeddingSine;
pub use crate::tensor::{DType, Mask, MaskedTensor, NestedTensor, Tensor};
