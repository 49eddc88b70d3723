//! Multi-scale masked feature extraction.
//!
//! A [`Trunk`] (usually a frozen [`ResNet`](crate::models::ResNet)) runs
//! stage by stage; the [`MultiScaleExtractor`] taps either the last stage or
//! the last three and resizes the input padding mask to each tapped
//! resolution. A [`Joiner`] pairs every level with a positional encoding
//! from a [`PositionEncoder`].
//!
//! ```text
//! images [B,3,H,W] + mask [B,H,W]
//!   -> stem -> layer1 -> layer2* -> layer3* -> layer4*
//!   -> levels (tensor, mask) sorted by key
//!   -> positions[i] = encode(levels[i])
//! ```
//!
//! `*` marks stages tapped in multi-level mode; single-level mode taps only
//! `layer4`.

mod builder;
mod config;
mod extractor;
mod joiner;
mod trunk;

pub use builder::{build_backbone, Backbone};
pub use config::{
    tapped_stages, BackboneConfig, LevelMetadata, MULTI_LEVEL_STAGES, SINGLE_LEVEL_STAGES,
};
pub use extractor::{Level, LevelKey, MultiScaleExtractor};
pub use joiner::{JoinedFeatures, Joiner, PositionEncoder};
pub use trunk::{Stage, Trunk};
