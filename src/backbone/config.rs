//! Backbone configuration and static level metadata.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::trunk::{Stage, Trunk};
use crate::error::{BackboneError, Result};
use crate::models::ResNetVariant;

/// Stages tapped in multi-level mode, shallowest first.
pub const MULTI_LEVEL_STAGES: [Stage; 3] = [Stage::Layer2, Stage::Layer3, Stage::Layer4];

/// Stage tapped in single-level mode.
pub const SINGLE_LEVEL_STAGES: [Stage; 1] = [Stage::Layer4];

/// Channel counts the level metadata is defined for, per tapped stage.
const MODELED_CHANNELS: [usize; 3] = [512, 1024, 2048];

/// Stages tapped for the given mode, in depth order.
#[must_use]
pub fn tapped_stages(multi_level: bool) -> &'static [Stage] {
    if multi_level {
        &MULTI_LEVEL_STAGES
    } else {
        &SINGLE_LEVEL_STAGES
    }
}

/// User-facing backbone configuration.
///
/// Deserializes from partial JSON; missing fields take their defaults.
///
/// ```
/// use masked_backbone::backbone::BackboneConfig;
///
/// let config = BackboneConfig::from_json(r#"{"dilation": true}"#).unwrap();
/// assert_eq!(config.hidden_dim, 256);
/// assert!(config.multi_level());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Trunk depth
    pub backbone: ResNetVariant,
    /// Replace the stride of the last stage with dilation
    pub dilation: bool,
    /// Feature levels the detector consumes; more than one taps three stages
    pub num_feature_levels: usize,
    /// Width of the detector; positional encodings have this many channels
    pub hidden_dim: usize,
    /// Seed for the random initialization of the trunk
    pub seed: Option<u64>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            backbone: ResNetVariant::ResNet50,
            dilation: false,
            num_feature_levels: 4,
            hidden_dim: 256,
            seed: None,
        }
    }
}

impl BackboneConfig {
    /// Whether the extractor taps intermediate stages: exactly when more
    /// than one feature level is requested.
    #[must_use]
    pub fn multi_level(&self) -> bool {
        self.num_feature_levels > 1
    }

    /// Check every field for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::UnsupportedVariant`] for basic-block trunks
    /// and [`BackboneError::InvalidConfig`] for out-of-range numbers.
    pub fn validate(&self) -> Result<()> {
        if self.num_feature_levels == 0 {
            return Err(BackboneError::InvalidConfig {
                param: "num_feature_levels".to_string(),
                value: "0".to_string(),
                constraint: "at least 1".to_string(),
            });
        }
        if self.hidden_dim == 0 || self.hidden_dim % 2 != 0 {
            return Err(BackboneError::InvalidConfig {
                param: "hidden_dim".to_string(),
                value: self.hidden_dim.to_string(),
                constraint: "a positive even number".to_string(),
            });
        }
        LevelMetadata::for_variant(self.backbone, self.dilation, self.multi_level()).map(|_| ())
    }

    /// Parse from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::Serialization`] on malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error or [`BackboneError::Serialization`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Per-level stride and channel count, index aligned with the produced
/// feature levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelMetadata {
    strides: Vec<usize>,
    num_channels: Vec<usize>,
}

impl LevelMetadata {
    /// Static metadata for a ResNet variant.
    ///
    /// | mode   | strides              | channels             |
    /// |--------|----------------------|----------------------|
    /// | multi  | `[8, 16, 32]`        | `[512, 1024, 2048]`  |
    /// | single | `[32]`               | `[2048]`             |
    ///
    /// With `dilation` the last stride is halved.
    ///
    /// # Errors
    ///
    /// ResNet-18 and ResNet-34 are rejected: their stage widths differ from
    /// the modeled channel counts.
    pub fn for_variant(variant: ResNetVariant, dilation: bool, multi_level: bool) -> Result<Self> {
        let channels = variant.stage_channels();
        Self::from_stage_channels(&variant.to_string(), dilation, multi_level, |stage| {
            channels[stage.index()]
        })
    }

    /// Metadata for an arbitrary trunk, checked against the modeled
    /// channel counts.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::UnsupportedVariant`] if a tapped stage emits
    /// an unexpected number of channels.
    pub fn from_trunk<T: Trunk + ?Sized>(trunk: &T, multi_level: bool) -> Result<Self> {
        Self::from_stage_channels(
            &trunk.name(),
            trunk.dilated_last_stage(),
            multi_level,
            |stage| trunk.out_channels(stage),
        )
    }

    fn from_stage_channels(
        name: &str,
        dilation: bool,
        multi_level: bool,
        channels_of: impl Fn(Stage) -> usize,
    ) -> Result<Self> {
        let actual: Vec<usize> = MULTI_LEVEL_STAGES.iter().map(|&s| channels_of(s)).collect();
        if actual != MODELED_CHANNELS {
            return Err(BackboneError::UnsupportedVariant {
                variant: name.to_string(),
                reason: format!(
                    "stages layer2..layer4 emit {actual:?} channels, only {MODELED_CHANNELS:?} is supported"
                ),
            });
        }
        let stages = tapped_stages(multi_level);
        Ok(Self {
            strides: stages.iter().map(|s| s.stride(dilation)).collect(),
            num_channels: stages.iter().map(|&s| channels_of(s)).collect(),
        })
    }

    /// Output stride of each level.
    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Channel count of each level.
    #[must_use]
    pub fn num_channels(&self) -> &[usize] {
        &self.num_channels
    }

    /// Number of levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strides.len()
    }

    /// Whether there are no levels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strides.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_level_metadata() {
        let meta = LevelMetadata::for_variant(ResNetVariant::ResNet50, false, true).expect("supported");
        assert_eq!(meta.strides(), &[8, 16, 32]);
        assert_eq!(meta.num_channels(), &[512, 1024, 2048]);
        assert_eq!(meta.len(), 3);
    }

    #[test]
    fn test_multi_level_dilated_metadata() {
        let meta = LevelMetadata::for_variant(ResNetVariant::ResNet101, true, true).expect("supported");
        assert_eq!(meta.strides(), &[8, 16, 16]);
        assert_eq!(meta.num_channels(), &[512, 1024, 2048]);
    }

    #[test]
    fn test_single_level_metadata() {
        let meta = LevelMetadata::for_variant(ResNetVariant::ResNet152, false, false).expect("supported");
        assert_eq!(meta.strides(), &[32]);
        assert_eq!(meta.num_channels(), &[2048]);

        let dilated = LevelMetadata::for_variant(ResNetVariant::ResNet50, true, false).expect("supported");
        assert_eq!(dilated.strides(), &[16]);
    }

    #[test]
    fn test_basic_block_variants_rejected() {
        for variant in [ResNetVariant::ResNet18, ResNetVariant::ResNet34] {
            for multi in [true, false] {
                let err = LevelMetadata::for_variant(variant, false, multi).unwrap_err();
                assert!(matches!(err, BackboneError::UnsupportedVariant { .. }));
                assert!(err.to_string().contains(variant.name()));
            }
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = BackboneConfig::default();
        assert_eq!(config.backbone, ResNetVariant::ResNet50);
        assert!(!config.dilation);
        assert_eq!(config.num_feature_levels, 4);
        assert_eq!(config.hidden_dim, 256);
        assert!(config.multi_level());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_level_mode_follows_level_count() {
        let mut config = BackboneConfig {
            num_feature_levels: 1,
            ..BackboneConfig::default()
        };
        assert!(!config.multi_level());
        config.num_feature_levels = 2;
        assert!(config.multi_level());

        // extra keys are ignored and never switch the mode
        let legacy = BackboneConfig::from_json(r#"{"num_feature_levels": 1, "masks": true}"#)
            .expect("unknown keys are ignored");
        assert!(!legacy.multi_level());
    }

    #[test]
    fn test_config_partial_json() {
        let config = BackboneConfig::from_json(r#"{"backbone": "resnet101", "seed": 9}"#)
            .expect("valid json");
        assert_eq!(config.backbone, ResNetVariant::ResNet101);
        assert_eq!(config.seed, Some(9));
        assert_eq!(config.num_feature_levels, 4);
    }

    #[test]
    fn test_config_rejects_unknown_variant_name() {
        assert!(matches!(
            BackboneConfig::from_json(r#"{"backbone": "vgg16"}"#),
            Err(BackboneError::Serialization(_))
        ));
    }

    #[test]
    fn test_config_validate_errors() {
        let bad_levels = BackboneConfig {
            num_feature_levels: 0,
            ..BackboneConfig::default()
        };
        assert!(matches!(bad_levels.validate(), Err(BackboneError::InvalidConfig { .. })));

        let odd_dim = BackboneConfig {
            hidden_dim: 255,
            ..BackboneConfig::default()
        };
        assert!(matches!(odd_dim.validate(), Err(BackboneError::InvalidConfig { .. })));

        let small = BackboneConfig {
            backbone: ResNetVariant::ResNet18,
            ..BackboneConfig::default()
        };
        assert!(matches!(small.validate(), Err(BackboneError::UnsupportedVariant { .. })));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("backbone.json");
        std::fs::write(&path, r#"{"dilation": true, "hidden_dim": 128}"#).expect("write");
        let config = BackboneConfig::from_file(&path).expect("read");
        assert!(config.dilation);
        assert_eq!(config.hidden_dim, 128);
    }

    #[test]
    fn test_tapped_stages() {
        assert_eq!(tapped_stages(true), &[Stage::Layer2, Stage::Layer3, Stage::Layer4]);
        assert_eq!(tapped_stages(false), &[Stage::Layer4]);
    }
}
