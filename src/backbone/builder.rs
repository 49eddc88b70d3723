//! One-call construction of the full backbone from a configuration.

use tracing::debug;

use super::config::BackboneConfig;
use super::extractor::MultiScaleExtractor;
use super::joiner::Joiner;
use crate::error::Result;
use crate::models::ResNet;
use crate::nn::StateDict;
use crate::position::PositionEmbeddingSine;

/// The backbone [`build_backbone`] returns.
pub type Backbone = Joiner<ResNet, PositionEmbeddingSine>;

/// Build a frozen ResNet trunk, wrap it in an extractor and join it with a
/// sine position encoder of width `hidden_dim`.
///
/// `pretrained`, when given, is loaded into the trunk before freezing;
/// classifier keys are ignored, every other key must match.
///
/// # Errors
///
/// Returns configuration errors from [`BackboneConfig::validate`] and
/// loading errors from [`ResNet::load_pretrained`].
///
/// # Example
///
/// ```no_run
/// use masked_backbone::backbone::{build_backbone, BackboneConfig};
/// use masked_backbone::nn::serialize::load_state_dict_file;
///
/// let weights = load_state_dict_file("resnet50.safetensors")?;
/// let backbone = build_backbone(&BackboneConfig::default(), Some(&weights))?;
/// assert_eq!(backbone.strides(), &[8, 16, 32]);
/// # Ok::<(), masked_backbone::error::BackboneError>(())
/// ```
pub fn build_backbone(config: &BackboneConfig, pretrained: Option<&StateDict>) -> Result<Backbone> {
    config.validate()?;

    let mut trunk = ResNet::new(config.backbone, config.dilation, config.seed)?;
    if let Some(state) = pretrained {
        trunk.load_pretrained(state)?;
    }
    trunk.freeze();

    let extractor = MultiScaleExtractor::new(trunk, config.multi_level())?;
    let encoder = PositionEmbeddingSine::from_hidden_dim(config.hidden_dim)?;
    let backbone = Joiner::new(extractor, encoder);

    debug!(
        variant = %config.backbone,
        dilation = config.dilation,
        pretrained = pretrained.is_some(),
        strides = ?backbone.strides(),
        num_channels = ?backbone.num_channels(),
        "built backbone"
    );
    Ok(backbone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackboneError;
    use crate::models::ResNetVariant;
    use crate::nn::Module;

    #[test]
    fn test_build_rejects_basic_block_variants() {
        let config = BackboneConfig {
            backbone: ResNetVariant::ResNet34,
            ..BackboneConfig::default()
        };
        assert!(matches!(
            build_backbone(&config, None),
            Err(BackboneError::UnsupportedVariant { .. })
        ));
    }

    #[test]
    fn test_build_metadata_follows_config() {
        let single = BackboneConfig {
            num_feature_levels: 1,
            dilation: true,
            hidden_dim: 32,
            seed: Some(0),
            ..BackboneConfig::default()
        };
        let backbone = build_backbone(&single, None).expect("valid config");
        assert_eq!(backbone.strides(), &[16]);
        assert_eq!(backbone.num_channels(), &[2048]);
        assert_eq!(backbone.encoder().num_pos_feats(), 16);
        assert!(!backbone.extractor().multi_level());
    }

    #[test]
    fn test_built_trunk_is_frozen() {
        let config = BackboneConfig {
            seed: Some(5),
            ..BackboneConfig::default()
        };
        let backbone = build_backbone(&config, None).expect("valid config");
        let trunk = backbone.extractor().trunk();
        assert!(!trunk.parameters().is_empty());
        assert!(trunk.parameters().iter().all(|p| !p.requires_grad_enabled()));
    }
}
