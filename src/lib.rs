//! Masked Backbone: multi-scale feature extraction for detection in pure Rust.
//!
//! Masked Backbone runs a frozen convolutional trunk over a padded image
//! batch and returns feature maps at several resolutions, each paired with
//! a padding mask at the same resolution and a positional encoding.
//!
//! # Quick Start
//!
//! ```
//! use masked_backbone::prelude::*;
//!
//! let config = BackboneConfig {
//!     hidden_dim: 16,
//!     seed: Some(42),
//!     ..BackboneConfig::default()
//! };
//! let backbone = build_backbone(&config, None).unwrap();
//!
//! // Two images of different size padded into one batch
//! let batch = NestedTensor::from_images(&[
//!     Tensor::zeros(&[3, 32, 32]),
//!     Tensor::zeros(&[3, 24, 16]),
//! ]).unwrap();
//!
//! let out = backbone.forward(&batch).unwrap();
//! assert_eq!(out.features.len(), 3);
//! assert_eq!(out.positions[0].shape(), &[2, 16, 4, 4]);
//! ```
//!
//! # Modules
//!
//! - [`tensor`]: Dense tensors, padding masks, batched inputs
//! - [`nn`]: Frozen layers (`Conv2d`, `FrozenBatchNorm2d`, ...) and named state
//! - [`models`]: ResNet trunks with `torchvision`-compatible parameter names
//! - [`backbone`]: Multi-scale extractor, level composer, builder
//! - [`position`]: Sinusoidal position encoding
//! - [`serialization`]: SafeTensors checkpoints

pub mod backbone;
pub mod error;
pub mod models;
pub mod nn;
pub mod position;
pub mod prelude;
pub mod serialization;
pub mod tensor;

pub use error::{BackboneError, Result};
pub use tensor::{DType, Mask, MaskedTensor, NestedTensor, Tensor};
