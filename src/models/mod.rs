//! Concrete trunk architectures.
//!
//! - [`ResNet`]: residual networks 18/34/50/101/152 with frozen
//!   normalization, `torchvision`-compatible state names

pub mod resnet;

pub use resnet::{BasicBlock, Bottleneck, ResNet, ResNetVariant};
