//! Neural network building blocks for frozen convolutional trunks.
//!
//! The nn module is organized around the [`Module`] trait:
//!
//! - **Layers**: [`Conv2d`] (with dilation)
//! - **Pooling**: [`MaxPool2d`]
//! - **Activations**: [`ReLU`]
//! - **Normalization**: [`FrozenBatchNorm2d`]
//! - **Containers**: [`Sequential`]
//!
//! Every layer here is inference-only: weights arrive from a checkpoint (or
//! a seeded initializer) and are never updated.
//!
//! # References
//!
//! - Paszke, A., et al. (2019). `PyTorch`: An imperative style, high-performance
//!   deep learning library. `NeurIPS`.
//! - He, K., et al. (2015). Delving deep into rectifiers. ICCV.

mod activation;
mod container;
mod conv;
mod init;
mod module;
mod normalization;
pub mod serialize;

pub use activation::ReLU;
pub use container::Sequential;
pub use conv::{Conv2d, MaxPool2d};
pub use init::kaiming_normal;
pub use module::{state_key, Module};
pub use normalization::{FrozenBatchNorm2d, DEFAULT_EPS, NUM_BATCHES_TRACKED};
pub use serialize::{StateDict, StateLoader};
