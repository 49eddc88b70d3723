//! Tensor primitives: dense feature maps, padding masks and the batched
//! input / output pairs the extractor works with.
//!
//! # Layout
//!
//! All image-like tensors are `[B, C, H, W]` row-major; masks are
//! `[B, H, W]` with `true` marking padding.

mod dense;
mod mask;
mod nested;

pub use dense::{DType, Tensor};
pub use mask::Mask;
pub use nested::{MaskedTensor, NestedTensor};
