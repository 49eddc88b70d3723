//! Checkpoint serialization.
//!
//! ## `SafeTensors` Format
//! Industry-standard format compatible with the `HuggingFace` ecosystem and
//! with checkpoints exported from `PyTorch`.
//! ```text
//! [8-byte header: u64 metadata length (little-endian)]
//! [JSON metadata: tensor names, dtypes, shapes, data_offsets]
//! [Raw tensor data: little-endian values]
//! ```

pub mod safetensors;

pub use safetensors::{SafeTensorsMetadata, TensorMetadata};
