//! `SafeTensors` format implementation for checkpoint exchange.
//!
//! Implements the `SafeTensors` format:
//! ```text
//! [8-byte header: u64 metadata length (little-endian)]
//! [JSON metadata: tensor names, dtypes, shapes, data_offsets]
//! [Raw tensor data: little-endian values]
//! ```
//!
//! Readers accept `F32`, `F16`, `BF16` and `I64` (batch counters written by
//! trainable batch normalization); everything is widened to `f32`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{BackboneError, Result};
use crate::tensor::DType;

/// Metadata for a single tensor in `SafeTensors` format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMetadata {
    /// Data type of the tensor (e.g., "F32").
    pub dtype: String,
    /// Shape of the tensor.
    pub shape: Vec<usize>,
    /// Data offsets `[start, end)` in the raw data section.
    pub data_offsets: [usize; 2],
}

/// Complete `SafeTensors` metadata, sorted by tensor name.
pub type SafeTensorsMetadata = BTreeMap<String, TensorMetadata>;

fn invalid(msg: impl Into<String>) -> BackboneError {
    BackboneError::Serialization(msg.into())
}

/// Saves tensors to `SafeTensors` format as F32.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_safetensors<P: AsRef<Path>>(
    path: P,
    tensors: &BTreeMap<String, (Vec<f32>, Vec<usize>)>,
) -> Result<()> {
    save_safetensors_typed(path, tensors, DType::F32)
}

/// Saves tensors to `SafeTensors` format, encoding every tensor as `dtype`.
///
/// Narrow encodings round to nearest even through the `half` crate.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_safetensors_typed<P: AsRef<Path>>(
    path: P,
    tensors: &BTreeMap<String, (Vec<f32>, Vec<usize>)>,
    dtype: DType,
) -> Result<()> {
    fs::write(path, encode_safetensors(tensors, dtype)?)?;
    Ok(())
}

/// Serialize tensors into an in-memory `SafeTensors` image.
///
/// # Errors
///
/// Returns an error if a tensor's data length disagrees with its shape.
pub fn encode_safetensors(
    tensors: &BTreeMap<String, (Vec<f32>, Vec<usize>)>,
    dtype: DType,
) -> Result<Vec<u8>> {
    let mut metadata = SafeTensorsMetadata::new();
    let mut raw_data = Vec::new();

    // BTreeMap iteration is sorted, so the layout is deterministic
    for (name, (data, shape)) in tensors {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(BackboneError::shape_mismatch(name, shape, &[data.len()]));
        }
        let start = raw_data.len();
        encode_values(data, dtype, &mut raw_data);
        metadata.insert(
            name.clone(),
            TensorMetadata {
                dtype: dtype.name().to_string(),
                shape: shape.clone(),
                data_offsets: [start, raw_data.len()],
            },
        );
    }

    let metadata_json = serde_json::to_string(&metadata)?;
    let metadata_bytes = metadata_json.as_bytes();

    let mut output = Vec::with_capacity(8 + metadata_bytes.len() + raw_data.len());
    output.extend_from_slice(&(metadata_bytes.len() as u64).to_le_bytes());
    output.extend_from_slice(metadata_bytes);
    output.extend_from_slice(&raw_data);
    Ok(output)
}

fn encode_values(data: &[f32], dtype: DType, out: &mut Vec<u8>) {
    out.reserve(data.len() * dtype.bytes_per_element());
    match dtype {
        DType::F32 => data.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
        DType::F16 => data
            .iter()
            .for_each(|&v| out.extend_from_slice(&f16::from_f32(v).to_le_bytes())),
        DType::BF16 => data
            .iter()
            .for_each(|&v| out.extend_from_slice(&bf16::from_f32(v).to_le_bytes())),
    }
}

/// Loads a `SafeTensors` file into its metadata and raw data section.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the header is invalid.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<(SafeTensorsMetadata, Vec<u8>)> {
    let bytes = fs::read(path)?;
    decode_safetensors(&bytes)
}

/// Split an in-memory `SafeTensors` image into metadata and raw data.
///
/// # Errors
///
/// Returns an error if the header is truncated or the JSON is malformed.
pub fn decode_safetensors(bytes: &[u8]) -> Result<(SafeTensorsMetadata, Vec<u8>)> {
    let metadata_len = validate_and_read_header(bytes)?;
    let metadata = parse_metadata(bytes, metadata_len)?;
    Ok((metadata, bytes[8 + metadata_len..].to_vec()))
}

fn validate_and_read_header(bytes: &[u8]) -> Result<usize> {
    let Some(header) = bytes.get(0..8) else {
        return Err(invalid(format!(
            "Invalid SafeTensors file: file is {} bytes, need at least 8 bytes for header",
            bytes.len()
        )));
    };
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(header);
    let metadata_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| invalid("Invalid SafeTensors file: metadata length overflows usize"))?;

    if metadata_len == 0 {
        return Err(invalid("Invalid SafeTensors file: metadata length is 0"));
    }
    if metadata_len > bytes.len() - 8 {
        return Err(invalid(format!(
            "Invalid SafeTensors file: metadata length {metadata_len} exceeds file size"
        )));
    }
    Ok(metadata_len)
}

fn parse_metadata(bytes: &[u8], metadata_len: usize) -> Result<SafeTensorsMetadata> {
    let metadata_str = std::str::from_utf8(&bytes[8..8 + metadata_len])
        .map_err(|e| invalid(format!("Metadata is not valid UTF-8: {e}")))?;

    let serde_json::Value::Object(map) = serde_json::from_str::<serde_json::Value>(metadata_str)? else {
        return Err(invalid("SafeTensors header is not a JSON object"));
    };

    let mut metadata = SafeTensorsMetadata::new();
    for (key, value) in map {
        // __metadata__ and other reserved entries carry no tensor
        if key.starts_with("__") {
            continue;
        }
        let tensor_meta = serde_json::from_value::<TensorMetadata>(value)
            .map_err(|e| invalid(format!("Invalid metadata for tensor '{key}': {e}")))?;
        metadata.insert(key, tensor_meta);
    }
    Ok(metadata)
}

/// Extracts a tensor from raw `SafeTensors` data, widening it to F32.
///
/// # Errors
///
/// Returns an error if:
/// - Data offsets are out of range
/// - Data size doesn't match the dtype or shape
/// - The dtype is unsupported
pub fn extract_tensor(raw_data: &[u8], tensor_meta: &TensorMetadata) -> Result<Vec<f32>> {
    let [start, end] = tensor_meta.data_offsets;
    if end > raw_data.len() {
        return Err(invalid(format!(
            "Invalid data offset: end={end} exceeds data size={}",
            raw_data.len()
        )));
    }
    if start > end {
        return Err(invalid(format!("Invalid data offset: start={start} > end={end}")));
    }
    let tensor_bytes = &raw_data[start..end];

    let values = match tensor_meta.dtype.as_str() {
        "F32" => decode_chunks::<4>(tensor_bytes, "F32", f32::from_le_bytes)?,
        "F16" => decode_chunks::<2>(tensor_bytes, "F16", |b| f16::from_le_bytes(b).to_f32())?,
        "BF16" => decode_chunks::<2>(tensor_bytes, "BF16", |b| bf16::from_le_bytes(b).to_f32())?,
        "I64" => decode_chunks::<8>(tensor_bytes, "I64", |b| i64::from_le_bytes(b) as f32)?,
        other => {
            return Err(invalid(format!(
                "Unsupported dtype: {other}. Supported: F32, F16, BF16, I64"
            )))
        }
    };

    let numel: usize = tensor_meta.shape.iter().product();
    if values.len() != numel {
        return Err(invalid(format!(
            "Tensor holds {} values but shape {:?} needs {numel}",
            values.len(),
            tensor_meta.shape
        )));
    }
    Ok(values)
}

fn decode_chunks<const N: usize>(
    bytes: &[u8],
    dtype: &str,
    decode: impl Fn([u8; N]) -> f32,
) -> Result<Vec<f32>> {
    if bytes.len() % N != 0 {
        return Err(invalid(format!(
            "Invalid {dtype} tensor data: size {} is not a multiple of {N} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            decode(buf)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BTreeMap<String, (Vec<f32>, Vec<usize>)> {
        let mut tensors = BTreeMap::new();
        tensors.insert("b".to_string(), (vec![0.5, -1.25], vec![2]));
        tensors.insert("a".to_string(), (vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]));
        tensors
    }

    #[test]
    fn test_encode_layout_sorted_and_contiguous() {
        let bytes = encode_safetensors(&sample(), DType::F32).expect("valid tensors");
        let (metadata, raw) = decode_safetensors(&bytes).expect("well-formed");

        assert_eq!(metadata["a"].data_offsets, [0, 24]);
        assert_eq!(metadata["b"].data_offsets, [24, 32]);
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn test_f32_values_exact() {
        let tensors = sample();
        let bytes = encode_safetensors(&tensors, DType::F32).expect("valid tensors");
        let (metadata, raw) = decode_safetensors(&bytes).expect("well-formed");
        for (name, (data, shape)) in &tensors {
            assert_eq!(&metadata[name].shape, shape);
            assert_eq!(&extract_tensor(&raw, &metadata[name]).expect("F32"), data);
        }
    }

    #[test]
    fn test_f16_encoding_rounds() {
        let mut tensors = BTreeMap::new();
        tensors.insert("x".to_string(), (vec![0.1, 1.0, 65504.0], vec![3]));
        let bytes = encode_safetensors(&tensors, DType::F16).expect("valid tensors");
        let (metadata, raw) = decode_safetensors(&bytes).expect("well-formed");

        assert_eq!(metadata["x"].dtype, "F16");
        assert_eq!(metadata["x"].data_offsets, [0, 6]);
        let values = extract_tensor(&raw, &metadata["x"]).expect("F16");
        assert_eq!(values, vec![f16::from_f32(0.1).to_f32(), 1.0, 65504.0]);
    }

    #[test]
    fn test_bf16_encoding_rounds() {
        let mut tensors = BTreeMap::new();
        tensors.insert("x".to_string(), (vec![1.0 / 3.0], vec![1]));
        let bytes = encode_safetensors(&tensors, DType::BF16).expect("valid tensors");
        let (metadata, raw) = decode_safetensors(&bytes).expect("well-formed");
        let values = extract_tensor(&raw, &metadata["x"]).expect("BF16");
        assert_eq!(values, vec![bf16::from_f32(1.0 / 3.0).to_f32()]);
    }

    #[test]
    fn test_i64_counter_decodes() {
        let meta = TensorMetadata {
            dtype: "I64".to_string(),
            shape: vec![],
            data_offsets: [0, 8],
        };
        let raw = 1234_i64.to_le_bytes();
        assert_eq!(extract_tensor(&raw, &meta).expect("I64"), vec![1234.0]);
    }

    #[test]
    fn test_unsupported_dtype_rejected() {
        let meta = TensorMetadata {
            dtype: "U8".to_string(),
            shape: vec![4],
            data_offsets: [0, 4],
        };
        let err = extract_tensor(&[0; 4], &meta).unwrap_err();
        assert!(err.to_string().contains("Unsupported dtype: U8"));
    }

    #[test]
    fn test_offsets_out_of_range_rejected() {
        let meta = TensorMetadata {
            dtype: "F32".to_string(),
            shape: vec![4],
            data_offsets: [0, 16],
        };
        assert!(extract_tensor(&[0; 8], &meta).is_err());
    }

    #[test]
    fn test_shape_disagreeing_with_bytes_rejected() {
        let meta = TensorMetadata {
            dtype: "F32".to_string(),
            shape: vec![3],
            data_offsets: [0, 8],
        };
        assert!(extract_tensor(&[0; 8], &meta).is_err());
    }

    #[test]
    fn test_encode_rejects_inconsistent_tensor() {
        let mut tensors = BTreeMap::new();
        tensors.insert("bad".to_string(), (vec![1.0; 3], vec![2, 2]));
        assert!(matches!(
            encode_safetensors(&tensors, DType::F32),
            Err(BackboneError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(decode_safetensors(&[1, 2, 3]).is_err());
        let mut bytes = 100_u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let err = decode_safetensors(&bytes).unwrap_err();
        assert!(err.to_string().contains("exceeds file size"));
    }

    #[test]
    fn test_reserved_metadata_entries_skipped() {
        let header = br#"{"__metadata__":{"format":"pt"},"w":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(&2.5_f32.to_le_bytes());

        let (metadata, raw) = decode_safetensors(&bytes).expect("well-formed");
        assert_eq!(metadata.len(), 1);
        assert_eq!(extract_tensor(&raw, &metadata["w"]).expect("F32"), vec![2.5]);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("weights.safetensors");
        save_safetensors(&path, &sample()).expect("write");

        let (metadata, raw) = load_safetensors(&path).expect("read");
        assert_eq!(extract_tensor(&raw, &metadata["b"]).expect("F32"), vec![0.5, -1.25]);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = load_safetensors(dir.path().join("absent.safetensors")).unwrap_err();
        assert!(matches!(err, BackboneError::Io(_)));
    }
}
