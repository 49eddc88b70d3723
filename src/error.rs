//! Error types for backbone operations.
//!
//! Every failure in this crate is deterministic: the same inputs and the
//! same parameters always produce the same error, so nothing here is
//! retried internally.

use thiserror::Error;

/// Main error type for backbone construction, extraction and loading.
///
/// # Examples
///
/// ```
/// use masked_backbone::error::BackboneError;
///
/// let err = BackboneError::MissingMask {
///     context: "primary extraction".to_string(),
/// };
/// assert!(err.to_string().contains("validity mask"));
/// ```
#[derive(Error, Debug)]
pub enum BackboneError {
    /// The requested trunk variant cannot serve the configured levels.
    #[error("Unsupported backbone variant {variant}: {reason}")]
    UnsupportedVariant {
        /// Variant name (e.g. "resnet18")
        variant: String,
        /// Why the variant is rejected
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {param} = {value}, expected {constraint}")]
    InvalidConfig {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// An input batch arrived without its padding mask.
    #[error("Missing validity mask on input batch ({context})")]
    MissingMask {
        /// Which entry point observed the violation
        context: String,
    },

    /// Tensor and mask (or parameter) shapes disagree.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape found
        actual: String,
    },

    /// A state dictionary lacks a parameter the module needs.
    #[error("Missing parameter '{0}' in state dict")]
    MissingParameter(String),

    /// A strict load left keys that no module consumed.
    #[error("Unexpected parameters in state dict: {0:?}")]
    UnexpectedParameters(Vec<String>),

    /// SafeTensors encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackboneError {
    /// Create a shape mismatch error with descriptive context.
    #[must_use]
    pub fn shape_mismatch(context: &str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: format!("{context}={expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    /// Create a missing-mask error for the named entry point.
    #[must_use]
    pub fn missing_mask(context: &str) -> Self {
        Self::MissingMask {
            context: context.to_string(),
        }
    }
}

impl From<serde_json::Error> for BackboneError {
    fn from(err: serde_json::Error) -> Self {
        BackboneError::Serialization(err.to_string())
    }
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, BackboneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_variant_display() {
        let err = BackboneError::UnsupportedVariant {
            variant: "resnet18".to_string(),
            reason: "channel counts are not modeled".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("resnet18"));
        assert!(msg.contains("channel counts"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = BackboneError::InvalidConfig {
            param: "hidden_dim".to_string(),
            value: "3".to_string(),
            constraint: "an even number".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("hidden_dim"));
        assert!(msg.contains("even"));
    }

    #[test]
    fn test_missing_mask_helper() {
        let err = BackboneError::missing_mask("support extraction");
        assert!(matches!(err, BackboneError::MissingMask { .. }));
        assert!(err.to_string().contains("support extraction"));
    }

    #[test]
    fn test_shape_mismatch_helper() {
        let err = BackboneError::shape_mismatch("mask", &[1, 4, 4], &[1, 4, 5]);
        let msg = err.to_string();
        assert!(msg.contains("mask=[1, 4, 4]"));
        assert!(msg.contains("[1, 4, 5]"));
    }

    #[test]
    fn test_unexpected_parameters_lists_keys() {
        let err = BackboneError::UnexpectedParameters(vec!["fc.weight".to_string()]);
        assert!(err.to_string().contains("fc.weight"));
    }

    #[test]
    fn test_from_io_error() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BackboneError = io_err.into();
        assert!(matches!(err, BackboneError::Io(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: BackboneError = json_err.into();
        assert!(matches!(err, BackboneError::Serialization(_)));
    }
}
