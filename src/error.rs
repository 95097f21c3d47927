//! Error types for the export pipeline
//!
//! Every stage failure maps to one variant; the pipeline is fail-fast,
//! so the first error aborts the run.

use thiserror::Error;

/// Export pipeline errors
#[derive(Debug, Error)]
pub enum ExportError {
    /// Checkpoint directory or file missing
    #[error("Model not found: {path}")]
    ModelNotFound {
        /// Path that was probed
        path: String,
    },

    /// Malformed checkpoint or serialization failure
    #[error("Invalid format: {reason}")]
    FormatError {
        /// What was malformed
        reason: String,
    },

    /// Tensor shape mismatch during tracing or validation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// What did not line up
        reason: String,
    },

    /// Graph operation the target runtime cannot execute
    #[error("Unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        /// Operation kind
        operation: String,
        /// Why it was rejected
        reason: String,
    },

    /// Weight quantization failure
    #[error("Quantization failed for '{tensor}': {reason}")]
    QuantizeError {
        /// Offending tensor name
        tensor: String,
        /// Why quantization failed
        reason: String,
    },

    /// Filesystem failure
    #[error("I/O error: {message}")]
    IoError {
        /// Underlying error text
        message: String,
    },
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::IoError {
            message: err.to_string(),
        }
    }
}

/// Result type for export operations
pub type Result<T> = std::result::Result<T, ExportError>;
