//! Safetensors parser
//!
//! Pure Rust reader for the safetensors checkpoint format used by
//! `HuggingFace` model snapshots.
//!
//! Format specification: <https://github.com/huggingface/safetensors>
//!
//! ## Format Overview
//!
//! ```text
//! Safetensors := HEADER METADATA TENSOR_DATA
//!
//! HEADER := {
//!   metadata_len: u64 (little-endian)
//! }
//!
//! METADATA := JSON {
//!   "tensor_name": {
//!     "dtype": "F32" | "F16" | ...,
//!     "shape": [dim1, dim2, ...],
//!     "data_offsets": [start, end]
//!   },
//!   ...
//! }
//! ```
//!
//! Only the dtypes that occur in encoder checkpoints are decoded (F32 and
//! F16); anything else is a fatal load error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::tensor::Tensor;

/// Safetensors data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SafetensorsDtype {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// Brain float 16
    BF16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 8-bit unsigned integer
    U8,
    /// Boolean
    Bool,
}

/// JSON tensor metadata (internal)
#[derive(Debug, Deserialize)]
struct TensorMetadata {
    dtype: SafetensorsDtype,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Tensor metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Tensor name
    pub name: String,
    /// Data type
    pub dtype: SafetensorsDtype,
    /// Shape (dimensions)
    pub shape: Vec<usize>,
    /// Data offsets into the payload section `[start, end)`
    pub data_offsets: [usize; 2],
}

/// Parsed safetensors checkpoint
#[derive(Debug, Clone)]
pub struct SafetensorsFile {
    /// Tensor metadata by name
    tensors: HashMap<String, TensorInfo>,
    /// Raw payload bytes (everything after the JSON metadata)
    data: Vec<u8>,
}

impl SafetensorsFile {
    /// Parse a safetensors file from bytes
    ///
    /// # Errors
    ///
    /// Returns error if the header is truncated, the JSON metadata is
    /// malformed, or any data offsets fall outside the payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(ExportError::FormatError {
                reason: format!("Safetensors file too short: {} bytes", bytes.len()),
            });
        }

        let metadata_len = u64::from_le_bytes(
            bytes[0..8]
                .try_into()
                .map_err(|_| ExportError::FormatError {
                    reason: "Failed to read safetensors header".to_string(),
                })?,
        );
        let metadata_len = usize::try_from(metadata_len).map_err(|_| ExportError::FormatError {
            reason: format!("Metadata length {metadata_len} exceeds addressable size"),
        })?;

        let data_start = 8 + metadata_len;
        if bytes.len() < data_start {
            return Err(ExportError::FormatError {
                reason: format!(
                    "Metadata length {metadata_len} exceeds file size {}",
                    bytes.len()
                ),
            });
        }

        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(
            &bytes[8..data_start],
        )
        .map_err(|e| ExportError::FormatError {
            reason: format!("Invalid safetensors metadata: {e}"),
        })?;

        let data = bytes[data_start..].to_vec();

        let mut tensors = HashMap::with_capacity(raw.len());
        for (name, value) in raw {
            // "__metadata__" carries free-form strings, not a tensor.
            if name == "__metadata__" {
                continue;
            }

            let meta: TensorMetadata =
                serde_json::from_value(value).map_err(|e| ExportError::FormatError {
                    reason: format!("Invalid metadata for tensor '{name}': {e}"),
                })?;

            if meta.data_offsets[0] > meta.data_offsets[1] || meta.data_offsets[1] > data.len() {
                return Err(ExportError::FormatError {
                    reason: format!(
                        "Tensor '{name}' offsets {:?} exceed payload size {}",
                        meta.data_offsets,
                        data.len()
                    ),
                });
            }

            tensors.insert(
                name.clone(),
                TensorInfo {
                    name,
                    dtype: meta.dtype,
                    shape: meta.shape,
                    data_offsets: meta.data_offsets,
                },
            );
        }

        Ok(Self { tensors, data })
    }

    /// Load and parse a safetensors file from disk
    ///
    /// # Errors
    ///
    /// Returns `ModelNotFound` if the file does not exist, otherwise the
    /// same errors as [`SafetensorsFile::from_bytes`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ExportError::ModelNotFound {
                path: path.display().to_string(),
            });
        }
        let bytes = fs::read(path).map_err(|e| ExportError::IoError {
            message: format!("Failed to read '{}': {e}", path.display()),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Whether a tensor with this name is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Names of all tensors in the checkpoint
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tensors.keys().map(String::as_str).collect()
    }

    /// Fetch a tensor by name, decoded to f32
    ///
    /// F16 payloads are widened to f32; all other dtypes are rejected.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor is missing, its dtype is unsupported,
    /// or its byte length disagrees with dtype and shape.
    pub fn tensor_f32(&self, name: &str) -> Result<Tensor<f32>> {
        let info = self.tensors.get(name).ok_or_else(|| ExportError::FormatError {
            reason: format!("Tensor '{name}' not found in checkpoint"),
        })?;

        let bytes = &self.data[info.data_offsets[0]..info.data_offsets[1]];
        let expected: usize = info.shape.iter().product();

        let values = match info.dtype {
            SafetensorsDtype::F32 => {
                if bytes.len() != expected * 4 {
                    return Err(ExportError::FormatError {
                        reason: format!(
                            "Tensor '{name}': {} bytes for {} f32 elements",
                            bytes.len(),
                            expected
                        ),
                    });
                }
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            }
            SafetensorsDtype::F16 => {
                if bytes.len() != expected * 2 {
                    return Err(ExportError::FormatError {
                        reason: format!(
                            "Tensor '{name}': {} bytes for {} f16 elements",
                            bytes.len(),
                            expected
                        ),
                    });
                }
                bytes
                    .chunks_exact(2)
                    .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect()
            }
            other => {
                return Err(ExportError::FormatError {
                    reason: format!("Tensor '{name}' has unsupported dtype {other:?}"),
                });
            }
        };

        Tensor::from_vec(info.shape.clone(), values)
    }
}

/// Serialize named f32 tensors into safetensors bytes
///
/// Test-fixture counterpart of the reader; checkpoints written with this
/// helper parse back bit-identically.
///
/// # Errors
///
/// Returns error if a tensor's data length disagrees with its shape.
pub fn to_bytes(tensors: &[(String, Vec<usize>, Vec<f32>)]) -> Result<Vec<u8>> {
    let mut metadata = serde_json::Map::new();
    let mut payload: Vec<u8> = Vec::new();

    for (name, shape, data) in tensors {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ExportError::InvalidShape {
                reason: format!(
                    "Tensor '{name}': {} values for shape {shape:?}",
                    data.len()
                ),
            });
        }

        let start = payload.len();
        for v in data {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let end = payload.len();

        metadata.insert(
            name.clone(),
            serde_json::json!({
                "dtype": "F32",
                "shape": shape,
                "data_offsets": [start, end],
            }),
        );
    }

    let header = serde_json::to_vec(&serde_json::Value::Object(metadata)).map_err(|e| {
        ExportError::FormatError {
            reason: format!("Failed to serialize safetensors metadata: {e}"),
        }
    })?;

    let mut out = Vec::with_capacity(8 + header.len() + payload.len());
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    Ok(out)
}
