//! On-device model package
//!
//! The converted model is a self-describing, directory-structured
//! artifact:
//!
//! ```text
//! <name>_INT8.aprpkg/
//! ├── manifest.json   - format version, runtime requirement, tensor
//! │                     specs, weight index
//! ├── model.graph     - serialized dataflow graph (JSON)
//! └── weights.bin     - concatenated weight payloads, each 64-byte
//!                       aligned
//! ```
//!
//! Saving replaces any existing package at the destination wholesale:
//! the old directory is removed before the new one is written, so a
//! destination never holds a mix of package versions. This pipeline is
//! single-writer by design; no cross-process locking is attempted.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::convert::TensorSpec;
use crate::error::{ExportError, Result};
use crate::graph::{Graph, WeightPayload, WeightTensor};

/// Package format version
pub const FORMAT_VERSION: u32 = 1;

/// Alignment of each weight payload inside `weights.bin`
pub const ALIGNMENT: usize = 64;

/// Entry in the manifest's weight index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightEntry {
    /// Tensor name
    pub name: String,
    /// Logical shape
    pub shape: Vec<usize>,
    /// Storage dtype: `float32` or `int8`
    pub dtype: String,
    /// Byte offset into `weights.bin`
    pub offset: usize,
    /// Payload length in bytes
    pub byte_len: usize,
    /// Dequantization scale (quantized tensors only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
    /// Dequantization zero point (quantized tensors only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zero_point: Option<i32>,
}

/// Package manifest, serialized to `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Package format version
    pub format_version: u32,
    /// Source model identifier
    pub model_name: String,
    /// Minimum on-device runtime version
    pub minimum_runtime_version: String,
    /// Declared input tensors
    pub inputs: Vec<TensorSpec>,
    /// Declared output tensors
    pub outputs: Vec<TensorSpec>,
    /// Weight index into `weights.bin`
    pub weights: Vec<WeightEntry>,
}

/// Converted (and optionally quantized) model package
#[derive(Debug, Clone)]
pub struct ModelPackage {
    /// Source model identifier
    pub model_name: String,
    /// Minimum on-device runtime version
    pub minimum_runtime_version: String,
    /// Declared input tensors
    pub inputs: Vec<TensorSpec>,
    /// Declared output tensors
    pub outputs: Vec<TensorSpec>,
    /// Dataflow graph
    pub graph: Graph,
    /// Weight tensors
    pub weights: Vec<WeightTensor>,
}

impl ModelPackage {
    /// Build the manifest, computing aligned payload offsets
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        let mut entries = Vec::with_capacity(self.weights.len());
        let mut offset = 0usize;
        for w in &self.weights {
            offset = align_up(offset);
            let (scale, zero_point) = match &w.payload {
                WeightPayload::F32(_) => (None, None),
                WeightPayload::Int8 {
                    scale, zero_point, ..
                } => (Some(*scale), Some(*zero_point)),
            };
            entries.push(WeightEntry {
                name: w.name.clone(),
                shape: w.shape.clone(),
                dtype: w.dtype_name().to_string(),
                offset,
                byte_len: w.byte_len(),
                scale,
                zero_point,
            });
            offset += w.byte_len();
        }

        Manifest {
            format_version: FORMAT_VERSION,
            model_name: self.model_name.clone(),
            minimum_runtime_version: self.minimum_runtime_version.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            weights: entries,
        }
    }

    /// Serialize all weight payloads with 64-byte alignment
    fn weight_payload(&self) -> Vec<u8> {
        let total: usize = self.weights.iter().map(|w| align_up(w.byte_len())).sum();
        let mut out = Vec::with_capacity(total);
        for w in &self.weights {
            while out.len() % ALIGNMENT != 0 {
                out.push(0);
            }
            match &w.payload {
                WeightPayload::F32(values) => {
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                WeightPayload::Int8 { data, .. } => {
                    #[allow(clippy::cast_sign_loss)]
                    out.extend(data.iter().map(|&b| b as u8));
                }
            }
        }
        out
    }

    /// Persist the package, replacing any existing one at `path`
    ///
    /// The previous package directory is removed first, so the
    /// destination never accumulates stale payload files from an earlier
    /// export.
    ///
    /// # Returns
    ///
    /// Total on-disk size of the written package in bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the destination is unwritable.
    pub fn save(&self, path: &Path) -> Result<u64> {
        if path.exists() {
            fs::remove_dir_all(path).map_err(|e| ExportError::IoError {
                message: format!(
                    "Failed to remove existing package '{}': {e}",
                    path.display()
                ),
            })?;
        }
        fs::create_dir_all(path).map_err(|e| ExportError::IoError {
            message: format!("Failed to create package '{}': {e}", path.display()),
        })?;

        let manifest = serde_json::to_string_pretty(&self.manifest()).map_err(|e| {
            ExportError::FormatError {
                reason: format!("Failed to serialize manifest: {e}"),
            }
        })?;
        fs::write(path.join("manifest.json"), manifest)?;

        let graph = serde_json::to_string(&self.graph).map_err(|e| ExportError::FormatError {
            reason: format!("Failed to serialize graph: {e}"),
        })?;
        fs::write(path.join("model.graph"), graph)?;

        fs::write(path.join("weights.bin"), self.weight_payload())?;

        dir_size(path)
    }
}

fn align_up(offset: usize) -> usize {
    offset.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Recursive on-disk size of a directory
fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
