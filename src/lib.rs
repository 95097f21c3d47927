//! # Exportar
//!
//! Converts a pretrained Hebrew WordPiece masked-language-model into a
//! statically-shaped, INT8 weight-quantized on-device model package plus
//! an ordered vocabulary table.
//!
//! The pipeline is a single pass: load checkpoint, export vocabulary,
//! rewrite the forward computation behind a static-shape wrapper, trace
//! it on fixed dummy inputs, convert the recorded graph to the package
//! format, quantize the weights, and write the artifact. Every stage is
//! fail-fast; there is no retry and no partial-output fallback.
//!
//! ## Example
//!
//! ```rust,ignore
//! use exportar::{cli, config::ExportConfig};
//!
//! let config = ExportConfig::new("./dictabert").with_output_dir("./Resources");
//! let report = cli::run(&config)?;
//! println!("package: {}", report.package_path.display());
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::float_cmp)] // Bit-reproducibility tests compare floats exactly

/// CLI command implementation
pub mod cli;
/// Export configuration and defaults
pub mod config;
/// Traced graph to package conversion
pub mod convert;
pub mod error;
/// Traced dataflow graph and recording tracer
pub mod graph;
/// Source checkpoint loading
pub mod model;
/// On-device model package format
pub mod package;
/// Post-training INT8 weight quantization
pub mod quantize;
/// Safetensors checkpoint reader
pub mod safetensors;
pub mod tensor;
/// Trace exporter
pub mod trace;
/// Vocabulary management and export
pub mod vocab;
/// Static-shape model wrapper
pub mod wrapper;

// Re-exports for convenience
pub use error::{ExportError, Result};
pub use tensor::Tensor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
