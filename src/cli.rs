//! CLI command implementation
//!
//! The export orchestration lives here, extracted from main.rs for
//! testability. Progress goes to stdout; every stage error aborts the
//! run and propagates to the process exit code.

use crate::config::ExportConfig;
use crate::convert::{convert, ConvertOptions};
use crate::error::Result;
use crate::model::MaskedLmModel;
use crate::quantize::quantize_weights;
use crate::trace::trace;
use crate::vocab::write_vocab;
use crate::wrapper::StaticShapeWrapper;

/// Summary of a completed export run
#[derive(Debug, Clone)]
pub struct ExportReport {
    /// Number of vocabulary tokens written
    pub vocab_tokens: usize,
    /// Destination of the quantized package
    pub package_path: std::path::PathBuf,
    /// On-disk size of the package in bytes
    pub package_size_bytes: u64,
}

/// Run the full export pipeline
///
/// Loads the checkpoint, exports the vocabulary, then traces, converts,
/// quantizes, and saves the model package. The two outputs are written
/// independently: a failure in the model pipeline does not roll back an
/// already written vocabulary file.
///
/// # Errors
///
/// Returns the first stage error; nothing is retried.
pub fn run(config: &ExportConfig) -> Result<ExportReport> {
    println!(
        "Loading {} from {}...",
        config.model_name,
        config.model_dir.display()
    );
    let (model, vocab) = MaskedLmModel::load(&config.model_dir)?;

    let vocab_path = config.vocab_path();
    let vocab_tokens = write_vocab(&vocab, &vocab_path)?;
    println!(
        "Wrote vocabulary ({vocab_tokens} tokens) -> {}",
        vocab_path.display()
    );

    println!(
        "Tracing model at fixed sequence length {}...",
        config.max_seq_len
    );
    let wrapper = StaticShapeWrapper::new(&model, config.max_seq_len)?;
    let traced = trace(&wrapper)?;
    println!("Tracing succeeded ({} nodes)", traced.graph.nodes.len());

    println!("Converting to package format...");
    let options = ConvertOptions::masked_lm(config.max_seq_len);
    let package = convert(&config.model_name, &traced, &options)?;

    println!("Applying INT8 quantization...");
    let quantized = quantize_weights(package)?;

    let package_path = config.package_path();
    let package_size_bytes = quantized.save(&package_path)?;
    #[allow(clippy::cast_precision_loss)]
    let size_mb = package_size_bytes as f64 / (1024.0 * 1024.0);
    println!(
        "Saved model package ({size_mb:.1} MB) -> {}",
        package_path.display()
    );

    Ok(ExportReport {
        vocab_tokens,
        package_path,
        package_size_bytes,
    })
}
