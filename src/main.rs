//! Exportar CLI - static-shape INT8 export for Hebrew masked-LM checkpoints
//!
//! Produces two artifacts in the output directory:
//! - `vocab.txt` - WordPiece vocabulary, one token per line in id order
//! - `<model>_INT8.aprpkg` - quantized on-device model package
//!
//! All flags default to the built-in constants, so a bare invocation
//! exports the standard model.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use exportar::config::{ExportConfig, MAX_SEQ_LEN, MODEL_NAME, OUTPUT_DIR};

/// Exportar - convert a masked-LM checkpoint to an on-device package
#[derive(Parser)]
#[command(name = "exportar")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Checkpoint directory (config.json, model.safetensors, vocab.txt)
    #[arg(long, default_value = "dictabert")]
    model_dir: PathBuf,

    /// Model identifier, used to name the package
    #[arg(long, default_value = MODEL_NAME)]
    model_name: String,

    /// Fixed maximum sequence length
    #[arg(long, default_value_t = MAX_SEQ_LEN)]
    max_seq_len: usize,

    /// Destination directory for the artifacts
    #[arg(long, default_value = OUTPUT_DIR)]
    output_dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = ExportConfig::new(cli.model_dir)
        .with_model_name(cli.model_name)
        .with_max_seq_len(cli.max_seq_len)
        .with_output_dir(cli.output_dir);

    match exportar::cli::run(&config) {
        Ok(report) => {
            println!(
                "Done. Add {} and vocab.txt to the application bundle.",
                report.package_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Export failed: {err}");
            ExitCode::FAILURE
        }
    }
}
