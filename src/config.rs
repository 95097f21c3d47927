//! Export configuration and defaults
//!
//! All knobs default to the standard model so a bare CLI invocation
//! needs no flags. The builders exist for tests and for pointing the
//! pipeline at alternative checkpoints.

use std::path::{Path, PathBuf};

/// Default source model identifier
pub const MODEL_NAME: &str = "dicta-il/dictabert";

/// Fixed maximum sequence length baked into the exported graph
pub const MAX_SEQ_LEN: usize = 128;

/// Default destination directory for the artifacts
pub const OUTPUT_DIR: &str = "Resources";

/// Configuration for a single export run
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Checkpoint directory (config.json, model.safetensors, vocab.txt)
    pub model_dir: PathBuf,
    /// Model identifier, used to name the package
    pub model_name: String,
    /// Fixed sequence length for the static-shape trace
    pub max_seq_len: usize,
    /// Destination directory for vocab.txt and the package
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self::new("dictabert")
    }
}

impl ExportConfig {
    /// Create a configuration with default name, length, and destination
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            model_name: MODEL_NAME.to_string(),
            max_seq_len: MAX_SEQ_LEN,
            output_dir: PathBuf::from(OUTPUT_DIR),
        }
    }

    /// Set the model identifier
    #[must_use]
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Set the fixed sequence length
    #[must_use]
    pub fn with_max_seq_len(mut self, len: usize) -> Self {
        self.max_seq_len = len;
        self
    }

    /// Set the destination directory
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Package file name, derived from the model identifier
    ///
    /// The identifier's organization prefix is dropped: `org/model`
    /// becomes `model_INT8.aprpkg`.
    #[must_use]
    pub fn package_file_name(&self) -> String {
        let base = self
            .model_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.model_name);
        format!("{base}_INT8.aprpkg")
    }

    /// Full destination path of the model package
    #[must_use]
    pub fn package_path(&self) -> PathBuf {
        self.output_dir.join(self.package_file_name())
    }

    /// Full destination path of the vocabulary file
    #[must_use]
    pub fn vocab_path(&self) -> PathBuf {
        self.output_dir.join("vocab.txt")
    }

    /// Checkpoint directory as a path
    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExportConfig::default();
        assert_eq!(config.model_name, MODEL_NAME);
        assert_eq!(config.max_seq_len, 128);
        assert_eq!(config.output_dir, PathBuf::from("Resources"));
    }

    #[test]
    fn test_package_name_strips_organization() {
        let config = ExportConfig::default();
        assert_eq!(config.package_file_name(), "dictabert_INT8.aprpkg");

        let config = config.with_model_name("plainname");
        assert_eq!(config.package_file_name(), "plainname_INT8.aprpkg");
    }

    #[test]
    fn test_artifact_paths() {
        let config = ExportConfig::new("/ckpt").with_output_dir("/out");
        assert_eq!(
            config.package_path(),
            PathBuf::from("/out/dictabert_INT8.aprpkg")
        );
        assert_eq!(config.vocab_path(), PathBuf::from("/out/vocab.txt"));
    }

    #[test]
    fn test_builders() {
        let config = ExportConfig::new("m")
            .with_model_name("org/alt")
            .with_max_seq_len(64)
            .with_output_dir("dest");
        assert_eq!(config.max_seq_len, 64);
        assert_eq!(config.package_file_name(), "alt_INT8.aprpkg");
        assert_eq!(config.model_dir(), Path::new("m"));
    }
}
