//! Source model loading
//!
//! Loads a pretrained masked-LM checkpoint (encoder plus masked-token
//! prediction head) from a local snapshot directory:
//!
//! - `config.json` — architecture hyperparameters
//! - `model.safetensors` — weight tensors
//! - `vocab.txt` — WordPiece vocabulary
//!
//! The loaded model is immutable for the rest of the pipeline; the
//! wrapper and tracer only ever read its weight tensors.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::safetensors::SafetensorsFile;
use crate::tensor::Tensor;
use crate::vocab::Vocabulary;

/// Encoder architecture hyperparameters, deserialized from `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BertConfig {
    /// Vocabulary size V
    pub vocab_size: usize,
    /// Hidden dimension H
    pub hidden_size: usize,
    /// Number of encoder layers
    pub num_hidden_layers: usize,
    /// Number of attention heads A (must divide H)
    pub num_attention_heads: usize,
    /// Feed-forward inner dimension
    pub intermediate_size: usize,
    /// Size of the learned position-embedding table
    pub max_position_embeddings: usize,
    /// Number of segment/type embeddings
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    /// LayerNorm epsilon
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f32 {
    1e-12
}

impl BertConfig {
    /// Load from a `config.json` file
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or not valid JSON for this
    /// schema. Unknown fields are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ExportError::ModelNotFound {
                path: path.display().to_string(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ExportError::IoError {
            message: format!("Failed to read '{}': {e}", path.display()),
        })?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| ExportError::FormatError {
                reason: format!("Invalid config.json: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency of the hyperparameters
    ///
    /// # Errors
    ///
    /// Returns error if the head count does not divide the hidden size or
    /// any dimension is zero.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0
            || self.num_hidden_layers == 0
            || self.num_attention_heads == 0
            || self.vocab_size == 0
        {
            return Err(ExportError::FormatError {
                reason: "config.json contains zero-sized dimensions".to_string(),
            });
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ExportError::FormatError {
                reason: format!(
                    "hidden_size {} not divisible by num_attention_heads {}",
                    self.hidden_size, self.num_attention_heads
                ),
            });
        }
        Ok(())
    }

    /// Per-head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Embedding tables plus their LayerNorm
#[derive(Debug, Clone)]
pub struct Embeddings {
    /// Word embedding table `[V, H]`
    pub word: Tensor<f32>,
    /// Position embedding table `[P, H]`
    pub position: Tensor<f32>,
    /// Token-type embedding table `[T, H]`
    pub token_type: Tensor<f32>,
    /// LayerNorm scale `[H]`
    pub norm_weight: Tensor<f32>,
    /// LayerNorm shift `[H]`
    pub norm_bias: Tensor<f32>,
}

/// One encoder layer's weights
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    /// Query projection `[H, H]`
    pub query_weight: Tensor<f32>,
    /// Query bias `[H]`
    pub query_bias: Tensor<f32>,
    /// Key projection `[H, H]`
    pub key_weight: Tensor<f32>,
    /// Key bias `[H]`
    pub key_bias: Tensor<f32>,
    /// Value projection `[H, H]`
    pub value_weight: Tensor<f32>,
    /// Value bias `[H]`
    pub value_bias: Tensor<f32>,
    /// Attention output projection `[H, H]`
    pub attn_output_weight: Tensor<f32>,
    /// Attention output bias `[H]`
    pub attn_output_bias: Tensor<f32>,
    /// Post-attention LayerNorm scale `[H]`
    pub attn_norm_weight: Tensor<f32>,
    /// Post-attention LayerNorm shift `[H]`
    pub attn_norm_bias: Tensor<f32>,
    /// Feed-forward up projection `[I, H]`
    pub intermediate_weight: Tensor<f32>,
    /// Feed-forward up bias `[I]`
    pub intermediate_bias: Tensor<f32>,
    /// Feed-forward down projection `[H, I]`
    pub output_weight: Tensor<f32>,
    /// Feed-forward down bias `[H]`
    pub output_bias: Tensor<f32>,
    /// Post-FFN LayerNorm scale `[H]`
    pub output_norm_weight: Tensor<f32>,
    /// Post-FFN LayerNorm shift `[H]`
    pub output_norm_bias: Tensor<f32>,
}

/// Masked-token prediction head
#[derive(Debug, Clone)]
pub struct MaskedLmHead {
    /// Transform dense `[H, H]`
    pub transform_weight: Tensor<f32>,
    /// Transform bias `[H]`
    pub transform_bias: Tensor<f32>,
    /// Transform LayerNorm scale `[H]`
    pub norm_weight: Tensor<f32>,
    /// Transform LayerNorm shift `[H]`
    pub norm_bias: Tensor<f32>,
    /// Decoder projection `[V, H]` (tied to the word embeddings when the
    /// checkpoint does not carry a separate decoder matrix)
    pub decoder_weight: Tensor<f32>,
    /// Decoder bias `[V]`
    pub decoder_bias: Tensor<f32>,
    /// Whether `decoder_weight` shares storage with the word-embedding
    /// table; a tied decoder must not be packaged as a second tensor
    pub tied_decoder: bool,
}

/// Loaded encoder plus masked-token prediction head
#[derive(Debug, Clone)]
pub struct MaskedLmModel {
    /// Architecture hyperparameters
    pub config: BertConfig,
    /// Embedding tables
    pub embeddings: Embeddings,
    /// Encoder layers, bottom to top
    pub layers: Vec<EncoderLayer>,
    /// Prediction head
    pub head: MaskedLmHead,
}

/// Fetch a tensor trying the `bert.`-prefixed name first
///
/// Checkpoints exported with the task head keep encoder weights under a
/// `bert.` prefix; bare-encoder checkpoints drop it.
fn fetch(file: &SafetensorsFile, name: &str) -> Result<Tensor<f32>> {
    let prefixed = format!("bert.{name}");
    if file.contains(&prefixed) {
        file.tensor_f32(&prefixed)
    } else {
        file.tensor_f32(name)
    }
}

impl MaskedLmModel {
    /// Load the model and its vocabulary from a checkpoint directory
    ///
    /// # Errors
    ///
    /// Returns error if any of the three checkpoint files is missing or
    /// malformed, or if a required weight tensor is absent.
    pub fn load(dir: &Path) -> Result<(Self, Vocabulary)> {
        let config = BertConfig::load(&dir.join("config.json"))?;
        let file = SafetensorsFile::load(&dir.join("model.safetensors"))?;
        let vocab = Vocabulary::from_file(&dir.join("vocab.txt"))?;

        if vocab.len() != config.vocab_size {
            return Err(ExportError::FormatError {
                reason: format!(
                    "vocab.txt has {} tokens but config.json declares vocab_size {}",
                    vocab.len(),
                    config.vocab_size
                ),
            });
        }

        let model = Self::from_safetensors(config, &file)?;
        Ok((model, vocab))
    }

    /// Assemble the model from a parsed safetensors checkpoint
    ///
    /// # Errors
    ///
    /// Returns error if a required weight tensor is absent or has an
    /// unsupported dtype.
    pub fn from_safetensors(config: BertConfig, file: &SafetensorsFile) -> Result<Self> {
        let embeddings = Embeddings {
            word: fetch(file, "embeddings.word_embeddings.weight")?,
            position: fetch(file, "embeddings.position_embeddings.weight")?,
            token_type: fetch(file, "embeddings.token_type_embeddings.weight")?,
            norm_weight: fetch(file, "embeddings.LayerNorm.weight")?,
            norm_bias: fetch(file, "embeddings.LayerNorm.bias")?,
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let p = format!("encoder.layer.{i}");
            layers.push(EncoderLayer {
                query_weight: fetch(file, &format!("{p}.attention.self.query.weight"))?,
                query_bias: fetch(file, &format!("{p}.attention.self.query.bias"))?,
                key_weight: fetch(file, &format!("{p}.attention.self.key.weight"))?,
                key_bias: fetch(file, &format!("{p}.attention.self.key.bias"))?,
                value_weight: fetch(file, &format!("{p}.attention.self.value.weight"))?,
                value_bias: fetch(file, &format!("{p}.attention.self.value.bias"))?,
                attn_output_weight: fetch(file, &format!("{p}.attention.output.dense.weight"))?,
                attn_output_bias: fetch(file, &format!("{p}.attention.output.dense.bias"))?,
                attn_norm_weight: fetch(file, &format!("{p}.attention.output.LayerNorm.weight"))?,
                attn_norm_bias: fetch(file, &format!("{p}.attention.output.LayerNorm.bias"))?,
                intermediate_weight: fetch(file, &format!("{p}.intermediate.dense.weight"))?,
                intermediate_bias: fetch(file, &format!("{p}.intermediate.dense.bias"))?,
                output_weight: fetch(file, &format!("{p}.output.dense.weight"))?,
                output_bias: fetch(file, &format!("{p}.output.dense.bias"))?,
                output_norm_weight: fetch(file, &format!("{p}.output.LayerNorm.weight"))?,
                output_norm_bias: fetch(file, &format!("{p}.output.LayerNorm.bias"))?,
            });
        }

        // Decoder weight is usually tied to the word-embedding table.
        let (decoder_weight, tied_decoder) = if file.contains("cls.predictions.decoder.weight") {
            (file.tensor_f32("cls.predictions.decoder.weight")?, false)
        } else {
            (embeddings.word.clone(), true)
        };
        let decoder_bias = if file.contains("cls.predictions.decoder.bias") {
            file.tensor_f32("cls.predictions.decoder.bias")?
        } else {
            file.tensor_f32("cls.predictions.bias")?
        };

        let head = MaskedLmHead {
            transform_weight: file.tensor_f32("cls.predictions.transform.dense.weight")?,
            transform_bias: file.tensor_f32("cls.predictions.transform.dense.bias")?,
            norm_weight: file.tensor_f32("cls.predictions.transform.LayerNorm.weight")?,
            norm_bias: file.tensor_f32("cls.predictions.transform.LayerNorm.bias")?,
            decoder_weight,
            decoder_bias,
            tied_decoder,
        };

        Ok(Self {
            config,
            embeddings,
            layers,
            head,
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Synthetic checkpoint builders shared by unit tests

    use super::*;

    /// Tiny but structurally complete config
    #[must_use]
    pub fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 32,
            hidden_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 128,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
        }
    }

    /// Deterministic pseudo-random fill; avoids an RNG dependency in fixtures
    #[must_use]
    pub fn patterned(shape: Vec<usize>, seed: f32) -> Tensor<f32> {
        let size: usize = shape.iter().product();
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..size)
            .map(|i| ((i as f32 * 0.37 + seed).sin()) * 0.1)
            .collect();
        Tensor::from_vec(shape, data).expect("valid fixture shape")
    }

    /// Build a fully synthetic model for a config
    #[must_use]
    pub fn tiny_model(config: BertConfig) -> MaskedLmModel {
        let h = config.hidden_size;
        let v = config.vocab_size;
        let i_dim = config.intermediate_size;

        let embeddings = Embeddings {
            word: patterned(vec![v, h], 0.1),
            position: patterned(vec![config.max_position_embeddings, h], 0.2),
            token_type: patterned(vec![config.type_vocab_size, h], 0.3),
            norm_weight: Tensor::ones(vec![h]).unwrap(),
            norm_bias: Tensor::zeros(vec![h]).unwrap(),
        };

        let layers = (0..config.num_hidden_layers)
            .map(|l| {
                #[allow(clippy::cast_precision_loss)]
                let s = l as f32;
                EncoderLayer {
                    query_weight: patterned(vec![h, h], 1.0 + s),
                    query_bias: patterned(vec![h], 1.1 + s),
                    key_weight: patterned(vec![h, h], 1.2 + s),
                    key_bias: patterned(vec![h], 1.3 + s),
                    value_weight: patterned(vec![h, h], 1.4 + s),
                    value_bias: patterned(vec![h], 1.5 + s),
                    attn_output_weight: patterned(vec![h, h], 1.6 + s),
                    attn_output_bias: patterned(vec![h], 1.7 + s),
                    attn_norm_weight: Tensor::ones(vec![h]).unwrap(),
                    attn_norm_bias: Tensor::zeros(vec![h]).unwrap(),
                    intermediate_weight: patterned(vec![i_dim, h], 1.8 + s),
                    intermediate_bias: patterned(vec![i_dim], 1.9 + s),
                    output_weight: patterned(vec![h, i_dim], 2.0 + s),
                    output_bias: patterned(vec![h], 2.1 + s),
                    output_norm_weight: Tensor::ones(vec![h]).unwrap(),
                    output_norm_bias: Tensor::zeros(vec![h]).unwrap(),
                }
            })
            .collect();

        let head = MaskedLmHead {
            transform_weight: patterned(vec![h, h], 3.0),
            transform_bias: patterned(vec![h], 3.1),
            norm_weight: Tensor::ones(vec![h]).unwrap(),
            norm_bias: Tensor::zeros(vec![h]).unwrap(),
            decoder_weight: embeddings.word.clone(),
            decoder_bias: patterned(vec![v], 3.2),
            tied_decoder: true,
        };

        MaskedLmModel {
            config,
            embeddings,
            layers,
            head,
        }
    }
}
