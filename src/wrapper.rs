//! Static-shape model wrapper
//!
//! Drop-in replacement for the source model's forward pass that is fully
//! static-shape and restricted to the operator set the format converter
//! accepts. Two rewrites make the computation traceable:
//!
//! - Position indices are a precomputed `[1, L]` constant instead of a
//!   per-call integer cast on the input shape.
//! - The 2-D attention mask becomes a 4-D additive bias built from
//!   arithmetic ops only: reshape to `[1, 1, 1, L]`, cast to float, then
//!   `(1 - mask) * NEG_BIAS`. Attended positions get 0.0, masked
//!   positions an effectively infinite negative bias, with no comparison,
//!   boolean, or gather operator involved.
//!
//! The wrapper performs no input validation: shapes other than `[1, L]`
//! are a contract violation caught by the tracer's fixed dummy shapes.

use crate::error::Result;
use crate::graph::{TraceRef, Tracer};
use crate::model::{EncoderLayer, MaskedLmModel};
use crate::tensor::Tensor;

/// Additive bias applied to masked-out attention positions
///
/// Large enough that softmax assigns them exactly zero probability in
/// f32, matching multiplicative masking semantics.
pub const MASK_BIAS: f32 = -3.402_8e38;

/// Static-shape forward computation over a loaded masked-LM model
#[derive(Debug)]
pub struct StaticShapeWrapper<'a> {
    model: &'a MaskedLmModel,
    max_seq_len: usize,
    /// Precomputed position indices `[1, L]`
    position_ids: Tensor<i32>,
}

impl<'a> StaticShapeWrapper<'a> {
    /// Wrap a loaded model at a fixed maximum sequence length
    ///
    /// # Errors
    ///
    /// Returns error if `max_seq_len` is zero or exceeds the model's
    /// position-embedding table.
    pub fn new(model: &'a MaskedLmModel, max_seq_len: usize) -> Result<Self> {
        let position_ids = Tensor::arange(max_seq_len)?.reshaped(vec![1, max_seq_len])?;
        if max_seq_len > model.config.max_position_embeddings {
            return Err(crate::error::ExportError::InvalidShape {
                reason: format!(
                    "max_seq_len {} exceeds position table size {}",
                    max_seq_len, model.config.max_position_embeddings
                ),
            });
        }
        Ok(Self {
            model,
            max_seq_len,
            position_ids,
        })
    }

    /// Fixed maximum sequence length L
    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// The wrapped model
    #[must_use]
    pub fn model(&self) -> &MaskedLmModel {
        self.model
    }

    /// Build the 4-D additive attention bias from the 2-D mask
    ///
    /// `[1, L]` int mask -> reshape `[1, 1, 1, L]` -> cast f32 ->
    /// `(1 - mask) * MASK_BIAS`. Yields 0.0 where mask=1 and `MASK_BIAS`
    /// where mask=0.
    ///
    /// # Errors
    ///
    /// Returns error if the mask handle is not an integer tensor of L
    /// elements.
    pub fn attention_bias(&self, tracer: &mut Tracer, mask: TraceRef) -> Result<TraceRef> {
        let l = self.max_seq_len;
        let m4 = tracer.reshape(mask, vec![1, 1, 1, l])?;
        let mf = tracer.cast_f32(m4)?;
        let one = tracer.constant_f32(Tensor::full(vec![1], 1.0)?);
        let inverted = tracer.sub(one, mf)?;
        tracer.scale(inverted, MASK_BIAS)
    }

    /// Run the full static forward pass under the tracer
    ///
    /// Inputs are `[1, L]` integer tensors; the result is the raw
    /// prediction-score tensor `[1, L, V]` (no softmax, left to the
    /// caller).
    ///
    /// # Errors
    ///
    /// Returns error if any recorded operation fails shape checking.
    pub fn forward(
        &self,
        tracer: &mut Tracer,
        input_ids: TraceRef,
        attention_mask: TraceRef,
        token_type_ids: TraceRef,
    ) -> Result<TraceRef> {
        let bias = self.attention_bias(tracer, attention_mask)?;
        let mut hidden = self.embed(tracer, input_ids, token_type_ids)?;

        for (i, layer) in self.model.layers.iter().enumerate() {
            hidden = self.encoder_layer(tracer, hidden, bias, layer, i)?;
        }

        self.mlm_head(tracer, hidden)
    }

    /// Embedding sum and LayerNorm
    fn embed(
        &self,
        tracer: &mut Tracer,
        input_ids: TraceRef,
        token_type_ids: TraceRef,
    ) -> Result<TraceRef> {
        let emb = &self.model.embeddings;
        let eps = self.model.config.layer_norm_eps;

        let word_table = tracer.weight("embeddings.word_embeddings.weight", &emb.word);
        let pos_table = tracer.weight("embeddings.position_embeddings.weight", &emb.position);
        let type_table = tracer.weight("embeddings.token_type_embeddings.weight", &emb.token_type);

        let positions = tracer.constant_i32(self.position_ids.clone());

        let we = tracer.gather(word_table, input_ids)?;
        let pe = tracer.gather(pos_table, positions)?;
        let te = tracer.gather(type_table, token_type_ids)?;

        let sum = tracer.add(we, pe)?;
        let sum = tracer.add(sum, te)?;

        let gamma = tracer.weight("embeddings.LayerNorm.weight", &emb.norm_weight);
        let beta = tracer.weight("embeddings.LayerNorm.bias", &emb.norm_bias);
        tracer.layer_norm(sum, gamma, beta, eps)
    }

    /// Dense projection `x @ W^T + b` with checkpoint-layout `[out, in]`
    /// weights
    fn linear(
        &self,
        tracer: &mut Tracer,
        x: TraceRef,
        name: &str,
        weight: &Tensor<f32>,
        bias: &Tensor<f32>,
    ) -> Result<TraceRef> {
        let w = tracer.weight(&format!("{name}.weight"), weight);
        let b = tracer.weight(&format!("{name}.bias"), bias);
        let wt = tracer.transpose(w, vec![1, 0])?;
        let y = tracer.matmul(x, wt)?;
        tracer.add(y, b)
    }

    /// One encoder layer: self-attention with the precomputed additive
    /// bias, then the feed-forward block, both with residual LayerNorm
    fn encoder_layer(
        &self,
        tracer: &mut Tracer,
        hidden: TraceRef,
        bias: TraceRef,
        layer: &EncoderLayer,
        index: usize,
    ) -> Result<TraceRef> {
        let config = &self.model.config;
        let l = self.max_seq_len;
        let heads = config.num_attention_heads;
        let head_dim = config.head_dim();
        let h = config.hidden_size;
        let eps = config.layer_norm_eps;
        let p = format!("encoder.layer.{index}");

        let q = self.linear(
            tracer,
            hidden,
            &format!("{p}.attention.self.query"),
            &layer.query_weight,
            &layer.query_bias,
        )?;
        let k = self.linear(
            tracer,
            hidden,
            &format!("{p}.attention.self.key"),
            &layer.key_weight,
            &layer.key_bias,
        )?;
        let v = self.linear(
            tracer,
            hidden,
            &format!("{p}.attention.self.value"),
            &layer.value_weight,
            &layer.value_bias,
        )?;

        // [1, L, H] -> [1, A, L, dh]
        let q = tracer.reshape(q, vec![1, l, heads, head_dim])?;
        let q = tracer.transpose(q, vec![0, 2, 1, 3])?;
        let k = tracer.reshape(k, vec![1, l, heads, head_dim])?;
        // Key goes straight to [1, A, dh, L] for the score matmul.
        let k = tracer.transpose(k, vec![0, 2, 3, 1])?;
        let v = tracer.reshape(v, vec![1, l, heads, head_dim])?;
        let v = tracer.transpose(v, vec![0, 2, 1, 3])?;

        let scores = tracer.matmul(q, k)?;
        #[allow(clippy::cast_precision_loss)]
        let scores = tracer.scale(scores, 1.0 / (head_dim as f32).sqrt())?;
        let scores = tracer.add(scores, bias)?;
        let probs = tracer.softmax(scores)?;

        let context = tracer.matmul(probs, v)?;
        let context = tracer.transpose(context, vec![0, 2, 1, 3])?;
        let context = tracer.reshape(context, vec![1, l, h])?;

        let attn_out = self.linear(
            tracer,
            context,
            &format!("{p}.attention.output.dense"),
            &layer.attn_output_weight,
            &layer.attn_output_bias,
        )?;
        let residual = tracer.add(hidden, attn_out)?;
        let gamma = tracer.weight(
            &format!("{p}.attention.output.LayerNorm.weight"),
            &layer.attn_norm_weight,
        );
        let beta = tracer.weight(
            &format!("{p}.attention.output.LayerNorm.bias"),
            &layer.attn_norm_bias,
        );
        let hidden = tracer.layer_norm(residual, gamma, beta, eps)?;

        let ff = self.linear(
            tracer,
            hidden,
            &format!("{p}.intermediate.dense"),
            &layer.intermediate_weight,
            &layer.intermediate_bias,
        )?;
        let ff = tracer.gelu(ff)?;
        let ff = self.linear(
            tracer,
            ff,
            &format!("{p}.output.dense"),
            &layer.output_weight,
            &layer.output_bias,
        )?;
        let residual = tracer.add(hidden, ff)?;
        let gamma = tracer.weight(
            &format!("{p}.output.LayerNorm.weight"),
            &layer.output_norm_weight,
        );
        let beta = tracer.weight(
            &format!("{p}.output.LayerNorm.bias"),
            &layer.output_norm_bias,
        );
        tracer.layer_norm(residual, gamma, beta, eps)
    }

    /// Masked-token prediction head: transform, LayerNorm, decoder
    ///
    /// A tied decoder reuses the word-embedding weight node, so the
    /// largest tensor in the model is captured once, not twice.
    fn mlm_head(&self, tracer: &mut Tracer, hidden: TraceRef) -> Result<TraceRef> {
        let head = &self.model.head;
        let eps = self.model.config.layer_norm_eps;

        let x = self.linear(
            tracer,
            hidden,
            "cls.predictions.transform.dense",
            &head.transform_weight,
            &head.transform_bias,
        )?;
        let x = tracer.gelu(x)?;

        let gamma = tracer.weight("cls.predictions.transform.LayerNorm.weight", &head.norm_weight);
        let beta = tracer.weight("cls.predictions.transform.LayerNorm.bias", &head.norm_bias);
        let x = tracer.layer_norm(x, gamma, beta, eps)?;

        let decoder_name = if head.tied_decoder {
            "embeddings.word_embeddings.weight"
        } else {
            "cls.predictions.decoder.weight"
        };
        let w = tracer.weight(decoder_name, &head.decoder_weight);
        let b = tracer.weight("cls.predictions.decoder.bias", &head.decoder_bias);
        let wt = tracer.transpose(w, vec![1, 0])?;
        let y = tracer.matmul(x, wt)?;
        tracer.add(y, b)
    }
}
