//! Trace exporter
//!
//! Executes the static-shape wrapper once on representative dummy inputs
//! and captures the concrete dataflow graph. The dummy inputs have the
//! exact target shapes: token ids sampled from a valid-but-arbitrary
//! range, an all-ones attention mask, and all-zero type ids.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ExportError, Result};
use crate::graph::{Graph, Tracer, WeightTensor};
use crate::tensor::Tensor;
use crate::wrapper::StaticShapeWrapper;

/// Upper bound (exclusive) for dummy token ids
const DUMMY_ID_RANGE: i32 = 1000;

/// Seed for the dummy-id sampler; the trace result does not depend on the
/// sampled values, only their shapes, but a fixed seed keeps runs
/// comparable
const DUMMY_SEED: u64 = 0x5eed;

/// Captured trace: the recorded graph, its weight tensors, and the logits
/// observed during the trace run (kept for verification)
#[derive(Debug, Clone)]
pub struct TracedGraph {
    /// Recorded dataflow graph
    pub graph: Graph,
    /// Weight tensors referenced by the graph
    pub weights: Vec<WeightTensor>,
    /// Logits produced by the trace run, shape `[1, L, V]`
    pub logits: Tensor<f32>,
}

/// Trace the wrapper on generated dummy inputs
///
/// # Errors
///
/// Returns error if the forward pass records an operation that violates
/// static-shape constraints, or if the traced output shape is not
/// `[1, L, V]`.
pub fn trace(wrapper: &StaticShapeWrapper<'_>) -> Result<TracedGraph> {
    let l = wrapper.max_seq_len();
    let mut rng = StdRng::seed_from_u64(DUMMY_SEED);

    let id_bound = i32::try_from(wrapper.model().config.vocab_size)
        .unwrap_or(DUMMY_ID_RANGE)
        .min(DUMMY_ID_RANGE);
    let ids: Vec<i32> = (0..l).map(|_| rng.gen_range(0..id_bound)).collect();

    let dummy_ids = Tensor::from_vec(vec![1, l], ids)?;
    let dummy_mask = Tensor::ones(vec![1, l])?;
    let dummy_types = Tensor::zeros(vec![1, l])?;

    trace_with_inputs(wrapper, dummy_ids, dummy_mask, dummy_types)
}

/// Trace the wrapper on caller-provided `[1, L]` inputs
///
/// # Errors
///
/// Same failure modes as [`trace`].
pub fn trace_with_inputs(
    wrapper: &StaticShapeWrapper<'_>,
    input_ids: Tensor<i32>,
    attention_mask: Tensor<i32>,
    token_type_ids: Tensor<i32>,
) -> Result<TracedGraph> {
    let mut tracer = Tracer::new();

    let ids = tracer.input_i32("input_ids", input_ids);
    let mask = tracer.input_i32("attention_mask", attention_mask);
    let types = tracer.input_i32("token_type_ids", token_type_ids);

    let output = wrapper.forward(&mut tracer, ids, mask, types)?;
    let logits = tracer.float_value(output)?.clone();

    let l = wrapper.max_seq_len();
    let v = wrapper.model().config.vocab_size;
    if logits.shape() != [1, l, v] {
        return Err(ExportError::InvalidShape {
            reason: format!(
                "Traced output shape {:?} does not match expected [1, {l}, {v}]",
                logits.shape()
            ),
        });
    }

    let (graph, weights) = tracer.finish(output)?;
    Ok(TracedGraph {
        graph,
        weights,
        logits,
    })
}
