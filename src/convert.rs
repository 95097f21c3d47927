//! Format converter
//!
//! Translates a traced graph into the portable on-device model package,
//! attaching declared input/output tensor specifications and the minimum
//! runtime version the package requires. This is a pure graph-to-graph
//! translation: operator payloads are carried over unchanged and no
//! numerical reordering takes place. The tracer's closed operator set
//! matches the target runtime's, so support checking is structural: a
//! node violating the target's rank or dtype constraints is a fatal
//! conversion error with no partial output.

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::graph::{DType, Node, Op};
use crate::package::ModelPackage;
use crate::trace::TracedGraph;

/// Minimum on-device runtime version the emitted package is tagged with
pub const MIN_RUNTIME_VERSION: &str = "1.2.0";

/// Declared tensor interface of the package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Tensor name
    pub name: String,
    /// Fixed shape
    pub shape: Vec<usize>,
    /// Element type
    pub dtype: DType,
}

impl TensorSpec {
    /// Convenience constructor
    #[must_use]
    pub fn new(name: &str, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            name: name.to_string(),
            shape,
            dtype,
        }
    }
}

/// Conversion options: the declared package interface
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Named input tensors, in declaration order
    pub inputs: Vec<TensorSpec>,
    /// Name and element type of the output tensor (shape comes from the
    /// traced graph)
    pub output_name: String,
    /// Minimum runtime version tag
    pub minimum_runtime_version: String,
}

impl ConvertOptions {
    /// Standard interface for a masked-LM export at sequence length `l`:
    /// `input_ids`, `attention_mask`, `token_type_ids`, each `[1, l]`
    /// int32, output `logits`
    #[must_use]
    pub fn masked_lm(l: usize) -> Self {
        Self {
            inputs: vec![
                TensorSpec::new("input_ids", vec![1, l], DType::Int32),
                TensorSpec::new("attention_mask", vec![1, l], DType::Int32),
                TensorSpec::new("token_type_ids", vec![1, l], DType::Int32),
            ],
            output_name: "logits".to_string(),
            minimum_runtime_version: MIN_RUNTIME_VERSION.to_string(),
        }
    }
}

/// Structural constraints the target runtime imposes per operator
///
/// Operator support itself is guaranteed by the closed [`Op`] enum:
/// every recordable operation has a target counterpart, so the support
/// check is purely structural (rank and dtype constraints).
fn check_node(node: &Node) -> Result<()> {
    match &node.op {
        Op::MatMul | Op::Transpose { .. } if node.shape.len() < 2 => {
            Err(ExportError::UnsupportedOperation {
                operation: node.op.kind().to_string(),
                reason: format!("rank {} below target minimum of 2", node.shape.len()),
            })
        }
        Op::Cast { to } if *to != DType::Float32 => Err(ExportError::UnsupportedOperation {
            operation: "cast".to_string(),
            reason: format!("target runtime only casts to float32, got {to}"),
        }),
        _ => Ok(()),
    }
}

/// Convert a traced graph into a model package
///
/// # Errors
///
/// Returns error if a node violates the target runtime's structural
/// constraints, or if the declared input specs disagree with the traced
/// input nodes.
pub fn convert(model_name: &str, traced: &TracedGraph, options: &ConvertOptions) -> Result<ModelPackage> {
    for node in &traced.graph.nodes {
        check_node(node)?;
    }

    let input_nodes = traced.graph.input_nodes();
    if input_nodes.len() != options.inputs.len() {
        return Err(ExportError::InvalidShape {
            reason: format!(
                "Graph has {} inputs but {} were declared",
                input_nodes.len(),
                options.inputs.len()
            ),
        });
    }
    for (node, spec) in input_nodes.iter().zip(&options.inputs) {
        let name = match &node.op {
            Op::Input { name } => name.as_str(),
            _ => unreachable!("input_nodes returns only Op::Input"),
        };
        if name != spec.name || node.shape != spec.shape || node.dtype != spec.dtype {
            return Err(ExportError::InvalidShape {
                reason: format!(
                    "Declared input '{}' {:?} {} does not match traced input '{}' {:?} {}",
                    spec.name, spec.shape, spec.dtype, name, node.shape, node.dtype
                ),
            });
        }
    }

    let out = traced.graph.output_node();
    let output = TensorSpec::new(&options.output_name, out.shape.clone(), out.dtype);

    Ok(ModelPackage {
        model_name: model_name.to_string(),
        minimum_runtime_version: options.minimum_runtime_version.clone(),
        inputs: options.inputs.clone(),
        outputs: vec![output],
        graph: traced.graph.clone(),
        weights: traced.weights.clone(),
    })
}
