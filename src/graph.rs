//! Traced dataflow graph and recording tracer
//!
//! Tracing runs the wrapped forward computation once on concrete inputs
//! and records every tensor operation into a [`Graph`]. The recorded
//! graph is the only representation the format converter accepts: it has
//! no knowledge of the source model's structure, only the operations that
//! actually executed.
//!
//! The operator set is closed and fully static-shape. There is no
//! comparison, boolean, or shape-dependent branching operator, so a
//! successful trace is already free of dynamic behavior. Every node
//! carries the concrete output shape observed during the trace run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::tensor::Tensor;

/// Element type of a graph value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit signed integer
    Int32,
    /// 32-bit float
    Float32,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::Int32 => write!(f, "int32"),
            DType::Float32 => write!(f, "float32"),
        }
    }
}

/// Inline constant payload (small tensors only; weights live in the
/// package payload, not in the graph)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstPayload {
    /// Integer constant (e.g. the position-index buffer)
    I32(Vec<i32>),
    /// Float constant (e.g. broadcast scalars)
    F32(Vec<f32>),
}

/// Recorded tensor operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Named pipeline input
    Input {
        /// Declared tensor name
        name: String,
    },
    /// Inline constant
    Constant {
        /// Constant data
        payload: ConstPayload,
    },
    /// Reference to a weight tensor stored in the package payload
    Weight {
        /// Weight tensor name
        name: String,
    },
    /// Element-type conversion
    Cast {
        /// Target element type
        to: DType,
    },
    /// Shape change without data movement (target shape = node shape)
    Reshape,
    /// Axis permutation
    Transpose {
        /// Permutation of input axes
        perm: Vec<usize>,
    },
    /// Elementwise addition with broadcasting
    Add,
    /// Elementwise subtraction with broadcasting
    Sub,
    /// Elementwise multiplication with broadcasting
    Mul,
    /// Multiplication by a compile-time scalar
    Scale {
        /// Scalar factor
        factor: f32,
    },
    /// Batched matrix multiplication
    MatMul,
    /// Embedding-table row lookup
    Gather,
    /// Layer normalization over the last axis
    LayerNorm {
        /// Variance epsilon
        eps: f32,
    },
    /// GELU activation (tanh approximation)
    Gelu,
    /// Softmax over the last axis
    Softmax,
}

impl Op {
    /// Stable operation name, used for converter support checks and
    /// error messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Constant { .. } => "constant",
            Op::Weight { .. } => "weight",
            Op::Cast { .. } => "cast",
            Op::Reshape => "reshape",
            Op::Transpose { .. } => "transpose",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Scale { .. } => "scale",
            Op::MatMul => "matmul",
            Op::Gather => "gather",
            Op::LayerNorm { .. } => "layer_norm",
            Op::Gelu => "gelu",
            Op::Softmax => "softmax",
        }
    }
}

/// One node of the traced graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id (index into the node table)
    pub id: usize,
    /// Recorded operation
    pub op: Op,
    /// Ids of input nodes, in operand order
    pub inputs: Vec<usize>,
    /// Concrete output shape observed during the trace
    pub shape: Vec<usize>,
    /// Output element type
    pub dtype: DType,
}

/// Traced dataflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// Node table in recording order (topologically sorted by construction)
    pub nodes: Vec<Node>,
    /// Id of the output node
    pub output: usize,
}

impl Graph {
    /// Input nodes in recording order
    #[must_use]
    pub fn input_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.op, Op::Input { .. }))
            .collect()
    }

    /// The output node
    ///
    /// # Panics
    ///
    /// Never panics for graphs produced by [`Tracer::finish`], which
    /// validates the output id.
    #[must_use]
    pub fn output_node(&self) -> &Node {
        &self.nodes[self.output]
    }
}

/// Weight tensor captured during tracing
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    /// Name referenced by `Op::Weight` nodes
    pub name: String,
    /// Logical shape (unchanged by quantization)
    pub shape: Vec<usize>,
    /// Storage payload
    pub payload: WeightPayload,
}

/// Weight storage representation
#[derive(Debug, Clone, PartialEq)]
pub enum WeightPayload {
    /// Full-precision floats
    F32(Vec<f32>),
    /// Affine-quantized 8-bit signed integers
    Int8 {
        /// Dequantization scale
        scale: f32,
        /// Dequantization zero point
        zero_point: i32,
        /// Quantized values
        data: Vec<i8>,
    },
}

impl WeightTensor {
    /// Element count
    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Payload size in bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match &self.payload {
            WeightPayload::F32(v) => v.len() * 4,
            WeightPayload::Int8 { data, .. } => data.len(),
        }
    }

    /// Storage dtype name for the package manifest
    #[must_use]
    pub fn dtype_name(&self) -> &'static str {
        match &self.payload {
            WeightPayload::F32(_) => "float32",
            WeightPayload::Int8 { .. } => "int8",
        }
    }
}

/// Concrete value flowing through the trace
#[derive(Debug, Clone)]
enum Value {
    I32(Tensor<i32>),
    F32(Tensor<f32>),
}

impl Value {
    fn shape(&self) -> &[usize] {
        match self {
            Value::I32(t) => t.shape(),
            Value::F32(t) => t.shape(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            Value::I32(_) => DType::Int32,
            Value::F32(_) => DType::Float32,
        }
    }
}

/// Handle to a recorded value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRef(usize);

/// Recording tracer: executes operations eagerly and logs each one
///
/// All arithmetic is plain sequential f32, so a trace is bit-reproducible
/// for identical inputs.
#[derive(Debug, Default)]
pub struct Tracer {
    nodes: Vec<Node>,
    values: Vec<Value>,
    weights: Vec<WeightTensor>,
    weight_nodes: HashMap<String, TraceRef>,
}

impl Tracer {
    /// Create an empty tracer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn record(&mut self, op: Op, inputs: Vec<usize>, value: Value) -> TraceRef {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            op,
            inputs,
            shape: value.shape().to_vec(),
            dtype: value.dtype(),
        });
        self.values.push(value);
        TraceRef(id)
    }

    fn value(&self, r: TraceRef) -> &Value {
        &self.values[r.0]
    }

    fn float(&self, r: TraceRef, operation: &str) -> Result<&Tensor<f32>> {
        match self.value(r) {
            Value::F32(t) => Ok(t),
            Value::I32(_) => Err(ExportError::UnsupportedOperation {
                operation: operation.to_string(),
                reason: "requires float operands; integer tensors must be cast first".to_string(),
            }),
        }
    }

    fn int(&self, r: TraceRef, operation: &str) -> Result<&Tensor<i32>> {
        match self.value(r) {
            Value::I32(t) => Ok(t),
            Value::F32(_) => Err(ExportError::UnsupportedOperation {
                operation: operation.to_string(),
                reason: "requires integer operands".to_string(),
            }),
        }
    }

    /// Concrete f32 value of a recorded node (verification and tests)
    ///
    /// # Errors
    ///
    /// Returns error if the node holds an integer tensor.
    pub fn float_value(&self, r: TraceRef) -> Result<&Tensor<f32>> {
        self.float(r, "float_value")
    }

    /// Record a named integer input
    pub fn input_i32(&mut self, name: &str, tensor: Tensor<i32>) -> TraceRef {
        self.record(
            Op::Input {
                name: name.to_string(),
            },
            vec![],
            Value::I32(tensor),
        )
    }

    /// Record an inline integer constant
    pub fn constant_i32(&mut self, tensor: Tensor<i32>) -> TraceRef {
        let payload = ConstPayload::I32(tensor.data().to_vec());
        self.record(Op::Constant { payload }, vec![], Value::I32(tensor))
    }

    /// Record an inline float constant
    pub fn constant_f32(&mut self, tensor: Tensor<f32>) -> TraceRef {
        let payload = ConstPayload::F32(tensor.data().to_vec());
        self.record(Op::Constant { payload }, vec![], Value::F32(tensor))
    }

    /// Record a weight tensor, deduplicated by name
    ///
    /// The payload is captured once; later references to the same name
    /// return the original node.
    pub fn weight(&mut self, name: &str, tensor: &Tensor<f32>) -> TraceRef {
        if let Some(&r) = self.weight_nodes.get(name) {
            return r;
        }
        self.weights.push(WeightTensor {
            name: name.to_string(),
            shape: tensor.shape().to_vec(),
            payload: WeightPayload::F32(tensor.data().to_vec()),
        });
        let r = self.record(
            Op::Weight {
                name: name.to_string(),
            },
            vec![],
            Value::F32(tensor.clone()),
        );
        self.weight_nodes.insert(name.to_string(), r);
        r
    }

    /// Cast an integer tensor to float
    ///
    /// # Errors
    ///
    /// Returns error if the operand is already float.
    pub fn cast_f32(&mut self, x: TraceRef) -> Result<TraceRef> {
        let t = self.int(x, "cast")?;
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = t.data().iter().map(|&v| v as f32).collect();
        let out = Tensor::from_vec(t.shape().to_vec(), data)?;
        Ok(self.record(
            Op::Cast { to: DType::Float32 },
            vec![x.0],
            Value::F32(out),
        ))
    }

    /// Reshape to a new static shape with the same element count
    ///
    /// # Errors
    ///
    /// Returns error if the element count changes.
    pub fn reshape(&mut self, x: TraceRef, shape: Vec<usize>) -> Result<TraceRef> {
        let value = match self.value(x) {
            Value::I32(t) => Value::I32(t.reshaped(shape)?),
            Value::F32(t) => Value::F32(t.reshaped(shape)?),
        };
        Ok(self.record(Op::Reshape, vec![x.0], value))
    }

    /// Permute axes of a float tensor
    ///
    /// # Errors
    ///
    /// Returns error if `perm` is not a permutation of the tensor's axes.
    pub fn transpose(&mut self, x: TraceRef, perm: Vec<usize>) -> Result<TraceRef> {
        let t = self.float(x, "transpose")?;
        let (shape, data) = permuted(t.shape(), t.data(), &perm)?;
        let out = Tensor::from_vec(shape, data)?;
        Ok(self.record(Op::Transpose { perm }, vec![x.0], Value::F32(out)))
    }

    /// Elementwise addition with right-aligned broadcasting
    ///
    /// # Errors
    ///
    /// Returns error on incompatible shapes or integer operands.
    pub fn add(&mut self, a: TraceRef, b: TraceRef) -> Result<TraceRef> {
        self.binary(Op::Add, a, b, |x, y| x + y)
    }

    /// Elementwise subtraction with right-aligned broadcasting
    ///
    /// # Errors
    ///
    /// Returns error on incompatible shapes or integer operands.
    pub fn sub(&mut self, a: TraceRef, b: TraceRef) -> Result<TraceRef> {
        self.binary(Op::Sub, a, b, |x, y| x - y)
    }

    /// Elementwise multiplication with right-aligned broadcasting
    ///
    /// # Errors
    ///
    /// Returns error on incompatible shapes or integer operands.
    pub fn mul(&mut self, a: TraceRef, b: TraceRef) -> Result<TraceRef> {
        self.binary(Op::Mul, a, b, |x, y| x * y)
    }

    fn binary(
        &mut self,
        op: Op,
        a: TraceRef,
        b: TraceRef,
        f: fn(f32, f32) -> f32,
    ) -> Result<TraceRef> {
        let kind = op.kind();
        let ta = self.float(a, kind)?;
        let tb = self.float(b, kind)?;
        let (shape, data) = broadcast_binary(ta.shape(), ta.data(), tb.shape(), tb.data(), f)?;
        let out = Tensor::from_vec(shape, data)?;
        Ok(self.record(op, vec![a.0, b.0], Value::F32(out)))
    }

    /// Multiply by a compile-time scalar
    ///
    /// # Errors
    ///
    /// Returns error on integer operands.
    pub fn scale(&mut self, x: TraceRef, factor: f32) -> Result<TraceRef> {
        let t = self.float(x, "scale")?;
        let data: Vec<f32> = t.data().iter().map(|&v| v * factor).collect();
        let out = Tensor::from_vec(t.shape().to_vec(), data)?;
        Ok(self.record(Op::Scale { factor }, vec![x.0], Value::F32(out)))
    }

    /// Batched matrix multiplication
    ///
    /// `a` has shape `[..., m, k]`. `b` is either a 2-D `[k, n]` matrix
    /// shared across the batch, or carries the same leading dimensions as
    /// `a` with trailing `[k, n]`.
    ///
    /// # Errors
    ///
    /// Returns error on rank or inner-dimension mismatch.
    pub fn matmul(&mut self, a: TraceRef, b: TraceRef) -> Result<TraceRef> {
        let ta = self.float(a, "matmul")?;
        let tb = self.float(b, "matmul")?;
        let (shape, data) = matmul_kernel(ta.shape(), ta.data(), tb.shape(), tb.data())?;
        let out = Tensor::from_vec(shape, data)?;
        Ok(self.record(Op::MatMul, vec![a.0, b.0], Value::F32(out)))
    }

    /// Embedding-table row lookup
    ///
    /// `table` has shape `[rows, width]`; `indices` is an integer tensor
    /// of any shape. Output shape is `indices.shape + [width]`.
    ///
    /// # Errors
    ///
    /// Returns error if an index is out of range or the table is not 2-D.
    pub fn gather(&mut self, table: TraceRef, indices: TraceRef) -> Result<TraceRef> {
        let tt = self.float(table, "gather")?;
        let ti = self.int(indices, "gather")?;

        if tt.ndim() != 2 {
            return Err(ExportError::InvalidShape {
                reason: format!("Gather table must be 2-D, got shape {:?}", tt.shape()),
            });
        }
        let rows = tt.shape()[0];
        let width = tt.shape()[1];

        let mut data = Vec::with_capacity(ti.size() * width);
        for &idx in ti.data() {
            let idx = usize::try_from(idx).map_err(|_| ExportError::InvalidShape {
                reason: format!("Gather index {idx} is negative"),
            })?;
            if idx >= rows {
                return Err(ExportError::InvalidShape {
                    reason: format!("Gather index {idx} out of range for table with {rows} rows"),
                });
            }
            data.extend_from_slice(&tt.data()[idx * width..(idx + 1) * width]);
        }

        let mut shape = ti.shape().to_vec();
        shape.push(width);
        let out = Tensor::from_vec(shape, data)?;
        Ok(self.record(Op::Gather, vec![table.0, indices.0], Value::F32(out)))
    }

    /// Layer normalization over the last axis
    ///
    /// # Errors
    ///
    /// Returns error if `gamma`/`beta` do not match the last axis.
    pub fn layer_norm(
        &mut self,
        x: TraceRef,
        gamma: TraceRef,
        beta: TraceRef,
        eps: f32,
    ) -> Result<TraceRef> {
        let t = self.float(x, "layer_norm")?;
        let g = self.float(gamma, "layer_norm")?;
        let b = self.float(beta, "layer_norm")?;

        let width = *t.shape().last().unwrap_or(&0);
        if g.shape() != [width] || b.shape() != [width] {
            return Err(ExportError::InvalidShape {
                reason: format!(
                    "LayerNorm parameters {:?}/{:?} do not match last axis {width}",
                    g.shape(),
                    b.shape()
                ),
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let n = width as f32;
        let mut data = Vec::with_capacity(t.size());
        for row in t.data().chunks_exact(width) {
            let mean: f32 = row.iter().sum::<f32>() / n;
            let var: f32 = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + eps).sqrt();
            for (i, &v) in row.iter().enumerate() {
                data.push((v - mean) / denom * g.data()[i] + b.data()[i]);
            }
        }

        let out = Tensor::from_vec(t.shape().to_vec(), data)?;
        Ok(self.record(
            Op::LayerNorm { eps },
            vec![x.0, gamma.0, beta.0],
            Value::F32(out),
        ))
    }

    /// GELU activation, tanh approximation
    ///
    /// # Errors
    ///
    /// Returns error on integer operands.
    pub fn gelu(&mut self, x: TraceRef) -> Result<TraceRef> {
        let t = self.float(x, "gelu")?;
        let sqrt_2_over_pi = (2.0f32 / std::f32::consts::PI).sqrt();
        let data: Vec<f32> = t
            .data()
            .iter()
            .map(|&v| 0.5 * v * (1.0 + (sqrt_2_over_pi * (v + 0.044_715 * v * v * v)).tanh()))
            .collect();
        let out = Tensor::from_vec(t.shape().to_vec(), data)?;
        Ok(self.record(Op::Gelu, vec![x.0], Value::F32(out)))
    }

    /// Softmax over the last axis, numerically stable
    ///
    /// # Errors
    ///
    /// Returns error on integer operands.
    pub fn softmax(&mut self, x: TraceRef) -> Result<TraceRef> {
        let t = self.float(x, "softmax")?;
        let width = *t.shape().last().unwrap_or(&0);

        let mut data = Vec::with_capacity(t.size());
        for row in t.data().chunks_exact(width) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            data.extend(exps.iter().map(|&e| e / sum));
        }

        let out = Tensor::from_vec(t.shape().to_vec(), data)?;
        Ok(self.record(Op::Softmax, vec![x.0], Value::F32(out)))
    }

    /// Close the trace and return the recorded graph and captured weights
    ///
    /// # Errors
    ///
    /// Returns error if the output handle does not refer to a float node.
    pub fn finish(self, output: TraceRef) -> Result<(Graph, Vec<WeightTensor>)> {
        if !matches!(self.values.get(output.0), Some(Value::F32(_))) {
            return Err(ExportError::UnsupportedOperation {
                operation: "finish".to_string(),
                reason: "graph output must be a float tensor".to_string(),
            });
        }
        Ok((
            Graph {
                nodes: self.nodes,
                output: output.0,
            },
            self.weights,
        ))
    }
}

// ============================================================================
// Kernels
// ============================================================================

/// Right-aligned broadcast of two shapes
fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(ExportError::InvalidShape {
                reason: format!("Cannot broadcast shapes {a:?} and {b:?}"),
            });
        };
    }
    Ok(out)
}

/// Row-major strides with zeros on broadcast axes
fn broadcast_strides(shape: &[usize], out_rank: usize) -> Vec<usize> {
    let mut strides = vec![0usize; out_rank];
    let offset = out_rank - shape.len();
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        strides[offset + i] = if shape[i] == 1 { 0 } else { stride };
        stride *= shape[i];
    }
    strides
}

fn broadcast_binary(
    a_shape: &[usize],
    a: &[f32],
    b_shape: &[usize],
    b: &[f32],
    f: fn(f32, f32) -> f32,
) -> Result<(Vec<usize>, Vec<f32>)> {
    let shape = broadcast_shapes(a_shape, b_shape)?;
    let rank = shape.len();
    let size: usize = shape.iter().product();

    let sa = broadcast_strides(a_shape, rank);
    let sb = broadcast_strides(b_shape, rank);

    let mut data = Vec::with_capacity(size);
    let mut coords = vec![0usize; rank];
    for _ in 0..size {
        let mut ia = 0;
        let mut ib = 0;
        for d in 0..rank {
            ia += coords[d] * sa[d];
            ib += coords[d] * sb[d];
        }
        data.push(f(a[ia], b[ib]));

        for d in (0..rank).rev() {
            coords[d] += 1;
            if coords[d] < shape[d] {
                break;
            }
            coords[d] = 0;
        }
    }
    Ok((shape, data))
}

/// Permute axes of a row-major buffer
fn permuted(shape: &[usize], data: &[f32], perm: &[usize]) -> Result<(Vec<usize>, Vec<f32>)> {
    let rank = shape.len();
    let mut seen = vec![false; rank];
    if perm.len() != rank || perm.iter().any(|&p| p >= rank || std::mem::replace(&mut seen[p], true)) {
        return Err(ExportError::InvalidShape {
            reason: format!("Invalid permutation {perm:?} for rank {rank}"),
        });
    }

    let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();

    let mut in_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        in_strides[i] = in_strides[i + 1] * shape[i + 1];
    }

    let size = data.len();
    let mut out = Vec::with_capacity(size);
    let mut coords = vec![0usize; rank];
    for _ in 0..size {
        let mut offset = 0;
        for d in 0..rank {
            offset += coords[d] * in_strides[perm[d]];
        }
        out.push(data[offset]);

        for d in (0..rank).rev() {
            coords[d] += 1;
            if coords[d] < out_shape[d] {
                break;
            }
            coords[d] = 0;
        }
    }
    Ok((out_shape, out))
}

/// Naive batched matmul: `[..., m, k] x [k, n]` or `[..., m, k] x [..., k, n]`
fn matmul_kernel(
    a_shape: &[usize],
    a: &[f32],
    b_shape: &[usize],
    b: &[f32],
) -> Result<(Vec<usize>, Vec<f32>)> {
    if a_shape.len() < 2 || b_shape.len() < 2 {
        return Err(ExportError::InvalidShape {
            reason: format!("MatMul requires rank >= 2, got {a_shape:?} x {b_shape:?}"),
        });
    }

    let m = a_shape[a_shape.len() - 2];
    let k = a_shape[a_shape.len() - 1];
    let kb = b_shape[b_shape.len() - 2];
    let n = b_shape[b_shape.len() - 1];

    if k != kb {
        return Err(ExportError::InvalidShape {
            reason: format!("MatMul inner dimensions disagree: {a_shape:?} x {b_shape:?}"),
        });
    }

    let batch: usize = a_shape[..a_shape.len() - 2].iter().product();
    let b_batched = b_shape.len() > 2;
    if b_batched && b_shape[..b_shape.len() - 2] != a_shape[..a_shape.len() - 2] {
        return Err(ExportError::InvalidShape {
            reason: format!("MatMul batch dimensions disagree: {a_shape:?} x {b_shape:?}"),
        });
    }

    let mut out = vec![0.0f32; batch * m * n];
    for bi in 0..batch {
        let a_base = bi * m * k;
        let b_base = if b_batched { bi * k * n } else { 0 };
        let o_base = bi * m * n;
        for i in 0..m {
            for p in 0..k {
                let av = a[a_base + i * k + p];
                if av == 0.0 {
                    continue;
                }
                let b_row = b_base + p * n;
                let o_row = o_base + i * n;
                for j in 0..n {
                    out[o_row + j] += av * b[b_row + j];
                }
            }
        }
    }

    let mut shape = a_shape[..a_shape.len() - 2].to_vec();
    shape.push(m);
    shape.push(n);
    Ok((shape, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(shape: Vec<usize>, data: Vec<f32>) -> Tensor<f32> {
        Tensor::from_vec(shape, data).unwrap()
    }

    #[test]
    fn test_broadcast_add_bias_row() {
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let b = tr.constant_f32(f32_tensor(vec![3], vec![10.0, 20.0, 30.0]));
        let c = tr.add(a, b).unwrap();
        let out = tr.float_value(c).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.data(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_broadcast_4d_mask_row() {
        // [1,2,2,3] + [1,1,1,3], the attention-bias pattern
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![1, 2, 2, 3], vec![0.0; 12]));
        let b = tr.constant_f32(f32_tensor(vec![1, 1, 1, 3], vec![0.0, -1.0, -2.0]));
        let c = tr.add(a, b).unwrap();
        let out = tr.float_value(c).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 3]);
        assert_eq!(&out.data()[..3], &[0.0, -1.0, -2.0]);
        assert_eq!(&out.data()[9..], &[0.0, -1.0, -2.0]);
    }

    #[test]
    fn test_broadcast_incompatible_shapes() {
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![2], vec![1.0, 2.0]));
        let b = tr.constant_f32(f32_tensor(vec![3], vec![1.0, 2.0, 3.0]));
        assert!(tr.add(a, b).is_err());
    }

    #[test]
    fn test_scalar_sub_broadcast() {
        // (1 - mask) over a [1,1,1,4] float tensor
        let mut tr = Tracer::new();
        let one = tr.constant_f32(f32_tensor(vec![1], vec![1.0]));
        let mask = tr.constant_f32(f32_tensor(vec![1, 1, 1, 4], vec![1.0, 1.0, 0.0, 1.0]));
        let inv = tr.sub(one, mask).unwrap();
        let out = tr.float_value(inv).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 4]);
        assert_eq!(out.data(), &[0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_matmul_2d() {
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let b = tr.constant_f32(f32_tensor(vec![3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]));
        let c = tr.matmul(a, b).unwrap();
        let out = tr.float_value(c).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_batched() {
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]));
        let b = tr.constant_f32(f32_tensor(vec![2, 2, 1], vec![1.0, 1.0, 2.0, 2.0]));
        let c = tr.matmul(a, b).unwrap();
        let out = tr.float_value(c).unwrap();
        assert_eq!(out.shape(), &[2, 1, 1]);
        assert_eq!(out.data(), &[3.0, 14.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![2, 3], vec![0.0; 6]));
        let b = tr.constant_f32(f32_tensor(vec![2, 2], vec![0.0; 4]));
        assert!(tr.matmul(a, b).is_err());
    }

    #[test]
    fn test_transpose_known_permutation() {
        let mut tr = Tracer::new();
        // [1,2,2,1] -> perm [0,2,1,3]
        let a = tr.constant_f32(f32_tensor(vec![1, 2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]));
        let t = tr.transpose(a, vec![0, 2, 1, 3]).unwrap();
        let out = tr.float_value(t).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 1]);
        assert_eq!(out.data(), &[1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_transpose_invalid_permutation() {
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![2, 2], vec![0.0; 4]));
        assert!(tr.transpose(a, vec![0, 0]).is_err());
        assert!(tr.transpose(a, vec![0]).is_err());
    }

    #[test]
    fn test_gather_rows() {
        let mut tr = Tracer::new();
        let table = tr.constant_f32(f32_tensor(
            vec![3, 2],
            vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1],
        ));
        let idx = tr.constant_i32(Tensor::from_vec(vec![1, 2], vec![2, 0]).unwrap());
        let g = tr.gather(table, idx).unwrap();
        let out = tr.float_value(g).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out.data(), &[2.0, 2.1, 0.0, 0.1]);
    }

    #[test]
    fn test_gather_out_of_range() {
        let mut tr = Tracer::new();
        let table = tr.constant_f32(f32_tensor(vec![2, 1], vec![0.0, 1.0]));
        let idx = tr.constant_i32(Tensor::from_vec(vec![1], vec![5]).unwrap());
        assert!(tr.gather(table, idx).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut tr = Tracer::new();
        let a = tr.constant_f32(f32_tensor(vec![2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]));
        let s = tr.softmax(a).unwrap();
        let out = tr.float_value(s).unwrap();
        let row0: f32 = out.data()[..3].iter().sum();
        let row1: f32 = out.data()[3..].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!((row1 - 1.0).abs() < 1e-6);
        assert!((out.data()[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let mut tr = Tracer::new();
        let x = tr.constant_f32(f32_tensor(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]));
        let g = tr.constant_f32(f32_tensor(vec![4], vec![1.0; 4]));
        let b = tr.constant_f32(f32_tensor(vec![4], vec![0.0; 4]));
        let y = tr.layer_norm(x, g, b, 1e-12).unwrap();
        let out = tr.float_value(y).unwrap();
        let mean: f32 = out.data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!(out.data()[0] < 0.0 && out.data()[3] > 0.0);
    }

    #[test]
    fn test_integer_arithmetic_rejected() {
        let mut tr = Tracer::new();
        let a = tr.constant_i32(Tensor::from_vec(vec![2], vec![1, 2]).unwrap());
        let b = tr.constant_i32(Tensor::from_vec(vec![2], vec![3, 4]).unwrap());
        let err = tr.add(a, b).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_weight_deduplication() {
        let mut tr = Tracer::new();
        let w = f32_tensor(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let r1 = tr.weight("shared", &w);
        let r2 = tr.weight("shared", &w);
        assert_eq!(r1, r2);
        assert_eq!(tr.node_count(), 1);
    }

    #[test]
    fn test_finish_records_output_and_inputs() {
        let mut tr = Tracer::new();
        let ids = tr.input_i32("input_ids", Tensor::from_vec(vec![1, 2], vec![0, 1]).unwrap());
        let table = tr.weight("emb", &f32_tensor(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]));
        let g = tr.gather(table, ids).unwrap();
        let (graph, weights) = tr.finish(g).unwrap();

        assert_eq!(graph.input_nodes().len(), 1);
        assert_eq!(graph.output_node().shape, vec![1, 2, 2]);
        assert_eq!(weights.len(), 1);
        assert_eq!(weights[0].name, "emb");
    }

    #[test]
    fn test_finish_rejects_integer_output() {
        let mut tr = Tracer::new();
        let ids = tr.input_i32("input_ids", Tensor::from_vec(vec![1, 2], vec![0, 1]).unwrap());
        assert!(tr.finish(ids).is_err());
    }
}
