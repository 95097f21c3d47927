//! Post-training weight quantization
//!
//! Rewrites eligible f32 weight tensors of a converted package to 8-bit
//! signed integers under a linear (affine, symmetric) scheme: one scale
//! per tensor, zero point 0. Activations and intermediate computations
//! stay in f32 — this is weight-only quantization. Tensor names and
//! logical shapes are unchanged; only the storage representation moves.
//!
//! Quantization is lossy and one-way. The retained scale reconstructs an
//! approximation bounded by half a quantization step per element.

use crate::error::{ExportError, Result};
use crate::graph::{WeightPayload, WeightTensor};
use crate::package::ModelPackage;

/// Tensors below this element count stay in f32
///
/// Biases and LayerNorm parameters are tiny and disproportionately
/// sensitive to rounding; skipping them costs almost no package size.
pub const MIN_QUANT_ELEMENTS: usize = 256;

/// Quantize a single f32 buffer to int8 with a symmetric per-tensor scale
///
/// Returns `(scale, zero_point, values)`; `zero_point` is always 0 under
/// the symmetric scheme but is retained as explicit metadata.
///
/// # Errors
///
/// Returns error if the buffer is empty or contains non-finite values.
pub fn affine_quantize(name: &str, values: &[f32]) -> Result<(f32, i32, Vec<i8>)> {
    if values.is_empty() {
        return Err(ExportError::QuantizeError {
            tensor: name.to_string(),
            reason: "empty tensor".to_string(),
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ExportError::QuantizeError {
            tensor: name.to_string(),
            reason: "non-finite values".to_string(),
        });
    }

    let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);

    // Near-zero tensors get a minimal scale instead of dividing by zero.
    let scale = if max_abs > 1e-10 {
        max_abs / 127.0
    } else {
        1.0 / 127.0
    };

    let quants = values
        .iter()
        .map(|&v| {
            let q = (v / scale).round();
            #[allow(clippy::cast_possible_truncation)]
            let q = q.clamp(-128.0, 127.0) as i8;
            q
        })
        .collect();

    Ok((scale, 0, quants))
}

/// Reconstruct f32 values from a quantized payload
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn dequantize(scale: f32, zero_point: i32, data: &[i8]) -> Vec<f32> {
    data.iter()
        .map(|&q| (f32::from(q) - zero_point as f32) * scale)
        .collect()
}

/// Whether a weight tensor is eligible for quantization
fn eligible(weight: &WeightTensor) -> bool {
    matches!(weight.payload, WeightPayload::F32(_)) && weight.size() >= MIN_QUANT_ELEMENTS
}

/// Quantize every eligible weight tensor of a package
///
/// Consumes the converted package and returns the quantized one; the
/// original is discardable after this point. Tensor count, names, and
/// shapes are preserved exactly.
///
/// # Errors
///
/// Returns error if any eligible tensor is empty or non-finite.
pub fn quantize_weights(mut package: ModelPackage) -> Result<ModelPackage> {
    for weight in &mut package.weights {
        if !eligible(weight) {
            continue;
        }
        let WeightPayload::F32(values) = &weight.payload else {
            continue;
        };
        let (scale, zero_point, data) = affine_quantize(&weight.name, values)?;
        weight.payload = WeightPayload::Int8 {
            scale,
            zero_point,
            data,
        };
    }
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{convert, ConvertOptions};
    use crate::model::testutil::{tiny_config, tiny_model};
    use crate::trace::trace;
    use crate::wrapper::StaticShapeWrapper;

    use proptest::prelude::*;

    #[test]
    fn test_affine_quantize_full_range() {
        let values = vec![-1.0f32, 0.0, 0.5, 1.0];
        let (scale, zero_point, quants) = affine_quantize("t", &values).unwrap();
        assert_eq!(zero_point, 0);
        assert!((scale - 1.0 / 127.0).abs() < 1e-9);
        assert_eq!(quants[0], -127);
        assert_eq!(quants[1], 0);
        assert_eq!(quants[3], 127);
    }

    #[test]
    fn test_affine_quantize_empty_rejected() {
        let err = affine_quantize("t", &[]).unwrap_err();
        assert!(matches!(err, ExportError::QuantizeError { .. }));
    }

    #[test]
    fn test_affine_quantize_nan_rejected() {
        let err = affine_quantize("t", &[1.0, f32::NAN]).unwrap_err();
        assert!(matches!(err, ExportError::QuantizeError { .. }));
    }

    #[test]
    fn test_near_zero_tensor_gets_minimal_scale() {
        let (scale, _, quants) = affine_quantize("t", &[0.0; 8]).unwrap();
        assert!((scale - 1.0 / 127.0).abs() < 1e-9);
        assert!(quants.iter().all(|&q| q == 0));
    }

    #[test]
    fn test_quantize_preserves_tensor_topology() {
        let config = tiny_config();
        let model = tiny_model(config);
        let wrapper = StaticShapeWrapper::new(&model, 8).unwrap();
        let traced = trace(&wrapper).unwrap();
        let package = convert("m", &traced, &ConvertOptions::masked_lm(8)).unwrap();

        let before: Vec<(String, Vec<usize>)> = package
            .weights
            .iter()
            .map(|w| (w.name.clone(), w.shape.clone()))
            .collect();

        let quantized = quantize_weights(package).unwrap();

        let after: Vec<(String, Vec<usize>)> = quantized
            .weights
            .iter()
            .map(|w| (w.name.clone(), w.shape.clone()))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_quantize_skips_small_tensors() {
        let config = tiny_config();
        let model = tiny_model(config);
        let wrapper = StaticShapeWrapper::new(&model, 8).unwrap();
        let traced = trace(&wrapper).unwrap();
        let package = convert("m", &traced, &ConvertOptions::masked_lm(8)).unwrap();
        let quantized = quantize_weights(package).unwrap();

        for w in &quantized.weights {
            match &w.payload {
                WeightPayload::Int8 { .. } => assert!(w.size() >= MIN_QUANT_ELEMENTS),
                WeightPayload::F32(_) => assert!(w.size() < MIN_QUANT_ELEMENTS),
            }
        }
        // The big embedding table must have been converted.
        let word = quantized
            .weights
            .iter()
            .find(|w| w.name == "embeddings.word_embeddings.weight")
            .unwrap();
        assert!(matches!(word.payload, WeightPayload::Int8 { .. }));
    }

    proptest! {
        #[test]
        fn prop_dequantized_error_bounded(values in proptest::collection::vec(-100.0f32..100.0, 1..64)) {
            let (scale, zero_point, quants) = affine_quantize("t", &values).unwrap();
            let recovered = dequantize(scale, zero_point, &quants);
            for (orig, rec) in values.iter().zip(&recovered) {
                // Half a quantization step, plus float slack.
                prop_assert!((orig - rec).abs() <= scale * 0.5 + 1e-6);
            }
        }
    }
}
