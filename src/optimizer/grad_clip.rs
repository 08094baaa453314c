//! Gradient clipping utilities
//!
//! Clip gradients by global norm to prevent exploding gradients during training.
//!
//! The global norm is always assembled from per-parameter squared norms
//! (accumulated in f64) summed in canonical parameter order. A sharded
//! optimizer that only holds some gradients gathers the same per-parameter
//! values and sums them in the same order, so the clip coefficient does not
//! depend on how parameters are partitioned.

use crate::error::{Error, Result};
use crate::nn::layout::ParamLayout;

/// Sum of squares of one gradient, accumulated in f64.
pub fn squared_norm(values: &[f32]) -> f64 {
    values.iter().map(|&v| (v as f64) * (v as f64)).sum()
}

/// Global L2 norm from per-parameter squared norms, summed in slice order.
pub fn global_norm(per_param_squared: &[f64]) -> f64 {
    per_param_squared.iter().sum::<f64>().sqrt()
}

/// Multiplier to apply to every gradient, or `None` if no clipping is needed.
///
/// The coefficient is `max_norm / norm`, used only when `norm > max_norm`.
pub fn clip_coefficient(norm: f64, max_norm: f64) -> Result<Option<f32>> {
    if max_norm <= 0.0 {
        return Err(Error::TrainingError {
            reason: format!("max_norm must be positive, got {max_norm}"),
        });
    }
    if norm > max_norm {
        Ok(Some((max_norm / norm) as f32))
    } else {
        Ok(None)
    }
}

/// Multiply a gradient buffer by `coefficient` in place.
pub fn scale_in_place(values: &mut [f32], coefficient: f32) {
    for v in values.iter_mut() {
        *v *= coefficient;
    }
}

/// Per-parameter squared norms of a full flat gradient buffer.
pub fn param_squared_norms(grads: &[f32], layout: &ParamLayout) -> Result<Vec<f64>> {
    (0..layout.len())
        .map(|i| layout.slice(grads, i).map(squared_norm))
        .collect()
}

/// Clip a full flat gradient buffer in place by global L2 norm.
///
/// Returns the original global norm (before clipping).
pub fn clip_grad_norm(grads: &mut [f32], layout: &ParamLayout, max_norm: f64) -> Result<f64> {
    let total_norm = global_norm(&param_squared_norms(grads, layout)?);
    if let Some(coefficient) = clip_coefficient(total_norm, max_norm)? {
        scale_in_place(grads, coefficient);
    }
    Ok(total_norm)
}
