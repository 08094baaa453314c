//! Mixed precision (AMP) policy
//!
//! bf16 is emulated on the host: values stay in `f32` buffers but are
//! rounded to the nearest bf16 (round-to-nearest-even, via `half`) wherever
//! the real kernels would produce or store a bf16 tensor. This keeps the
//! numerics of autocast (O1) and pure-bf16 (O2) training bit-reproducible
//! on any CPU.
//!
//! | mode        | params | compute | grad buffers         | optimizer     |
//! |-------------|--------|---------|----------------------|---------------|
//! | `Fp32`      | f32    | f32     | f32                  | f32           |
//! | `Bf16`      | f32    | bf16    | f32                  | f32           |
//! | `PureBf16`  | bf16   | bf16    | bf16 (f32 main grad) | f32 master    |

use half::bf16;
use ndarray::{Array, Dimension};

use crate::trainer::config::PrecisionMode;

/// Round one value to bf16 precision.
#[inline]
pub fn round_bf16(x: f32) -> f32 {
    bf16::from_f32(x).to_f32()
}

/// Round a slice to bf16 precision in place.
pub fn round_slice_bf16(values: &mut [f32]) {
    for v in values.iter_mut() {
        *v = round_bf16(*v);
    }
}

/// Where bf16 rounding applies for one precision mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmpPolicy {
    mode: PrecisionMode,
}

impl AmpPolicy {
    pub fn new(mode: PrecisionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> PrecisionMode {
        self.mode
    }

    /// Weights, inputs, activations, loss and per-micro-batch gradients are bf16.
    pub fn compute_bf16(&self) -> bool {
        self.mode.requires_bf16()
    }

    /// Parameters are stored as bf16; the optimizer keeps an fp32 master copy.
    pub fn params_bf16(&self) -> bool {
        matches!(self.mode, PrecisionMode::PureBf16 { .. })
    }

    /// Accumulated gradient buffers are bf16 (re-rounded after every update).
    pub fn grads_bf16(&self) -> bool {
        matches!(self.mode, PrecisionMode::PureBf16 { main_grad: false })
    }

    /// Initial parameters are cast to bf16 and back before training starts.
    pub fn rounds_initial_params(&self) -> bool {
        self.compute_bf16()
    }

    /// Cast a value to the compute dtype.
    #[inline]
    pub fn compute(&self, x: f32) -> f32 {
        if self.compute_bf16() {
            round_bf16(x)
        } else {
            x
        }
    }

    /// Cast an array to the compute dtype in place.
    pub fn cast_compute<D: Dimension>(&self, values: &mut Array<f32, D>) {
        if self.compute_bf16() {
            values.mapv_inplace(round_bf16);
        }
    }

    /// Cast a gradient buffer to the gradient storage dtype in place.
    pub fn store_grads(&self, values: &mut [f32]) {
        if self.grads_bf16() {
            round_slice_bf16(values);
        }
    }

    /// Cast a parameter buffer to the parameter storage dtype in place.
    pub fn store_params(&self, values: &mut [f32]) {
        if self.params_bf16() {
            round_slice_bf16(values);
        }
    }
}
