//! Loss scaling for reduced-precision training
//!
//! GradScaler multiplies the loss gradient by a scale factor before backward,
//! then divides gradients by that factor before clipping and the optimizer
//! step. If NaN/Inf is detected, the step is skipped and a dynamic scale is
//! reduced.
//!
//! bf16 has the same exponent range as fp32, so only fixed scaling is used
//! with it. A power-of-two scale commutes exactly with bf16 rounding.

use crate::error::{Error, Result};

/// Loss scaler with optional dynamic adjustment
///
/// Maintains a scale factor that grows when training is stable and shrinks
/// when overflow is detected. A fixed scaler never changes its scale.
#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    consecutive_ok: u64,
    dynamic: bool,
}

impl GradScaler {
    /// Create a new GradScaler with dynamic scaling parameters.
    ///
    /// # Arguments
    /// * `initial_scale` - Starting loss scale (e.g., 2^16 = 65536)
    /// * `growth_factor` - Multiply scale by this after `growth_interval` clean steps (e.g., 2.0)
    /// * `backoff_factor` - Multiply scale by this on overflow (e.g., 0.5)
    /// * `growth_interval` - Number of consecutive clean steps before growing scale
    pub fn new(
        initial_scale: f64,
        growth_factor: f64,
        backoff_factor: f64,
        growth_interval: u64,
    ) -> Result<Self> {
        if !(initial_scale.is_finite() && initial_scale > 0.0) {
            return Err(Error::TrainingError {
                reason: format!("initial_scale must be positive and finite, got {initial_scale}"),
            });
        }
        if growth_factor <= 1.0 {
            return Err(Error::TrainingError {
                reason: format!("growth_factor must be > 1.0, got {growth_factor}"),
            });
        }
        if backoff_factor <= 0.0 || backoff_factor >= 1.0 {
            return Err(Error::TrainingError {
                reason: format!("backoff_factor must be in (0, 1), got {backoff_factor}"),
            });
        }
        if growth_interval == 0 {
            return Err(Error::TrainingError {
                reason: "growth_interval must be > 0".to_string(),
            });
        }

        Ok(Self {
            scale: initial_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            consecutive_ok: 0,
            dynamic: true,
        })
    }

    /// Freeze the current scale: `update_scale` becomes a no-op.
    pub fn fixed(mut self) -> Self {
        self.dynamic = false;
        self
    }

    /// Create with sensible defaults: scale=65536, grow=2x, backoff=0.5x, interval=2000
    pub fn default_fp16() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            consecutive_ok: 0,
            dynamic: true,
        }
    }

    /// Get the current loss scale factor.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Scale a loss value before backward pass.
    pub fn scale_loss(&self, loss: f64) -> f64 {
        loss * self.scale
    }

    /// Unscale a gradient buffer in place and check for NaN/Inf.
    ///
    /// Returns `true` if any element is non-finite after unscaling; the
    /// caller must then skip the optimizer step.
    pub fn unscale(&self, grads: &mut [f32]) -> bool {
        let inv_scale = (1.0 / self.scale) as f32;
        let mut found_inf = false;
        for g in grads.iter_mut() {
            *g *= inv_scale;
            found_inf |= !g.is_finite();
        }
        found_inf
    }

    /// Update the scale factor after an optimizer step.
    ///
    /// Call with `overflow=true` if `unscale` found non-finite gradients.
    /// Call with `overflow=false` after a successful optimizer step.
    pub fn update_scale(&mut self, overflow: bool) {
        if !self.dynamic {
            return;
        }
        if overflow {
            self.scale *= self.backoff_factor;
            self.consecutive_ok = 0;
        } else {
            self.consecutive_ok += 1;
            if self.consecutive_ok >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.consecutive_ok = 0;
            }
        }
    }
}
