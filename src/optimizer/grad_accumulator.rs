//! Gradient accumulation across micro-batches
//!
//! Enables effective large batch training by summing gradients from
//! multiple smaller forward/backward passes before applying an optimizer step.
//! The sum is averaged over the window when the step is taken.

use crate::error::{Error, Result};
use crate::trainer::amp::AmpPolicy;

/// Counts micro-batches within one accumulation window
///
/// Gradient buffers live with the model replicas; this only tracks how many
/// backward passes have been added since the last optimizer step.
///
/// ```ignore
/// let mut accum = GradAccumulator::new(4)?;
/// for batch in loader {
///     model.forward(&batch)?;
///     model.backward()?;
///     if accum.record() {
///         let factor = accum.finish_window()?;
///         // scale summed gradients by `factor`, then step
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct GradAccumulator {
    accum_steps: usize,
    current_step: usize,
}

impl GradAccumulator {
    pub fn new(accum_steps: usize) -> Result<Self> {
        if accum_steps == 0 {
            return Err(Error::TrainingError {
                reason: "accum_steps must be > 0".to_string(),
            });
        }
        Ok(Self {
            accum_steps,
            current_step: 0,
        })
    }

    /// Record one micro-batch. Returns `true` once the window is full.
    pub fn record(&mut self) -> bool {
        self.current_step += 1;
        self.current_step >= self.accum_steps
    }

    /// Close the window and return the averaging factor `1 / n` for the
    /// `n` micro-batches it holds.
    pub fn finish_window(&mut self) -> Result<f32> {
        if self.current_step == 0 {
            return Err(Error::TrainingError {
                reason: "optimizer step without any accumulated gradients".to_string(),
            });
        }
        let factor = (1.0 / self.current_step as f64) as f32;
        self.current_step = 0;
        Ok(factor)
    }

    pub fn accum_steps(&self) -> usize {
        self.accum_steps
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn reset(&mut self) {
        self.current_step = 0;
    }
}

/// Add one micro-batch gradient into an accumulation buffer, then cast the
/// buffer to the gradient storage dtype.
pub fn accumulate_into(acc: &mut [f32], grads: &[f32], amp: AmpPolicy) -> Result<()> {
    if acc.len() != grads.len() {
        return Err(Error::TrainingError {
            reason: format!(
                "gradient length mismatch: buffer {} vs update {}",
                acc.len(),
                grads.len()
            ),
        });
    }
    for (a, g) in acc.iter_mut().zip(grads) {
        *a += *g;
    }
    amp.store_grads(acc);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::amp::round_bf16;
    use crate::trainer::config::PrecisionMode;

    #[test]
    fn test_record_until_full() {
        let mut accum = GradAccumulator::new(3).unwrap();
        assert!(!accum.record());
        assert_eq!(accum.current_step(), 1);
        assert!(!accum.record());
        assert!(accum.record());
        assert_eq!(accum.current_step(), 3);
    }

    #[test]
    fn test_finish_window_averages_and_resets() {
        let mut accum = GradAccumulator::new(2).unwrap();
        accum.record();
        accum.record();
        assert_eq!(accum.finish_window().unwrap(), 0.5);
        assert_eq!(accum.current_step(), 0);

        // next window starts fresh
        assert!(!accum.record());
        assert_eq!(accum.current_step(), 1);
    }

    #[test]
    fn test_single_step_factor_is_identity() {
        let mut accum = GradAccumulator::new(1).unwrap();
        assert!(accum.record());
        assert_eq!(accum.finish_window().unwrap(), 1.0);
    }

    #[test]
    fn test_finish_empty_window_errors() {
        let mut accum = GradAccumulator::new(2).unwrap();
        assert!(accum.finish_window().is_err());
    }

    #[test]
    fn test_reset() {
        let mut accum = GradAccumulator::new(3).unwrap();
        accum.record();
        accum.reset();
        assert_eq!(accum.current_step(), 0);
    }

    #[test]
    fn test_new_rejects_zero_steps() {
        assert!(GradAccumulator::new(0).is_err());
    }

    #[test]
    fn test_accumulate_into_sums() {
        let amp = AmpPolicy::new(PrecisionMode::Fp32);
        let mut acc = vec![2.0f32, 4.0];
        accumulate_into(&mut acc, &[6.0, 8.0], amp).unwrap();
        assert_eq!(acc, vec![8.0, 12.0]);
        assert!(accumulate_into(&mut acc, &[1.0], amp).is_err());
    }

    #[test]
    fn test_accumulate_into_rounds_bf16_buffers() {
        let tiny = 2f32.powi(-10);
        let mut acc = vec![1.0f32];
        accumulate_into(&mut acc, &[tiny], AmpPolicy::new(PrecisionMode::PureBf16 { main_grad: false }))
            .unwrap();
        assert_eq!(acc[0], round_bf16(1.0 + tiny));
        assert_eq!(acc[0], 1.0);

        let mut acc = vec![1.0f32];
        accumulate_into(&mut acc, &[tiny], AmpPolicy::new(PrecisionMode::PureBf16 { main_grad: true }))
            .unwrap();
        assert_eq!(acc[0], 1.0 + tiny);
    }
}
