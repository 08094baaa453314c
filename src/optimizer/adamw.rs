//! AdamW optimizer
//!
//! Implements decoupled weight decay regularization (Loshchilov & Hutter, 2019)
//! over flat parameter buffers. State is keyed by parameter index in a
//! [`ParamLayout`], so a sharded owner can hold state for a subset only.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::nn::layout::ParamLayout;
use crate::trainer::amp::round_bf16;

/// AdamW configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Per-parameter optimizer state
#[derive(Debug, Clone)]
struct ParamState {
    m: Vec<f32>,
    v: Vec<f32>,
    /// fp32 master copy when parameters are stored as bf16
    master: Option<Vec<f32>>,
}

/// AdamW optimizer with decoupled weight decay
///
/// Maintains first moment (m) and second moment (v) estimates per parameter.
/// State is lazily initialized on the first `step()` that touches a parameter.
///
/// With multi-precision enabled, the update runs on an fp32 master copy and
/// the stored parameter is the master rounded to bf16.
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    state: HashMap<usize, ParamState>,
    timestep: u64,
    multi_precision: bool,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
            timestep: 0,
            multi_precision: false,
        }
    }

    pub fn with_multi_precision(mut self, enabled: bool) -> Self {
        self.multi_precision = enabled;
        self
    }

    /// Perform one optimization step on the parameters listed in `indices`.
    ///
    /// `params` and `grads` are full flat buffers matching `layout`. Only
    /// the listed parameters are read, updated and given optimizer state.
    /// The timestep advances even if `indices` is empty, so every shard
    /// owner stays on the same bias-correction schedule.
    pub fn step(
        &mut self,
        params: &mut [f32],
        grads: &[f32],
        layout: &ParamLayout,
        indices: &[usize],
    ) -> Result<()> {
        layout.check_len(params.len())?;
        layout.check_len(grads.len())?;

        self.timestep += 1;
        let t = i32::try_from(self.timestep).map_err(|_| Error::TrainingError {
            reason: format!("timestep {} overflows", self.timestep),
        })?;

        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;

        // Bias correction factors
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);

        // lr * sqrt(1 - beta2^t) / (1 - beta1^t), eps scaled to match
        let step_size = (self.config.lr * bc2.sqrt() / bc1) as f32;
        let eps_hat = (self.config.eps * bc2.sqrt()) as f32;
        let decay = (1.0 - self.config.lr * self.config.weight_decay) as f32;
        let b1 = beta1 as f32;
        let b2 = beta2 as f32;
        let one_minus_b1 = (1.0 - beta1) as f32;
        let one_minus_b2 = (1.0 - beta2) as f32;

        for &index in indices {
            let range = layout.range(index)?;
            let param = &mut params[range.clone()];
            let grad = &grads[range];

            let multi_precision = self.multi_precision;
            let state = self.state.entry(index).or_insert_with(|| ParamState {
                m: vec![0.0; param.len()],
                v: vec![0.0; param.len()],
                master: multi_precision.then(|| param.to_vec()),
            });

            let ParamState { m, v, master } = state;
            let weights: &mut [f32] = match master.as_mut() {
                Some(master) => master,
                None => &mut *param,
            };

            for i in 0..weights.len() {
                let g = grad[i];
                let mut w = weights[i] * decay;
                m[i] = b1 * m[i] + one_minus_b1 * g;
                v[i] = b2 * v[i] + one_minus_b2 * g * g;
                w -= step_size * m[i] / (v[i].sqrt() + eps_hat);
                weights[i] = w;
            }

            if let Some(master) = master.as_ref() {
                for (p, w) in param.iter_mut().zip(master) {
                    *p = round_bf16(*w);
                }
            }
        }

        Ok(())
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Whether optimizer state exists for parameter `index`.
    pub fn has_state(&self, index: usize) -> bool {
        self.state.contains_key(&index)
    }

    /// Number of f32 values held as optimizer state (moments and masters).
    pub fn state_numel(&self) -> usize {
        self.state
            .values()
            .map(|s| s.m.len() + s.v.len() + s.master.as_ref().map_or(0, Vec::len))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(len: usize) -> ParamLayout {
        ParamLayout::new([("w", vec![len])]).unwrap()
    }

    #[test]
    fn test_adamw_default_config() {
        let config = AdamWConfig::default();
        assert_eq!(config.lr, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.eps, 1e-8);
        assert_eq!(config.weight_decay, 0.01);
    }

    #[test]
    fn test_adamw_single_step() {
        let layout = single(4);
        let mut params = vec![1.0f32, 2.0, 3.0, 4.0];
        let grads = vec![0.5f32, -0.5, 0.25, 0.0];

        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&mut params, &grads, &layout, &[0]).unwrap();

        assert_eq!(opt.timestep(), 1);
        assert_ne!(params, vec![1.0, 2.0, 3.0, 4.0], "params should change after step");
        // first step moves each param by ~lr against the gradient sign
        assert!(params[0] < 1.0);
        assert!(params[1] > 2.0);
    }

    #[test]
    fn test_adamw_multiple_steps_decrease_loss() {
        // minimize ||w - target||^2
        let layout = single(4);
        let target = [1.0f32, 0.0, 0.0, 1.0];
        let mut w = vec![0.0f32; 4];

        let config = AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = AdamW::new(config);

        let loss = |w: &[f32]| -> f32 {
            w.iter().zip(&target).map(|(a, b)| (a - b) * (a - b)).sum::<f32>() / 4.0
        };
        let first_loss = loss(&w);
        for _ in 0..20 {
            let grads: Vec<f32> = w.iter().zip(&target).map(|(a, b)| (a - b) / 2.0).collect();
            opt.step(&mut w, &grads, &layout, &[0]).unwrap();
        }
        let last_loss = loss(&w);

        assert!(
            last_loss < first_loss * 0.1,
            "loss should decrease significantly: first={first_loss} last={last_loss}"
        );
        assert!((w[0] - 1.0).abs() < 0.3, "w[0] should approach 1.0, got {}", w[0]);
    }

    #[test]
    fn test_adamw_weight_decay() {
        let layout = single(2);
        let mut params = vec![5.0f32, 5.0];
        let grads = vec![0.0f32; 2];

        let config = AdamWConfig {
            lr: 0.1,
            weight_decay: 0.1,
            ..Default::default()
        };
        let mut opt = AdamW::new(config);
        opt.step(&mut params, &grads, &layout, &[0]).unwrap();

        // zero grad: only decay applies, 5.0 * (1 - 0.1 * 0.1)
        assert!((params[0] - 4.95).abs() < 1e-6, "got {}", params[0]);
    }

    #[test]
    fn test_adamw_state_only_for_stepped_indices() {
        let layout = ParamLayout::new([("a", vec![2]), ("b", vec![3])]).unwrap();
        let mut params = vec![1.0f32; 5];
        let grads = vec![0.1f32; 5];

        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&mut params, &grads, &layout, &[1]).unwrap();

        assert!(!opt.has_state(0));
        assert!(opt.has_state(1));
        assert_eq!(opt.state_numel(), 6);
        // untouched parameter keeps its value
        assert_eq!(&params[..2], &[1.0, 1.0]);
        assert_ne!(&params[2..], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_adamw_empty_step_advances_timestep() {
        let layout = single(1);
        let mut params = vec![1.0f32];
        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&mut params, &[1.0], &layout, &[]).unwrap();
        assert_eq!(opt.timestep(), 1);
        assert_eq!(params, vec![1.0]);
    }

    #[test]
    fn test_adamw_multi_precision_keeps_master() {
        let layout = single(1);
        let mut params = vec![1.0f32];
        let config = AdamWConfig {
            lr: 1e-4,
            weight_decay: 0.0,
            ..Default::default()
        };

        let mut opt = AdamW::new(config.clone()).with_multi_precision(true);
        for _ in 0..3 {
            opt.step(&mut params, &[1.0], &layout, &[0]).unwrap();
        }
        // three ~1e-4 steps are below bf16 resolution at 1.0
        assert_eq!(params[0], 1.0);
        assert_eq!(opt.state_numel(), 3);

        let mut plain = vec![1.0f32];
        let mut opt = AdamW::new(config);
        for _ in 0..3 {
            opt.step(&mut plain, &[1.0], &layout, &[0]).unwrap();
        }
        assert!(plain[0] < 1.0);
    }

    #[test]
    fn test_adamw_rejects_mismatched_buffers() {
        let layout = single(2);
        let mut params = vec![1.0f32];
        let mut opt = AdamW::new(AdamWConfig::default());
        assert!(opt.step(&mut params, &[0.0, 0.0], &layout, &[0]).is_err());
    }
}
