//! Optimizers over a [`DistributedModel`]
//!
//! Two step paths share the same unscale → clip → AdamW pipeline:
//!
//! - [`ReplicatedAdamW`]: plain data parallel. Gradients are averaged over
//!   all ranks and every rank updates every parameter of its replica.
//! - [`ZeroStage1`](super::zero::ZeroStage1): optimizer state partitioned
//!   over each sharding group, created by [`wrap_optimizer_for_distribution`].

use rayon::prelude::*;

use crate::distributed::comm::ReduceOp;
use crate::distributed::grad_sync::all_reduce_grads;
use crate::distributed::model::DistributedModel;
use crate::distributed::runtime::{DistributedRuntime, RuntimeHandle};
use crate::distributed::zero::{PartitionPolicy, ZeroStage1};
use crate::error::{Error, Result};
use crate::nn::ParamLayout;
use crate::optimizer::grad_clip::{clip_coefficient, global_norm, param_squared_norms, scale_in_place};
use crate::optimizer::{AdamW, GradScaler};
use crate::trainer::amp::AmpPolicy;

/// What one optimizer step did
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Non-finite gradients were found after unscaling; parameters unchanged.
    pub skipped: bool,
    /// Global gradient norm before clipping, when clipping is enabled.
    pub grad_norm: Option<f64>,
}

impl StepOutcome {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            grad_norm: None,
        }
    }
}

/// Optimizer driving every rank of a distributed model
pub trait DistributedOptimizer: Send {
    /// Synchronize gradients, then update parameters on every rank.
    ///
    /// With a `scaler`, gradients are unscaled first and the step is
    /// skipped if any rank sees a non-finite value.
    fn step(&mut self, model: &mut DistributedModel, scaler: Option<&mut GradScaler>) -> Result<StepOutcome>;

    /// Number of optimizer steps applied (skipped steps excluded).
    fn timestep(&self) -> u64;
}

/// Wrap `optimizer` for sharding stage 1 with the default greedy partition.
///
/// Only valid when the runtime partitions optimizer state.
pub fn wrap_optimizer_for_distribution(
    optimizer: AdamW,
    runtime: &RuntimeHandle,
    layout: &ParamLayout,
) -> Result<ZeroStage1> {
    if !runtime.is_sharded() {
        return Err(Error::InvalidConfiguration {
            reason: format!(
                "{} does not partition optimizer state; use a replicated optimizer",
                runtime.strategy()
            ),
        });
    }
    ZeroStage1::new(optimizer, runtime.clone(), layout, PartitionPolicy::Greedy)
}

/// Data-parallel AdamW: one full optimizer per rank
pub struct ReplicatedAdamW {
    runtime: RuntimeHandle,
    optimizers: Vec<AdamW>,
    max_grad_norm: Option<f64>,
}

impl ReplicatedAdamW {
    pub fn new(optimizer: AdamW, runtime: RuntimeHandle) -> Self {
        let optimizers = vec![optimizer; runtime.world_size()];
        Self {
            runtime,
            optimizers,
            max_grad_norm: None,
        }
    }

    pub fn with_max_grad_norm(mut self, max_grad_norm: Option<f64>) -> Self {
        self.max_grad_norm = max_grad_norm;
        self
    }

    /// Optimizer of `rank`.
    pub fn rank_optimizer(&self, rank: usize) -> Option<&AdamW> {
        self.optimizers.get(rank)
    }
}

impl DistributedOptimizer for ReplicatedAdamW {
    fn step(&mut self, model: &mut DistributedModel, scaler: Option<&mut GradScaler>) -> Result<StepOutcome> {
        let runtime = self.runtime.clone();
        let layout = model.layout().clone();
        let amp = model.amp();
        let (params, grads) = model.buffers_mut();

        all_reduce_grads(runtime.global_group(), grads)?;
        store_all_grads(grads, amp);

        let all: Vec<usize> = (0..layout.len()).collect();
        let owned = vec![all; runtime.world_size()];

        if let Some(scaler) = scaler {
            if unscale_owned(&runtime, grads, &layout, &owned, scaler)? {
                scaler.update_scale(true);
                return Ok(StepOutcome::skipped());
            }
            scaler.update_scale(false);
        }

        let grad_norm = match self.max_grad_norm {
            Some(max_norm) => {
                let norms = grads
                    .iter()
                    .map(|g| param_squared_norms(g, &layout).map(|sq| global_norm(&sq)))
                    .collect::<Result<Vec<f64>>>()?;
                clip_owned(grads, &layout, &owned, &norms, max_norm, amp)?;
                norms.first().copied()
            }
            None => None,
        };

        step_owned(&mut self.optimizers, params, grads, &layout, &owned)?;

        Ok(StepOutcome {
            skipped: false,
            grad_norm,
        })
    }

    fn timestep(&self) -> u64 {
        self.optimizers.first().map_or(0, AdamW::timestep)
    }
}

pub(crate) fn store_all_grads(grads: &mut [Vec<f32>], amp: AmpPolicy) {
    if amp.grads_bf16() {
        grads.par_iter_mut().for_each(|g| amp.store_grads(g));
    }
}

/// Unscale each rank's owned gradients; the overflow flag is max-reduced
/// over the world so every rank skips together.
pub(crate) fn unscale_owned(
    runtime: &DistributedRuntime,
    grads: &mut [Vec<f32>],
    layout: &ParamLayout,
    owned: &[Vec<usize>],
    scaler: &GradScaler,
) -> Result<bool> {
    let mut flags = Vec::with_capacity(grads.len());
    for (g, indices) in grads.iter_mut().zip(owned) {
        let mut found_inf = false;
        for &i in indices {
            found_inf |= scaler.unscale(layout.slice_mut(g, i)?);
        }
        flags.push(vec![if found_inf { 1.0f32 } else { 0.0 }]);
    }
    runtime.global_group().all_reduce(&mut flags, 0..1, ReduceOp::Max)?;
    Ok(flags.first().is_some_and(|f| f[0] > 0.0))
}

/// Clip each rank's owned gradients using the global norm that rank computed.
pub(crate) fn clip_owned(
    grads: &mut [Vec<f32>],
    layout: &ParamLayout,
    owned: &[Vec<usize>],
    norms: &[f64],
    max_norm: f64,
    amp: AmpPolicy,
) -> Result<()> {
    for ((g, indices), &norm) in grads.iter_mut().zip(owned).zip(norms) {
        if let Some(coefficient) = clip_coefficient(norm, max_norm)? {
            for &i in indices {
                let slice = layout.slice_mut(g, i)?;
                scale_in_place(slice, coefficient);
                amp.store_grads(slice);
            }
        }
    }
    Ok(())
}

/// Run every rank's AdamW on its owned parameters, in parallel.
pub(crate) fn step_owned(
    optimizers: &mut [AdamW],
    params: &mut [Vec<f32>],
    grads: &[Vec<f32>],
    layout: &ParamLayout,
    owned: &[Vec<usize>],
) -> Result<()> {
    optimizers
        .par_iter_mut()
        .zip(params.par_iter_mut())
        .zip(grads.par_iter())
        .zip(owned.par_iter())
        .try_for_each(|(((opt, p), g), indices)| opt.step(p, g, layout, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::distributed::model::wrap_model_for_distribution;
    use crate::distributed::runtime::initialize_distributed_runtime;
    use crate::nn::{Mlp, MlpConfig, ModelSnapshot};
    use crate::optimizer::AdamWConfig;
    use crate::trainer::config::{ParallelStrategy, PrecisionMode};
    use ndarray::Array2;

    fn setup(dp: usize) -> (DistributedModel, RuntimeHandle) {
        let config = MlpConfig::new(4);
        let snap = ModelSnapshot::init_mlp(&config, 9).unwrap();
        let rt = initialize_distributed_runtime(&ParallelStrategy::DataParallel { dp_degree: dp }).unwrap();
        let model = wrap_model_for_distribution(
            Mlp::new(config).unwrap(),
            snap.flatten(),
            AmpPolicy::new(PrecisionMode::Fp32),
            rt.clone(),
        )
        .unwrap();
        (model, rt)
    }

    fn batch() -> Batch {
        Batch::new(Array2::from_shape_fn((2, 4), |(i, j)| 0.25 + (i + j) as f32 * 0.5))
    }

    fn adamw() -> AdamW {
        AdamW::new(AdamWConfig {
            lr: 1e-2,
            weight_decay: 0.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_replicated_step_keeps_replicas_in_sync() {
        let (mut model, rt) = setup(2);
        let mut opt = ReplicatedAdamW::new(adamw(), rt).with_max_grad_norm(Some(1.0));

        model.forward(&batch()).unwrap();
        model.backward(1.0).unwrap();
        model.finish_accumulation().unwrap();
        let outcome = opt.step(&mut model, None).unwrap();

        assert!(!outcome.skipped);
        assert!(outcome.grad_norm.is_some());
        assert_eq!(opt.timestep(), 1);
        assert!(model.replicas_in_sync());
        assert_eq!(opt.rank_optimizer(1).unwrap().timestep(), 1);
    }

    #[test]
    fn test_overflow_skips_step() {
        let (mut model, rt) = setup(2);
        let before = model.params(0).unwrap().to_vec();
        let mut opt = ReplicatedAdamW::new(adamw(), rt);
        let mut scaler = GradScaler::new(1024.0, 2.0, 0.5, 10).unwrap();

        model.forward(&batch()).unwrap();
        model.backward(1.0).unwrap();
        model.finish_accumulation().unwrap();
        {
            let (_, grads) = model.buffers_mut();
            grads[1][0] = f32::INFINITY;
        }
        let outcome = opt.step(&mut model, Some(&mut scaler)).unwrap();

        assert!(outcome.skipped);
        assert_eq!(opt.timestep(), 0);
        assert_eq!(scaler.scale(), 512.0);
        assert_eq!(model.params(0).unwrap(), &before[..]);
        assert_eq!(model.params(1).unwrap(), &before[..]);
    }

    #[test]
    fn test_wrap_requires_sharded_runtime() {
        let (model, rt) = setup(2);
        assert!(wrap_optimizer_for_distribution(adamw(), &rt, model.layout()).is_err());
    }
}
