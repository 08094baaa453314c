//! Replicated model across simulated ranks
//!
//! Each rank owns a copy of the flat parameter buffer and an accumulated
//! gradient buffer. Every rank runs forward/backward on its own replica
//! (in parallel via rayon); with every rank consuming the same batch, the
//! replicas must agree on the loss bit for bit.

use rayon::prelude::*;

use crate::data::Batch;
use crate::distributed::grad_sync::broadcast_params;
use crate::distributed::runtime::RuntimeHandle;
use crate::error::{Error, Result};
use crate::nn::{ForwardPass, Mlp, ParamLayout};
use crate::optimizer::grad_accumulator::{GradAccumulator, accumulate_into};
use crate::trainer::amp::AmpPolicy;

/// A model wrapped for data-parallel execution
pub struct DistributedModel {
    runtime: RuntimeHandle,
    mlp: Mlp,
    amp: AmpPolicy,
    params: Vec<Vec<f32>>,
    grads: Vec<Vec<f32>>,
    pending: Option<Vec<ForwardPass>>,
    accumulator: GradAccumulator,
}

/// Replicate `params` to every rank of `runtime` (broadcast from rank 0).
pub fn wrap_model_for_distribution(
    mlp: Mlp,
    params: Vec<f32>,
    amp: AmpPolicy,
    runtime: RuntimeHandle,
) -> Result<DistributedModel> {
    mlp.layout().check_len(params.len())?;
    let world = runtime.world_size();
    let numel = params.len();

    let mut replicas = Vec::with_capacity(world);
    replicas.push(params);
    replicas.extend((1..world).map(|_| vec![0.0f32; numel]));
    broadcast_params(runtime.global_group(), &mut replicas, 0)?;

    let accumulator = GradAccumulator::new(1)?;

    Ok(DistributedModel {
        runtime,
        mlp,
        amp,
        params: replicas,
        grads: vec![vec![0.0f32; numel]; world],
        pending: None,
        accumulator,
    })
}

impl DistributedModel {
    /// Number of micro-batches per optimizer step.
    pub fn with_grad_accum_steps(mut self, steps: usize) -> Result<Self> {
        self.accumulator = GradAccumulator::new(steps)?;
        Ok(self)
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    pub fn layout(&self) -> &ParamLayout {
        self.mlp.layout()
    }

    pub fn amp(&self) -> AmpPolicy {
        self.amp
    }

    pub fn world_size(&self) -> usize {
        self.params.len()
    }

    /// Parameters held by `rank`.
    pub fn params(&self, rank: usize) -> Result<&[f32]> {
        self.params.get(rank).map(Vec::as_slice).ok_or_else(|| Error::DistributedError {
            reason: format!("no replica for rank {rank}"),
        })
    }

    /// Accumulated gradients held by `rank`.
    pub fn grads(&self, rank: usize) -> Result<&[f32]> {
        self.grads.get(rank).map(Vec::as_slice).ok_or_else(|| Error::DistributedError {
            reason: format!("no gradient buffer for rank {rank}"),
        })
    }

    /// Per-rank parameter and gradient buffers, for optimizers.
    pub(crate) fn buffers_mut(&mut self) -> (&mut [Vec<f32>], &mut [Vec<f32>]) {
        (self.params.as_mut_slice(), self.grads.as_mut_slice())
    }

    /// Micro-batches accumulated since the last optimizer step.
    pub fn accumulated_steps(&self) -> usize {
        self.accumulator.current_step()
    }

    /// Whether the current accumulation window is full.
    pub fn window_complete(&self) -> bool {
        self.accumulator.current_step() >= self.accumulator.accum_steps()
    }

    /// Whether every rank holds bit-identical parameters.
    pub fn replicas_in_sync(&self) -> bool {
        match self.params.split_first() {
            Some((first, rest)) => rest.iter().all(|p| {
                p.iter().zip(first).all(|(a, b)| a.to_bits() == b.to_bits())
            }),
            None => true,
        }
    }

    /// Run forward on every rank and return the (common) loss.
    pub fn forward(&mut self, batch: &Batch) -> Result<f32> {
        let mlp = &self.mlp;
        let amp = self.amp;
        let passes = self
            .params
            .par_iter()
            .map(|params| mlp.forward(params, &batch.inputs, amp))
            .collect::<Result<Vec<_>>>()?;

        let loss = passes
            .first()
            .map(ForwardPass::loss)
            .ok_or_else(|| Error::DistributedError {
                reason: "runtime has no ranks".to_string(),
            })?;
        for (rank, pass) in passes.iter().enumerate() {
            if pass.loss().to_bits() != loss.to_bits() {
                return Err(Error::DistributedError {
                    reason: format!(
                        "replica divergence: rank {rank} loss {} != rank 0 loss {loss}",
                        pass.loss()
                    ),
                });
            }
        }

        self.pending = Some(passes);
        Ok(loss)
    }

    /// Backpropagate the last forward with `d(loss) = loss_scale`, adding
    /// into each rank's gradient buffer.
    pub fn backward(&mut self, loss_scale: f64) -> Result<()> {
        let passes = self.pending.take().ok_or_else(|| Error::TrainingError {
            reason: "backward called without a preceding forward".to_string(),
        })?;
        let mlp = &self.mlp;
        let amp = self.amp;
        let numel = mlp.layout().total_numel();

        self.params
            .par_iter()
            .zip(self.grads.par_iter_mut())
            .zip(passes.par_iter())
            .try_for_each(|((params, acc), pass)| -> Result<()> {
                let mut micro = vec![0.0f32; numel];
                mlp.backward(params, pass, loss_scale, &mut micro, amp)?;
                amp.store_grads(&mut micro);
                accumulate_into(acc, &micro, amp)
            })?;

        self.accumulator.record();
        Ok(())
    }

    /// Average the accumulated gradients over the micro-batches of the
    /// current window and start a new one.
    pub fn finish_accumulation(&mut self) -> Result<()> {
        let factor = self.accumulator.finish_window()?;
        if factor != 1.0 {
            let amp = self.amp;
            self.grads.par_iter_mut().for_each(|g| {
                for v in g.iter_mut() {
                    *v *= factor;
                }
                amp.store_grads(g);
            });
        }
        Ok(())
    }

    /// Zero every rank's gradients and drop any pending forward.
    pub fn clear_gradients(&mut self) {
        self.grads.par_iter_mut().for_each(|g| g.fill(0.0));
        self.pending = None;
        self.accumulator.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::runtime::initialize_distributed_runtime;
    use crate::nn::{MlpConfig, ModelSnapshot};
    use crate::trainer::config::{ParallelStrategy, PrecisionMode};
    use ndarray::Array2;

    fn model(world: usize) -> DistributedModel {
        let config = MlpConfig::new(4);
        let snap = ModelSnapshot::init_mlp(&config, 5).unwrap();
        let mlp = Mlp::new(config).unwrap();
        let rt = initialize_distributed_runtime(&ParallelStrategy::DataParallel { dp_degree: world })
            .unwrap();
        wrap_model_for_distribution(mlp, snap.flatten(), AmpPolicy::new(PrecisionMode::Fp32), rt)
            .unwrap()
    }

    fn batch() -> Batch {
        Batch::new(Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32 * 0.1))
    }

    #[test]
    fn test_wrap_replicates_params() {
        let m = model(3);
        assert_eq!(m.world_size(), 3);
        assert!(m.replicas_in_sync());
        assert_eq!(m.params(0).unwrap(), m.params(2).unwrap());
        assert!(m.params(3).is_err());
    }

    #[test]
    fn test_forward_backward_accumulates() {
        let mut m = model(2).with_grad_accum_steps(2).unwrap();
        let loss = m.forward(&batch()).unwrap();
        assert!(loss.is_finite());
        m.backward(1.0).unwrap();
        let once = m.grads(0).unwrap().to_vec();
        assert_eq!(m.grads(1).unwrap(), &once[..]);

        assert!(!m.window_complete());
        m.forward(&batch()).unwrap();
        m.backward(1.0).unwrap();
        assert_eq!(m.accumulated_steps(), 2);
        assert!(m.window_complete());

        m.finish_accumulation().unwrap();
        assert_eq!(m.accumulated_steps(), 0);
        // two identical micro-batches averaged back to one
        assert_eq!(m.grads(0).unwrap(), &once[..]);
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut m = model(1);
        assert!(m.backward(1.0).is_err());
        m.forward(&batch()).unwrap();
        m.backward(1.0).unwrap();
        assert!(m.backward(1.0).is_err());
    }

    #[test]
    fn test_clear_gradients() {
        let mut m = model(2);
        m.forward(&batch()).unwrap();
        m.backward(1.0).unwrap();
        m.clear_gradients();
        assert!(m.grads(1).unwrap().iter().all(|&g| g == 0.0));
        assert_eq!(m.accumulated_steps(), 0);
        assert!(m.finish_accumulation().is_err());
    }

    #[test]
    fn test_forward_detects_divergent_replicas() {
        let mut m = model(2);
        let (params, _) = m.buffers_mut();
        // shift rank 1's output bias so its relu output strictly grows
        let len = params[1].len();
        for v in &mut params[1][len - 10..] {
            *v += 10.0;
        }
        assert!(matches!(
            m.forward(&batch()),
            Err(Error::DistributedError { .. })
        ));
    }
}
