//! ZeRO Stage 1: optimizer state sharded across each sharding group
//!
//! Each rank of a sharding group only stores AdamW `m`/`v` (and the fp32
//! master copy, when enabled) for the parameters it owns. A step:
//!
//! 1. averages gradients over each data-parallel group,
//! 2. reduces every parameter's gradient to its owner inside the sharding group,
//! 3. unscales owned gradients and max-reduces the overflow flag,
//! 4. assembles the global norm from owners' per-parameter contributions,
//! 5. runs AdamW on owned parameters only,
//! 6. broadcasts each updated parameter from its owner.
//!
//! With a single-rank sharding group this degenerates to plain AdamW.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distributed::comm::ReduceOp;
use crate::distributed::grad_sync::all_reduce_grads;
use crate::distributed::model::DistributedModel;
use crate::distributed::optimizer::{
    DistributedOptimizer, StepOutcome, clip_owned, step_owned, store_all_grads, unscale_owned,
};
use crate::distributed::runtime::RuntimeHandle;
use crate::error::{Error, Result};
use crate::nn::ParamLayout;
use crate::optimizer::grad_clip::{global_norm, squared_norm};
use crate::optimizer::{AdamW, GradScaler};

/// How parameters are assigned to shard owners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Each parameter, in order, goes to the shard holding the fewest
    /// elements so far (lowest shard index on ties).
    #[default]
    Greedy,
    /// Parameter `i` goes to shard `i % degree`.
    RoundRobin,
}

/// Owner assignment of every parameter in a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPartition {
    degree: usize,
    owners: Vec<usize>,
    loads: Vec<usize>,
}

impl ShardPartition {
    pub fn new(layout: &ParamLayout, degree: usize, policy: PartitionPolicy) -> Result<Self> {
        if degree == 0 {
            return Err(Error::InvalidArgument {
                arg: "degree",
                reason: "sharding degree must be at least 1".to_string(),
            });
        }

        let mut owners = Vec::with_capacity(layout.len());
        let mut loads = vec![0usize; degree];
        for (i, entry) in layout.entries().iter().enumerate() {
            let owner = match policy {
                PartitionPolicy::RoundRobin => i % degree,
                PartitionPolicy::Greedy => loads
                    .iter()
                    .enumerate()
                    .min_by_key(|&(shard, &load)| (load, shard))
                    .map_or(0, |(shard, _)| shard),
            };
            loads[owner] += entry.numel();
            owners.push(owner);
        }

        Ok(Self {
            degree,
            owners,
            loads,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Shard owning parameter `index`.
    pub fn owner(&self, index: usize) -> Result<usize> {
        self.owners.get(index).copied().ok_or_else(|| Error::InvalidArgument {
            arg: "index",
            reason: format!("parameter {index} out of range ({} params)", self.owners.len()),
        })
    }

    /// Parameter indices owned by `shard`, in layout order.
    pub fn owned_by(&self, shard: usize) -> Vec<usize> {
        self.owners
            .iter()
            .enumerate()
            .filter(|&(_, &o)| o == shard)
            .map(|(i, _)| i)
            .collect()
    }

    /// Elements assigned to each shard.
    pub fn loads(&self) -> &[usize] {
        &self.loads
    }
}

/// Sharding stage 1 AdamW over every rank of a hybrid job
pub struct ZeroStage1 {
    runtime: RuntimeHandle,
    layout: ParamLayout,
    partition: ShardPartition,
    optimizers: Vec<AdamW>,
    /// Owned parameter indices per global rank
    owned: Vec<Vec<usize>>,
    max_grad_norm: Option<f64>,
}

impl ZeroStage1 {
    pub fn new(
        optimizer: AdamW,
        runtime: RuntimeHandle,
        layout: &ParamLayout,
        policy: PartitionPolicy,
    ) -> Result<Self> {
        let topology = runtime.topology();
        let partition = ShardPartition::new(layout, topology.sharding_degree(), policy)?;

        let owned = (0..topology.world_size())
            .map(|rank| {
                let (_, shard) = topology.coords(rank)?;
                Ok(partition.owned_by(shard))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            strategy = %runtime.strategy(),
            policy = ?policy,
            loads = ?partition.loads(),
            "partitioned optimizer state"
        );

        Ok(Self {
            optimizers: vec![optimizer; topology.world_size()],
            runtime,
            layout: layout.clone(),
            partition,
            owned,
            max_grad_norm: None,
        })
    }

    pub fn with_max_grad_norm(mut self, max_grad_norm: Option<f64>) -> Self {
        self.max_grad_norm = max_grad_norm;
        self
    }

    pub fn partition(&self) -> &ShardPartition {
        &self.partition
    }

    /// Parameter indices whose optimizer state lives on `rank`.
    pub fn owned_params(&self, rank: usize) -> Option<&[usize]> {
        self.owned.get(rank).map(Vec::as_slice)
    }

    /// Optimizer state held by `rank`, in f32 elements.
    pub fn state_numel(&self, rank: usize) -> Option<usize> {
        self.optimizers.get(rank).map(AdamW::state_numel)
    }

    pub fn rank_optimizer(&self, rank: usize) -> Option<&AdamW> {
        self.optimizers.get(rank)
    }

    fn check_layout(&self, model: &DistributedModel) -> Result<()> {
        if model.layout() != &self.layout || model.world_size() != self.optimizers.len() {
            return Err(Error::ConfigurationMismatch {
                reason: "sharded optimizer was built for a different model or runtime".to_string(),
            });
        }
        Ok(())
    }

    /// Global norm as seen by every rank: each sharding group gathers its
    /// owners' per-parameter squared norms and sums them in layout order.
    fn owned_norms(&self, grads: &[Vec<f32>]) -> Result<Vec<f64>> {
        let mut contributions = Vec::with_capacity(grads.len());
        for (g, indices) in grads.iter().zip(&self.owned) {
            let mut part = Vec::with_capacity(indices.len());
            for &i in indices {
                part.push((i, squared_norm(self.layout.slice(g, i)?)));
            }
            contributions.push(part);
        }

        let mut norms = vec![0.0f64; grads.len()];
        for group in self.runtime.sharding_groups() {
            let mut per_param = vec![0.0f64; self.layout.len()];
            for (i, sq) in group.all_gather(&contributions)? {
                per_param[i] = sq;
            }
            let norm = global_norm(&per_param);
            for &rank in group.ranks() {
                norms[rank] = norm;
            }
        }
        Ok(norms)
    }
}

impl DistributedOptimizer for ZeroStage1 {
    fn step(&mut self, model: &mut DistributedModel, scaler: Option<&mut GradScaler>) -> Result<StepOutcome> {
        self.check_layout(model)?;
        let runtime = self.runtime.clone();
        let layout = &self.layout;
        let amp = model.amp();
        let (params, grads) = model.buffers_mut();

        for group in runtime.dp_groups() {
            all_reduce_grads(group, grads)?;
        }
        store_all_grads(grads, amp);

        for group in runtime.sharding_groups() {
            for i in 0..layout.len() {
                let owner = group.global_rank(self.partition.owner(i)?)?;
                group.reduce(grads, layout.range(i)?, owner, ReduceOp::Avg)?;
            }
        }
        store_all_grads(grads, amp);

        if let Some(scaler) = scaler {
            if unscale_owned(&runtime, grads, layout, &self.owned, scaler)? {
                scaler.update_scale(true);
                return Ok(StepOutcome::skipped());
            }
            scaler.update_scale(false);
        }

        let grad_norm = match self.max_grad_norm {
            Some(max_norm) => {
                let norms = self.owned_norms(grads)?;
                clip_owned(grads, layout, &self.owned, &norms, max_norm, amp)?;
                norms.first().copied()
            }
            None => None,
        };

        step_owned(&mut self.optimizers, params, grads, layout, &self.owned)?;

        for group in runtime.sharding_groups() {
            for i in 0..layout.len() {
                let owner = group.global_rank(self.partition.owner(i)?)?;
                group.broadcast(params, layout.range(i)?, owner)?;
            }
        }

        Ok(StepOutcome {
            skipped: false,
            grad_norm,
        })
    }

    fn timestep(&self) -> u64 {
        self.optimizers.first().map_or(0, AdamW::timestep)
    }
}
