//! Distributed runtime bootstrap
//!
//! Builds the process groups of one training job from its parallel
//! strategy. Every job gets its own runtime; nothing is process-global.

use std::sync::Arc;

use tracing::debug;

use crate::distributed::comm::ProcessGroup;
use crate::distributed::topology::Topology;
use crate::error::{Error, Result};
use crate::trainer::config::ParallelStrategy;

/// Process groups of one job
#[derive(Debug)]
pub struct DistributedRuntime {
    strategy: ParallelStrategy,
    topology: Topology,
    global: ProcessGroup,
    dp_groups: Vec<ProcessGroup>,
    sharding_groups: Vec<ProcessGroup>,
}

/// Shared handle to a job's runtime
pub type RuntimeHandle = Arc<DistributedRuntime>;

/// Bootstrap the process groups for `strategy`.
pub fn initialize_distributed_runtime(strategy: &ParallelStrategy) -> Result<RuntimeHandle> {
    let topology = Topology::from_strategy(strategy)?;
    let global = ProcessGroup::new((0..topology.world_size()).collect())?;
    let dp_groups = topology
        .dp_groups()
        .into_iter()
        .map(ProcessGroup::new)
        .collect::<Result<Vec<_>>>()?;
    let sharding_groups = topology
        .sharding_groups()
        .into_iter()
        .map(ProcessGroup::new)
        .collect::<Result<Vec<_>>>()?;

    debug!(
        strategy = %strategy,
        world_size = topology.world_size(),
        "initialized distributed runtime"
    );

    Ok(Arc::new(DistributedRuntime {
        strategy: *strategy,
        topology,
        global,
        dp_groups,
        sharding_groups,
    }))
}

impl DistributedRuntime {
    pub fn strategy(&self) -> ParallelStrategy {
        self.strategy
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn world_size(&self) -> usize {
        self.topology.world_size()
    }

    /// Whether optimizer state is partitioned.
    pub fn is_sharded(&self) -> bool {
        self.strategy.is_sharded()
    }

    /// Group of all ranks.
    pub fn global_group(&self) -> &ProcessGroup {
        &self.global
    }

    pub fn dp_groups(&self) -> &[ProcessGroup] {
        &self.dp_groups
    }

    pub fn sharding_groups(&self) -> &[ProcessGroup] {
        &self.sharding_groups
    }

    /// Sharding group containing `rank`.
    pub fn sharding_group_of(&self, rank: usize) -> Result<&ProcessGroup> {
        let (dp_idx, _) = self.topology.coords(rank)?;
        self.sharding_groups.get(dp_idx).ok_or_else(|| Error::DistributedError {
            reason: format!("no sharding group for rank {rank}"),
        })
    }

    /// Data-parallel group containing `rank`.
    pub fn dp_group_of(&self, rank: usize) -> Result<&ProcessGroup> {
        let (_, shard_idx) = self.topology.coords(rank)?;
        self.dp_groups.get(shard_idx).ok_or_else(|| Error::DistributedError {
            reason: format!("no data-parallel group for rank {rank}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hybrid_runtime_groups() {
        let rt = initialize_distributed_runtime(&ParallelStrategy::ShardingStage1 {
            sharding_degree: 2,
            dp_degree: 2,
        })
        .unwrap();
        assert_eq!(rt.world_size(), 4);
        assert!(rt.is_sharded());
        assert_eq!(rt.sharding_group_of(3).unwrap().ranks(), &[2, 3]);
        assert_eq!(rt.dp_group_of(3).unwrap().ranks(), &[1, 3]);
        assert_eq!(rt.global_group().size(), 4);
    }

    #[test]
    fn test_data_parallel_runtime() {
        let rt = initialize_distributed_runtime(&ParallelStrategy::DataParallel { dp_degree: 4 })
            .unwrap();
        assert!(!rt.is_sharded());
        assert_eq!(rt.dp_groups().len(), 1);
        assert_eq!(rt.dp_groups()[0].ranks(), &[0, 1, 2, 3]);
        assert!(rt.sharding_groups().iter().all(|g| g.size() == 1));
    }

    #[test]
    fn test_rank_out_of_range() {
        let rt = initialize_distributed_runtime(&ParallelStrategy::DataParallel { dp_degree: 2 })
            .unwrap();
        assert!(rt.dp_group_of(2).is_err());
    }
}
