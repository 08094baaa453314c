//! Simulated multi-rank training
//!
//! Ranks live in one process: each owns a flat parameter and gradient
//! buffer, and collectives run over those buffers with deterministic tree
//! reductions. Hybrid jobs arrange `dp_degree × sharding_degree` ranks as
//! contiguous sharding groups and strided data-parallel groups.

pub mod comm;
pub mod grad_sync;
pub mod model;
pub mod optimizer;
pub mod runtime;
pub mod topology;
pub mod zero;

pub use comm::{ProcessGroup, ReduceOp};
pub use grad_sync::{all_reduce_grads, broadcast_params};
pub use model::{DistributedModel, wrap_model_for_distribution};
pub use optimizer::{
    DistributedOptimizer, ReplicatedAdamW, StepOutcome, wrap_optimizer_for_distribution,
};
pub use runtime::{DistributedRuntime, RuntimeHandle, initialize_distributed_runtime};
pub use topology::Topology;
pub use zero::{PartitionPolicy, ShardPartition, ZeroStage1};
