//! # shardcheck
//!
//! **Loss-equivalence checks for sharded data-parallel training.**
//!
//! shardcheck trains one small job under several configurations that should
//! be numerically identical (sharding stage 1 with and without extra
//! data parallelism, plain data parallelism, mixed precision, gradient
//! accumulation, loss scaling) and compares their per-step losses bit for
//! bit.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  harness    claims, runs, trace comparison, reports     │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ TrainingBackend / TrainingSession
//! ┌──────────────────────────▼──────────────────────────────┐
//! │  trainer    configurations, AMP, reference backend     │
//! ├─────────────────────────────────────────────────────────┤
//! │  distributed  topology, collectives, ZeRO stage 1       │
//! │  optimizer    AdamW, clipping, scaling, accumulation    │
//! │  nn / data    MLP, snapshots, seeded synthetic data     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Closed configurations**: [`TrainingConfiguration`] is a set of tagged
//!   variants validated at construction; inconsistent flag combinations are
//!   rejected before anything runs.
//! - **Scoped seeds**: every run owns its data generator; nothing global.
//! - **Deterministic collectives**: simulated ranks reduce in a fixed tree
//!   order, so equivalent configurations can be compared exactly.
//! - **Skip, never pass**: a configuration the backend cannot run skips its
//!   claims.

pub mod data;
pub mod distributed;
pub mod error;
pub mod harness;
pub mod nn;
pub mod optimizer;
pub mod trainer;

pub use error::{Error, Result};
pub use harness::{
    ClaimOutcome, Comparison, EquivalenceClaim, EquivalenceHarness, HarnessOptions, HarnessReport,
    LossTrace, RunSpec, stage1_suite,
};
pub use nn::ModelSnapshot;
pub use trainer::{
    DeviceCapabilities, LossScaleStrategy, ParallelStrategy, PrecisionMode, ReferenceBackend,
    TrainingBackend, TrainingConfig, TrainingConfiguration, TrainingSession,
};
