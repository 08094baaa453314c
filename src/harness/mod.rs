//! Loss-equivalence harness
//!
//! Runs one training job under several configurations declared equivalent
//! and compares their per-step losses.
//!
//! ```ignore
//! let run = RunSpec::default();
//! let snapshot = run.init_snapshot()?;
//! let harness = EquivalenceHarness::new(ReferenceBackend::default(), run.clone());
//! let report = harness.run(&snapshot, &stage1_suite(&run)?)?;
//! println!("{report}");
//! ```

pub mod claim;
pub mod config;
pub mod report;
pub mod runner;
pub mod suite;
pub mod trace;

pub use claim::{Comparison, EquivalenceClaim, compare_traces};
pub use config::{HarnessOptions, RunSpec};
pub use report::{ClaimOutcome, ClaimReport, FailureKind, HarnessReport};
pub use runner::EquivalenceHarness;
pub use suite::{ClaimFile, stage1_suite};
pub use trace::LossTrace;
