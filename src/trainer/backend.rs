//! Training backend interface
//!
//! The harness drives training only through these two traits. A backend
//! reports which precision modes and world sizes it can run, and launches
//! one independent [`TrainingSession`] per configuration.

use crate::data::Batch;
use crate::error::{Error, Result};
use crate::nn::ModelSnapshot;
use crate::trainer::config::{PrecisionMode, TrainingConfig, TrainingConfiguration};

/// A framework able to train the reference model under a configuration
pub trait TrainingBackend: Sync {
    type Session: TrainingSession;

    /// Short name for logs and reports.
    fn name(&self) -> &str;

    /// Whether the execution environment supports `precision`.
    fn capability_available(&self, precision: PrecisionMode) -> bool;

    /// Largest world size the backend can launch.
    fn max_world_size(&self) -> usize;

    /// Reject `config` with `CapabilityUnavailable` before any training starts.
    fn check_capabilities(&self, config: &TrainingConfiguration) -> Result<()> {
        if !self.capability_available(config.precision()) {
            return Err(Error::CapabilityUnavailable {
                reason: format!("{} is not supported by backend {}", config.precision(), self.name()),
            });
        }
        if config.world_size() > self.max_world_size() {
            return Err(Error::CapabilityUnavailable {
                reason: format!(
                    "{} needs {} ranks, backend {} provides {}",
                    config.strategy(),
                    config.world_size(),
                    self.name(),
                    self.max_world_size()
                ),
            });
        }
        Ok(())
    }

    /// Start a fresh session: model from `snapshot`, new optimizer state.
    fn launch(
        &self,
        config: &TrainingConfiguration,
        snapshot: &ModelSnapshot,
        training: &TrainingConfig,
    ) -> Result<Self::Session>;
}

/// One training job in progress
pub trait TrainingSession {
    /// Forward pass on one micro-batch, returning the scalar loss.
    fn forward(&mut self, batch: &Batch) -> Result<f32>;

    /// Backpropagate the last forward, accumulating gradients.
    fn backward(&mut self) -> Result<()>;

    /// Apply one optimizer step with the accumulated gradients.
    fn optimizer_step(&mut self) -> Result<()>;

    fn clear_gradients(&mut self) -> Result<()>;
}
