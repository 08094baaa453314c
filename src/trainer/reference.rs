//! In-process reference backend
//!
//! Simulates every rank of a job inside the current process: replicated
//! MLP forward/backward on rayon, deterministic collectives, emulated bf16
//! and either the replicated or the sharded AdamW.

use tracing::debug;

use crate::data::Batch;
use crate::distributed::{
    DistributedModel, DistributedOptimizer, PartitionPolicy, ReplicatedAdamW, StepOutcome,
    ZeroStage1, initialize_distributed_runtime, wrap_model_for_distribution,
    wrap_optimizer_for_distribution,
};
use crate::error::Result;
use crate::nn::{Mlp, ModelSnapshot};
use crate::optimizer::{AdamW, AdamWConfig, GradScaler};
use crate::trainer::amp::{AmpPolicy, round_slice_bf16};
use crate::trainer::backend::{TrainingBackend, TrainingSession};
use crate::trainer::config::{PrecisionMode, TrainingConfig, TrainingConfiguration};

/// What the simulated execution environment supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub bf16: bool,
    pub max_world_size: usize,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            bf16: true,
            max_world_size: usize::MAX,
        }
    }
}

/// Backend running all ranks in this process
#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend {
    capabilities: DeviceCapabilities,
    partition: PartitionPolicy,
}

impl ReferenceBackend {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            partition: PartitionPolicy::default(),
        }
    }

    /// Owner assignment used by sharded configurations.
    pub fn with_partition_policy(mut self, policy: PartitionPolicy) -> Self {
        self.partition = policy;
        self
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }
}

impl TrainingBackend for ReferenceBackend {
    type Session = ReferenceSession;

    fn name(&self) -> &str {
        "reference"
    }

    fn capability_available(&self, precision: PrecisionMode) -> bool {
        !precision.requires_bf16() || self.capabilities.bf16
    }

    fn max_world_size(&self) -> usize {
        self.capabilities.max_world_size
    }

    fn launch(
        &self,
        config: &TrainingConfiguration,
        snapshot: &ModelSnapshot,
        training: &TrainingConfig,
    ) -> Result<ReferenceSession> {
        self.check_capabilities(config)?;
        training.validate()?;

        let amp = AmpPolicy::new(config.precision());
        let mlp = Mlp::from_layout(snapshot.layout()?)?;
        let mut params = snapshot.flatten();
        if amp.rounds_initial_params() {
            round_slice_bf16(&mut params);
        }

        let runtime = initialize_distributed_runtime(&config.strategy())?;
        let model = wrap_model_for_distribution(mlp, params, amp, runtime.clone())?
            .with_grad_accum_steps(config.grad_accum_steps())?;

        let adamw = AdamW::new(AdamWConfig {
            lr: training.learning_rate,
            weight_decay: training.weight_decay,
            ..AdamWConfig::default()
        })
        .with_multi_precision(amp.params_bf16());

        let optimizer: Box<dyn DistributedOptimizer> = if runtime.is_sharded() {
            let zero = if self.partition == PartitionPolicy::Greedy {
                wrap_optimizer_for_distribution(adamw, &runtime, model.layout())?
            } else {
                ZeroStage1::new(adamw, runtime.clone(), model.layout(), self.partition)?
            };
            Box::new(zero.with_max_grad_norm(training.max_grad_norm))
        } else {
            Box::new(ReplicatedAdamW::new(adamw, runtime.clone()).with_max_grad_norm(training.max_grad_norm))
        };

        debug!(config = %config, backend = self.name(), "launched session");

        Ok(ReferenceSession {
            config_id: config.id(),
            model,
            optimizer,
            scaler: config.loss_scale().to_grad_scaler()?,
            last_outcome: None,
        })
    }
}

/// A job running on the [`ReferenceBackend`]
pub struct ReferenceSession {
    config_id: String,
    model: DistributedModel,
    optimizer: Box<dyn DistributedOptimizer>,
    scaler: Option<GradScaler>,
    last_outcome: Option<StepOutcome>,
}

impl ReferenceSession {
    pub fn model(&self) -> &DistributedModel {
        &self.model
    }

    /// Optimizer steps applied so far.
    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer.timestep()
    }

    /// Current loss scale, if loss scaling is enabled.
    pub fn loss_scale(&self) -> Option<f64> {
        self.scaler.as_ref().map(GradScaler::scale)
    }

    pub fn last_outcome(&self) -> Option<StepOutcome> {
        self.last_outcome
    }
}

impl TrainingSession for ReferenceSession {
    fn forward(&mut self, batch: &Batch) -> Result<f32> {
        self.model.forward(batch)
    }

    fn backward(&mut self) -> Result<()> {
        let scale = self.loss_scale().unwrap_or(1.0);
        self.model.backward(scale)
    }

    fn optimizer_step(&mut self) -> Result<()> {
        self.model.finish_accumulation()?;
        let outcome = self.optimizer.step(&mut self.model, self.scaler.as_mut())?;
        debug!(
            config = %self.config_id,
            step = self.optimizer.timestep(),
            skipped = outcome.skipped,
            grad_norm = ?outcome.grad_norm,
            "optimizer step"
        );
        self.last_outcome = Some(outcome);
        Ok(())
    }

    fn clear_gradients(&mut self) -> Result<()> {
        self.model.clear_gradients();
        Ok(())
    }
}
