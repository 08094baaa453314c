//! The fixed training job every configuration of a harness runs

use serde::{Deserialize, Serialize};

use crate::data::{DataLoader, RandomDataset};
use crate::error::{Error, Result};
use crate::nn::{MlpConfig, ModelSnapshot};
use crate::trainer::config::TrainingConfig;

/// Dataset, schedule and optimizer settings shared by all runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSpec {
    /// Seed of each run's data generator
    pub data_seed: u64,
    /// Seed used by [`RunSpec::init_snapshot`]
    pub model_seed: u64,
    pub epochs: usize,
    pub num_samples: usize,
    pub batch_size: usize,
    /// Width of each sample and of the model's hidden layers
    pub input_size: usize,
    pub training: TrainingConfig,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            data_seed: 2023,
            model_seed: 2022,
            epochs: 2,
            num_samples: 200,
            batch_size: 100,
            input_size: 1000,
            training: TrainingConfig::default(),
        }
    }
}

impl RunSpec {
    pub fn with_data_seed(mut self, seed: u64) -> Self {
        self.data_seed = seed;
        self
    }

    pub fn with_model_seed(mut self, seed: u64) -> Self {
        self.model_seed = seed;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = num_samples;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_input_size(mut self, input_size: usize) -> Self {
        self.input_size = input_size;
        self
    }

    pub fn with_training(mut self, training: TrainingConfig) -> Self {
        self.training = training;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidArgument {
                arg: "epochs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.input_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "input_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.batches_per_epoch() == 0 {
            return Err(Error::InvalidArgument {
                arg: "num_samples",
                reason: format!(
                    "{} samples do not fill one batch of {}",
                    self.num_samples, self.batch_size
                ),
            });
        }
        if self.epochs.checked_mul(self.batches_per_epoch()).is_none() {
            return Err(Error::InvalidArgument {
                arg: "epochs",
                reason: format!("{} epochs overflow the micro-batch count", self.epochs),
            });
        }
        self.training.validate()
    }

    /// Full batches per epoch; the last partial batch is dropped.
    pub fn batches_per_epoch(&self) -> usize {
        self.num_samples.checked_div(self.batch_size).unwrap_or(0)
    }

    /// Micro-batches over the whole run, saturating for specs that fail
    /// [`RunSpec::validate`].
    pub fn micro_batches(&self) -> usize {
        self.epochs.saturating_mul(self.batches_per_epoch())
    }

    /// Optimizer steps a run with `grad_accum_steps` performs.
    ///
    /// # Errors
    ///
    /// `ConfigurationMismatch` if the micro-batch stream does not split into
    /// whole accumulation windows, or yields no step at all.
    pub fn optimizer_steps(&self, grad_accum_steps: usize) -> Result<usize> {
        let micro = self.micro_batches();
        if grad_accum_steps == 0 || micro % grad_accum_steps != 0 {
            return Err(Error::ConfigurationMismatch {
                reason: format!(
                    "{micro} micro-batches do not split into windows of {grad_accum_steps}"
                ),
            });
        }
        let steps = micro / grad_accum_steps;
        if steps == 0 {
            return Err(Error::ConfigurationMismatch {
                reason: "run performs no optimizer step".to_string(),
            });
        }
        Ok(steps)
    }

    pub fn mlp_config(&self) -> MlpConfig {
        MlpConfig::new(self.input_size)
    }

    /// Snapshot every configuration starts from.
    pub fn init_snapshot(&self) -> Result<ModelSnapshot> {
        ModelSnapshot::init_mlp(&self.mlp_config(), self.model_seed)
    }

    /// A fresh loader with its own generator, seeded for this run only.
    pub fn loader(&self) -> Result<DataLoader<RandomDataset>> {
        let dataset = RandomDataset::new(self.num_samples, self.input_size)?;
        DataLoader::new(dataset, self.batch_size, self.data_seed)
    }
}

/// How the harness schedules runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HarnessOptions {
    /// Run configurations concurrently on the rayon pool.
    pub parallel: bool,
}

impl HarnessOptions {
    pub fn parallel() -> Self {
        Self { parallel: true }
    }
}
