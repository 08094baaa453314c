//! Training configuration
//!
//! [`TrainingConfig`] holds the optimizer hyper-parameters every run of a
//! harness shares. [`TrainingConfiguration`] selects one code path under
//! test: parallel strategy, precision mode, accumulation and loss scaling.
//! It is a closed set of tagged variants checked once in
//! [`ConfigurationBuilder::build`]; an inconsistent combination never
//! reaches a training run.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::optimizer::grad_scaler::GradScaler;

/// Optimizer hyper-parameters shared by all configurations of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            weight_decay: 1e-5,
            max_grad_norm: Some(1.0),
        }
    }
}

impl TrainingConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    pub fn with_max_grad_norm(mut self, norm: Option<f64>) -> Self {
        self.max_grad_norm = norm;
        self
    }

    /// Reject values the optimizer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate >= 0.0) {
            return Err(Error::InvalidArgument {
                arg: "learning_rate",
                reason: format!("must be finite and >= 0, got {}", self.learning_rate),
            });
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(Error::InvalidArgument {
                arg: "weight_decay",
                reason: format!("must be finite and >= 0, got {}", self.weight_decay),
            });
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return Err(Error::InvalidArgument {
                    arg: "max_grad_norm",
                    reason: format!("must be positive, got {norm}"),
                });
            }
        }
        Ok(())
    }
}

/// Numeric precision a configuration trains in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PrecisionMode {
    /// Everything in fp32
    Fp32,
    /// Autocast: fp32 parameters, bf16 compute
    Bf16,
    /// bf16 parameters with an fp32 master copy in the optimizer.
    /// `main_grad` keeps gradient accumulation in fp32.
    PureBf16 {
        #[serde(default)]
        main_grad: bool,
    },
}

impl PrecisionMode {
    /// Whether this mode needs bf16 support from the execution environment.
    pub fn requires_bf16(&self) -> bool {
        !matches!(self, PrecisionMode::Fp32)
    }

    fn tag(&self) -> &'static str {
        match self {
            PrecisionMode::Fp32 => "fp32",
            PrecisionMode::Bf16 => "bf16",
            PrecisionMode::PureBf16 { main_grad: false } => "pure-bf16",
            PrecisionMode::PureBf16 { main_grad: true } => "pure-bf16+main-grad",
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// How ranks are organised and whether optimizer state is partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParallelStrategy {
    /// Plain data parallel over `dp_degree` full replicas; no partitioning.
    DataParallel { dp_degree: usize },
    /// Sharding stage 1: optimizer state partitioned over `sharding_degree`
    /// ranks, replicated over `dp_degree` such groups.
    ShardingStage1 {
        sharding_degree: usize,
        dp_degree: usize,
    },
}

impl ParallelStrategy {
    /// Total number of ranks.
    pub fn world_size(&self) -> usize {
        match *self {
            ParallelStrategy::DataParallel { dp_degree } => dp_degree,
            ParallelStrategy::ShardingStage1 {
                sharding_degree,
                dp_degree,
            } => sharding_degree * dp_degree,
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, ParallelStrategy::ShardingStage1 { .. })
    }

    /// Number of ranks a parameter's optimizer state is spread over.
    pub fn sharding_degree(&self) -> usize {
        match *self {
            ParallelStrategy::DataParallel { .. } => 1,
            ParallelStrategy::ShardingStage1 {
                sharding_degree, ..
            } => sharding_degree,
        }
    }

    pub fn dp_degree(&self) -> usize {
        match *self {
            ParallelStrategy::DataParallel { dp_degree }
            | ParallelStrategy::ShardingStage1 { dp_degree, .. } => dp_degree,
        }
    }
}

impl fmt::Display for ParallelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParallelStrategy::DataParallel { dp_degree } => write!(f, "dp[{dp_degree}]"),
            ParallelStrategy::ShardingStage1 {
                sharding_degree,
                dp_degree,
            } => write!(f, "stage1[sharding={sharding_degree},dp={dp_degree}]"),
        }
    }
}

/// Loss scaling strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossScaleStrategy {
    /// No loss scaling
    #[default]
    None,
    /// Fixed loss scale factor
    Fixed(f64),
    /// Dynamic loss scaling (fp32 only)
    Dynamic {
        initial_scale: f64,
        growth_factor: f64,
        backoff_factor: f64,
        growth_interval: u64,
    },
}

impl LossScaleStrategy {
    /// Convert to an optional GradScaler.
    pub(crate) fn to_grad_scaler(&self) -> Result<Option<GradScaler>> {
        match self {
            LossScaleStrategy::None => Ok(None),
            // Fixed scale: huge growth interval so it never changes
            LossScaleStrategy::Fixed(scale) => {
                Ok(Some(GradScaler::new(*scale, 2.0, 0.5, u64::MAX)?.fixed()))
            }
            LossScaleStrategy::Dynamic {
                initial_scale,
                growth_factor,
                backoff_factor,
                growth_interval,
            } => Ok(Some(GradScaler::new(
                *initial_scale,
                *growth_factor,
                *backoff_factor,
                *growth_interval,
            )?)),
        }
    }

    fn is_enabled(&self) -> bool {
        !matches!(self, LossScaleStrategy::None)
    }
}

/// One code path under test. Construct through [`TrainingConfiguration::builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConfigurationSpec", into = "ConfigurationSpec")]
pub struct TrainingConfiguration {
    strategy: ParallelStrategy,
    precision: PrecisionMode,
    grad_accum_steps: usize,
    loss_scale: LossScaleStrategy,
}

impl TrainingConfiguration {
    pub fn builder(strategy: ParallelStrategy) -> ConfigurationBuilder {
        ConfigurationBuilder {
            spec: ConfigurationSpec {
                strategy,
                precision: PrecisionMode::Fp32,
                grad_accum_steps: 1,
                loss_scale: LossScaleStrategy::None,
            },
        }
    }

    /// Partitioning disabled, `dp_degree` full replicas.
    pub fn data_parallel(dp_degree: usize) -> ConfigurationBuilder {
        Self::builder(ParallelStrategy::DataParallel { dp_degree })
    }

    /// Partitioning enabled over `sharding_degree` ranks, `dp_degree` groups.
    pub fn sharding_stage1(sharding_degree: usize, dp_degree: usize) -> ConfigurationBuilder {
        Self::builder(ParallelStrategy::ShardingStage1 {
            sharding_degree,
            dp_degree,
        })
    }

    pub fn strategy(&self) -> ParallelStrategy {
        self.strategy
    }

    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    pub fn grad_accum_steps(&self) -> usize {
        self.grad_accum_steps
    }

    pub fn loss_scale(&self) -> LossScaleStrategy {
        self.loss_scale
    }

    pub fn world_size(&self) -> usize {
        self.strategy.world_size()
    }

    /// Deterministic identifier used in reports and to share runs between claims.
    pub fn id(&self) -> String {
        let mut id = format!("{}/{}", self.strategy, self.precision);
        if self.grad_accum_steps > 1 {
            id.push_str(&format!("/accum={}", self.grad_accum_steps));
        }
        match self.loss_scale {
            LossScaleStrategy::None => {}
            LossScaleStrategy::Fixed(s) => id.push_str(&format!("/scale=fixed({s})")),
            LossScaleStrategy::Dynamic {
                initial_scale,
                growth_factor,
                backoff_factor,
                growth_interval,
            } => id.push_str(&format!(
                "/scale=dynamic({initial_scale},x{growth_factor},x{backoff_factor},every {growth_interval})"
            )),
        }
        id
    }
}

impl fmt::Display for TrainingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Builder for [`TrainingConfiguration`]
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    spec: ConfigurationSpec,
}

impl ConfigurationBuilder {
    pub fn precision(mut self, precision: PrecisionMode) -> Self {
        self.spec.precision = precision;
        self
    }

    pub fn grad_accum_steps(mut self, steps: usize) -> Self {
        self.spec.grad_accum_steps = steps;
        self
    }

    pub fn loss_scale(mut self, strategy: LossScaleStrategy) -> Self {
        self.spec.loss_scale = strategy;
        self
    }

    pub fn build(self) -> Result<TrainingConfiguration> {
        TrainingConfiguration::try_from(self.spec)
    }
}

/// Unvalidated wire form of a [`TrainingConfiguration`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationSpec {
    pub strategy: ParallelStrategy,
    #[serde(default = "default_precision")]
    pub precision: PrecisionMode,
    #[serde(default = "default_accum")]
    pub grad_accum_steps: usize,
    #[serde(default)]
    pub loss_scale: LossScaleStrategy,
}

fn default_precision() -> PrecisionMode {
    PrecisionMode::Fp32
}

fn default_accum() -> usize {
    1
}

impl TryFrom<ConfigurationSpec> for TrainingConfiguration {
    type Error = Error;

    fn try_from(spec: ConfigurationSpec) -> Result<Self> {
        let invalid = |reason: String| -> Result<Self> { Err(Error::InvalidConfiguration { reason }) };

        match spec.strategy {
            ParallelStrategy::DataParallel { dp_degree } if dp_degree == 0 => {
                return invalid("dp_degree must be >= 1".to_string());
            }
            ParallelStrategy::ShardingStage1 {
                sharding_degree,
                dp_degree,
            } if sharding_degree == 0 || dp_degree == 0 => {
                return invalid(format!(
                    "sharding_degree and dp_degree must be >= 1, got {sharding_degree} and {dp_degree}"
                ));
            }
            _ => {}
        }

        if spec.grad_accum_steps == 0 {
            return invalid("grad_accum_steps must be >= 1".to_string());
        }

        if spec.loss_scale.is_enabled() {
            // The distributed scaler only wraps the sharded optimizer step.
            if !spec.strategy.is_sharded() {
                return invalid(format!(
                    "loss scaling requires sharding stage 1, got {}",
                    spec.strategy
                ));
            }
            if spec.grad_accum_steps != 1 {
                return invalid(format!(
                    "loss scaling cannot be combined with gradient accumulation (steps={})",
                    spec.grad_accum_steps
                ));
            }
        }

        match spec.loss_scale {
            LossScaleStrategy::None => {}
            LossScaleStrategy::Fixed(scale) => {
                if !(scale.is_finite() && scale > 0.0) {
                    return invalid(format!("loss scale must be positive, got {scale}"));
                }
            }
            LossScaleStrategy::Dynamic { initial_scale, .. } => {
                if spec.precision.requires_bf16() {
                    return invalid(format!(
                        "dynamic loss scaling is not supported with {}",
                        spec.precision
                    ));
                }
                if !(initial_scale.is_finite() && initial_scale > 0.0) {
                    return invalid(format!(
                        "initial loss scale must be positive, got {initial_scale}"
                    ));
                }
            }
        }

        // Surfaces bad growth/backoff parameters now rather than at launch.
        if let Err(e) = spec.loss_scale.to_grad_scaler() {
            return invalid(format!("loss scaler: {e}"));
        }

        Ok(Self {
            strategy: spec.strategy,
            precision: spec.precision,
            grad_accum_steps: spec.grad_accum_steps,
            loss_scale: spec.loss_scale,
        })
    }
}

impl From<TrainingConfiguration> for ConfigurationSpec {
    fn from(config: TrainingConfiguration) -> Self {
        Self {
            strategy: config.strategy,
            precision: config.precision,
            grad_accum_steps: config.grad_accum_steps,
            loss_scale: config.loss_scale,
        }
    }
}
