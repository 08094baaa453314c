//! Equivalence harness
//!
//! Checks every claim in three phases:
//!
//! 1. **Pre-flight**: claims that cannot be compared fail and claims needing
//!    a missing capability skip, before any session is launched.
//! 2. **Runs**: each distinct configuration still needed is trained once
//!    from the snapshot with its own seeded loader, sequentially or on the
//!    rayon pool.
//! 3. **Comparison**: each claim compares its traces against its reference
//!    configuration. A failed run skips every claim depending on it.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::harness::claim::{EquivalenceClaim, compare_traces};
use crate::harness::config::{HarnessOptions, RunSpec};
use crate::harness::report::{ClaimOutcome, ClaimReport, HarnessReport};
use crate::harness::trace::{LossTrace, TraceRecorder};
use crate::nn::{Mlp, ModelSnapshot};
use crate::trainer::backend::{TrainingBackend, TrainingSession};
use crate::trainer::config::TrainingConfiguration;

/// Runs claims against one backend and one fixed job
pub struct EquivalenceHarness<B> {
    backend: B,
    run: RunSpec,
    options: HarnessOptions,
}

enum Preflight {
    Ready,
    Done(ClaimOutcome),
}

impl<B: TrainingBackend> EquivalenceHarness<B> {
    pub fn new(backend: B, run: RunSpec) -> Self {
        Self {
            backend,
            run,
            options: HarnessOptions::default(),
        }
    }

    pub fn with_options(mut self, options: HarnessOptions) -> Self {
        self.options = options;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn run_spec(&self) -> &RunSpec {
        &self.run
    }

    /// Train `config` from `snapshot` and record one loss per optimizer step.
    ///
    /// Each call launches a fresh session and a fresh loader, so repeated
    /// calls with the same inputs return identical traces.
    pub fn run_configuration(
        &self,
        config: &TrainingConfiguration,
        snapshot: &ModelSnapshot,
    ) -> Result<LossTrace> {
        let accum = config.grad_accum_steps();
        let mut session = self.backend.launch(config, snapshot, &self.run.training)?;
        let mut loader = self.run.loader()?;
        let mut recorder = TraceRecorder::new(config.id());

        for epoch in 0..self.run.epochs {
            for batch in loader.epoch() {
                let batch = batch?;
                let loss = session.forward(&batch)?;
                session.backward()?;
                recorder.record(loss);

                if recorder.window_len() == accum {
                    session.optimizer_step()?;
                    session.clear_gradients()?;
                    if let Some(step_loss) = recorder.close_window() {
                        debug!(config = %config, epoch, loss = step_loss, "step");
                    }
                }
            }
        }

        if recorder.window_len() != 0 {
            return Err(Error::ConfigurationMismatch {
                reason: format!(
                    "{config} ended with {} micro-batches outside a full window",
                    recorder.window_len()
                ),
            });
        }
        Ok(recorder.finish())
    }

    /// Check every claim, training each needed configuration once.
    ///
    /// # Errors
    ///
    /// Only for problems with the job itself (invalid [`RunSpec`], snapshot
    /// not matching the input size). Claim-level problems become outcomes.
    pub fn run(&self, snapshot: &ModelSnapshot, claims: &[EquivalenceClaim]) -> Result<HarnessReport> {
        self.check_job(snapshot)?;

        let preflight: Vec<Preflight> = claims.iter().map(|c| self.preflight(c)).collect();

        let mut needed: Vec<&TrainingConfiguration> = Vec::new();
        for (claim, check) in claims.iter().zip(&preflight) {
            if matches!(check, Preflight::Ready) {
                for config in &claim.configurations {
                    if !needed.iter().any(|c| c.id() == config.id()) {
                        needed.push(config);
                    }
                }
            }
        }

        info!(
            backend = self.backend.name(),
            claims = claims.len(),
            runs = needed.len(),
            parallel = self.options.parallel,
            "starting equivalence runs"
        );

        let run_one = |config: &&TrainingConfiguration| {
            let result = self.run_configuration(config, snapshot);
            match &result {
                Ok(trace) => info!(config = %config, steps = trace.len(), "run finished"),
                Err(err) => warn!(config = %config, error = %err, "run failed"),
            }
            (config.id(), result)
        };
        let results: HashMap<String, Result<LossTrace>> = if self.options.parallel {
            needed.par_iter().map(run_one).collect()
        } else {
            needed.iter().map(run_one).collect()
        };

        let reports = claims
            .iter()
            .zip(preflight)
            .map(|(claim, check)| {
                let (outcome, traces) = match check {
                    Preflight::Done(outcome) => (outcome, Vec::new()),
                    Preflight::Ready => Self::judge(claim, &results),
                };
                match &outcome {
                    ClaimOutcome::Pass => info!(claim = %claim.name, "PASS"),
                    ClaimOutcome::Fail { reason, .. } => warn!(claim = %claim.name, %reason, "FAIL"),
                    ClaimOutcome::Skip { reason } => warn!(claim = %claim.name, %reason, "SKIP"),
                }
                ClaimReport {
                    claim: claim.name.clone(),
                    configurations: claim.configurations.iter().map(TrainingConfiguration::id).collect(),
                    outcome,
                    traces,
                }
            })
            .collect();

        Ok(HarnessReport {
            backend: self.backend.name().to_string(),
            claims: reports,
        })
    }

    fn check_job(&self, snapshot: &ModelSnapshot) -> Result<()> {
        self.run.validate()?;
        let mlp = Mlp::from_layout(snapshot.layout()?)?;
        if mlp.in_features() != self.run.input_size {
            return Err(Error::InvalidConfiguration {
                reason: format!(
                    "snapshot expects {} input features, run generates {}",
                    mlp.in_features(),
                    self.run.input_size
                ),
            });
        }
        Ok(())
    }

    fn preflight(&self, claim: &EquivalenceClaim) -> Preflight {
        if let Err(err) = claim.check_alignment(&self.run) {
            return Preflight::Done(ClaimOutcome::from_error(&err));
        }
        for config in &claim.configurations {
            if let Err(err) = self.backend.check_capabilities(config) {
                return Preflight::Done(ClaimOutcome::from_error(&err));
            }
        }
        Preflight::Ready
    }

    fn judge(
        claim: &EquivalenceClaim,
        results: &HashMap<String, Result<LossTrace>>,
    ) -> (ClaimOutcome, Vec<LossTrace>) {
        let mut traces = Vec::with_capacity(claim.configurations.len());
        for config in &claim.configurations {
            match results.get(&config.id()) {
                Some(Ok(trace)) => traces.push(trace.clone()),
                Some(Err(err)) => {
                    let reason = format!("run of {config} failed: {err}");
                    return (ClaimOutcome::Skip { reason }, Vec::new());
                }
                None => {
                    let reason = format!("no run recorded for {config}");
                    return (ClaimOutcome::Skip { reason }, Vec::new());
                }
            }
        }

        let outcome = match traces.split_first() {
            Some((reference, others)) => others
                .iter()
                .find_map(|candidate| compare_traces(reference, candidate, claim.comparison).err())
                .map_or(ClaimOutcome::Pass, |err| ClaimOutcome::from_error(&err)),
            None => ClaimOutcome::Pass,
        };
        (outcome, traces)
    }
}
