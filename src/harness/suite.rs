//! Built-in sharding stage 1 claims and claim files

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::harness::claim::EquivalenceClaim;
use crate::harness::config::RunSpec;
use crate::trainer::config::{LossScaleStrategy, PrecisionMode, TrainingConfiguration};

/// Claims plus, optionally, the job to check them on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimFile {
    #[serde(default)]
    pub run: Option<RunSpec>,
    pub claims: Vec<EquivalenceClaim>,
}

impl ClaimFile {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// The stage 1 claims: hybrid sharding vs pure sharding, and hybrid
/// sharding vs pure data parallel, under each precision setup.
///
/// Accumulating claims step once per epoch of `run`.
pub fn stage1_suite(run: &RunSpec) -> Result<Vec<EquivalenceClaim>> {
    let per_epoch = run.batches_per_epoch().max(1);
    let pure = PrecisionMode::PureBf16 { main_grad: false };

    let mut claims = Vec::new();
    for (label, precision, accum) in [
        ("bf16", PrecisionMode::Bf16, 1),
        ("pure-bf16", pure, 1),
        ("pure-bf16+accumulate", pure, per_epoch),
        ("pure-bf16+main-grad", PrecisionMode::PureBf16 { main_grad: true }, 1),
    ] {
        let hybrid = TrainingConfiguration::sharding_stage1(2, 2)
            .precision(precision)
            .grad_accum_steps(accum)
            .build()?;
        let sharded = TrainingConfiguration::sharding_stage1(4, 1)
            .precision(precision)
            .grad_accum_steps(accum)
            .build()?;
        let data_parallel = TrainingConfiguration::data_parallel(4)
            .precision(precision)
            .grad_accum_steps(accum)
            .build()?;

        claims.push(EquivalenceClaim::new(
            format!("{label}: stage1 sharding=2,dp=2 vs sharding=4"),
            vec![hybrid.clone(), sharded],
        ));
        claims.push(EquivalenceClaim::new(
            format!("{label}: stage1 sharding=2,dp=2 vs data parallel"),
            vec![hybrid, data_parallel],
        ));
    }

    let unscaled = TrainingConfiguration::sharding_stage1(4, 1)
        .precision(PrecisionMode::Bf16)
        .build()?;
    let scaled = TrainingConfiguration::sharding_stage1(4, 1)
        .precision(PrecisionMode::Bf16)
        .loss_scale(LossScaleStrategy::Fixed(1024.0))
        .build()?;
    claims.push(EquivalenceClaim::new(
        "bf16: stage1 fixed loss scale 1024 vs unscaled",
        vec![unscaled, scaled],
    ));

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_is_aligned() {
        let run = RunSpec::default();
        let claims = stage1_suite(&run).unwrap();
        assert_eq!(claims.len(), 9);
        for claim in &claims {
            claim.check_alignment(&run).unwrap();
        }
        let accum = claims
            .iter()
            .find(|c| c.name.starts_with("pure-bf16+accumulate"))
            .unwrap();
        assert_eq!(accum.check_alignment(&run).unwrap(), 2);
    }

    #[test]
    fn test_claim_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.json");
        let file = ClaimFile {
            run: Some(RunSpec::default().with_input_size(8)),
            claims: stage1_suite(&RunSpec::default()).unwrap(),
        };
        file.save_json(&path).unwrap();
        assert_eq!(ClaimFile::load_json(&path).unwrap(), file);
    }
}
