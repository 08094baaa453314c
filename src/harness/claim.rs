//! Equivalence claims and trace comparison

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::harness::config::RunSpec;
use crate::harness::trace::LossTrace;
use crate::trainer::config::TrainingConfiguration;

/// Predicate two losses at the same step must satisfy
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Comparison {
    /// Equal values, or both NaN
    #[default]
    Exact,
    /// `|expected - actual| <= abs + rel * |expected|`
    Tolerance { abs: f64, rel: f64 },
}

impl Comparison {
    pub fn matches(&self, expected: f32, actual: f32) -> bool {
        match *self {
            Comparison::Exact => expected == actual || (expected.is_nan() && actual.is_nan()),
            Comparison::Tolerance { abs, rel } => {
                if expected.is_nan() || actual.is_nan() {
                    return expected.is_nan() && actual.is_nan();
                }
                if expected == actual {
                    return true;
                }
                let (e, a) = (f64::from(expected), f64::from(actual));
                (e - a).abs() <= abs + rel * e.abs()
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if let Comparison::Tolerance { abs, rel } = *self {
            if !(abs.is_finite() && abs >= 0.0 && rel.is_finite() && rel >= 0.0) {
                return Err(Error::InvalidConfiguration {
                    reason: format!("tolerance must be finite and >= 0, got abs={abs} rel={rel}"),
                });
            }
        }
        Ok(())
    }
}

/// Configurations declared equivalent, and how to compare their traces
///
/// The first configuration is the reference every other one is compared to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquivalenceClaim {
    pub name: String,
    pub configurations: Vec<TrainingConfiguration>,
    #[serde(default)]
    pub comparison: Comparison,
}

impl EquivalenceClaim {
    pub fn new(name: impl Into<String>, configurations: Vec<TrainingConfiguration>) -> Self {
        Self {
            name: name.into(),
            configurations,
            comparison: Comparison::Exact,
        }
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = comparison;
        self
    }

    /// Check the claim's configurations can be compared step for step over
    /// `run`, returning the optimizer steps every trace will hold.
    ///
    /// Configurations with different accumulation granularity emit
    /// different numbers of entries over the same micro-batch stream, so
    /// such claims are rejected rather than aligned.
    pub fn check_alignment(&self, run: &RunSpec) -> Result<usize> {
        self.comparison.validate()?;
        let reference = match self.configurations.as_slice() {
            [first, _, ..] => first,
            _ => {
                return Err(Error::ConfigurationMismatch {
                    reason: format!(
                        "claim '{}' needs at least 2 configurations, got {}",
                        self.name,
                        self.configurations.len()
                    ),
                });
            }
        };

        let accum = reference.grad_accum_steps();
        if let Some(other) = self
            .configurations
            .iter()
            .find(|c| c.grad_accum_steps() != accum)
        {
            return Err(Error::ConfigurationMismatch {
                reason: format!(
                    "accumulation granularity differs: {reference} accumulates {accum}, {other} accumulates {}",
                    other.grad_accum_steps()
                ),
            });
        }

        run.optimizer_steps(accum)
    }
}

/// Compare `candidate` against `reference` position by position, stopping
/// at the first step that fails `comparison`.
pub fn compare_traces(reference: &LossTrace, candidate: &LossTrace, comparison: Comparison) -> Result<()> {
    if reference.len() != candidate.len() {
        return Err(Error::ConfigurationMismatch {
            reason: format!(
                "{} produced {} steps, {} produced {}",
                reference.config_id(),
                reference.len(),
                candidate.config_id(),
                candidate.len()
            ),
        });
    }

    for (index, (&expected, &actual)) in reference.values().iter().zip(candidate.values()).enumerate() {
        if !comparison.matches(expected, actual) {
            return Err(Error::equivalence_violation(
                index,
                reference.config_id(),
                candidate.config_id(),
                expected,
                actual,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::trace::trace;

    #[test]
    fn test_exact_comparison() {
        let c = Comparison::Exact;
        assert!(c.matches(1.0, 1.0));
        assert!(c.matches(f32::NAN, f32::NAN));
        assert!(!c.matches(1.0, 1.0 + f32::EPSILON));
        assert!(!c.matches(1.0, f32::NAN));
    }

    #[test]
    fn test_tolerance_comparison() {
        let c = Comparison::Tolerance { abs: 0.0, rel: 1e-3 };
        assert!(c.matches(1.0, 1.0005));
        assert!(!c.matches(1.0, 1.01));
        assert!(c.matches(f32::INFINITY, f32::INFINITY));
        assert!(!c.matches(f32::NAN, 1.0));
    }

    #[test]
    fn test_first_mismatch_is_reported() {
        let a = trace("ref", &[1.0, 2.0, 3.0, 4.0]);
        let b = trace("cand", &[1.0, 2.5, 3.5, 4.0]);
        match compare_traces(&a, &b, Comparison::Exact) {
            Err(Error::EquivalenceViolation {
                index,
                reference,
                candidate,
                expected,
                actual,
                ..
            }) => {
                assert_eq!(index, 1);
                assert_eq!(reference, "ref");
                assert_eq!(candidate, "cand");
                assert_eq!(expected, 2.0);
                assert_eq!(actual, 2.5);
            }
            other => panic!("expected violation, got {other:?}"),
        }
        compare_traces(&a, &a, Comparison::Exact).unwrap();
    }

    #[test]
    fn test_length_mismatch() {
        let a = trace("ref", &[1.0, 2.0]);
        let b = trace("cand", &[1.0]);
        assert!(matches!(
            compare_traces(&a, &b, Comparison::Exact),
            Err(Error::ConfigurationMismatch { .. })
        ));
    }

    #[test]
    fn test_alignment() {
        let run = RunSpec::default();
        let dp = TrainingConfiguration::data_parallel(4).build().unwrap();
        let s1 = TrainingConfiguration::sharding_stage1(4, 1).build().unwrap();
        let s1_accum = TrainingConfiguration::sharding_stage1(4, 1)
            .grad_accum_steps(2)
            .build()
            .unwrap();

        let claim = EquivalenceClaim::new("ok", vec![dp.clone(), s1.clone()]);
        assert_eq!(claim.check_alignment(&run).unwrap(), 4);

        let mixed = EquivalenceClaim::new("mixed", vec![s1.clone(), s1_accum]);
        assert!(matches!(
            mixed.check_alignment(&run),
            Err(Error::ConfigurationMismatch { .. })
        ));

        let lonely = EquivalenceClaim::new("lonely", vec![dp]);
        assert!(lonely.check_alignment(&run).is_err());

        let loose = EquivalenceClaim::new("loose", vec![s1.clone(), s1])
            .with_comparison(Comparison::Tolerance { abs: -1.0, rel: 0.0 });
        assert!(matches!(
            loose.check_alignment(&run),
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_claim_json() {
        let json = r#"{
            "name": "dp vs stage1",
            "configurations": [
                {"strategy": {"kind": "data_parallel", "dp_degree": 4}},
                {"strategy": {"kind": "sharding_stage1", "sharding_degree": 4, "dp_degree": 1},
                 "precision": {"mode": "bf16"}}
            ]
        }"#;
        let claim: EquivalenceClaim = serde_json::from_str(json).unwrap();
        assert_eq!(claim.comparison, Comparison::Exact);
        assert_eq!(claim.configurations[1].world_size(), 4);

        let bad = json.replace("\"dp_degree\": 4", "\"dp_degree\": 0");
        assert!(serde_json::from_str::<EquivalenceClaim>(&bad).is_err());
    }
}
