//! Per-claim outcomes and the harness report

use std::fmt;

use serde::Serialize;

use crate::error::Error;
use crate::harness::trace::LossTrace;

/// Why a claim failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Configurations cannot be compared step for step
    ConfigurationMismatch,
    /// Traces differ at `index`
    EquivalenceViolation { index: usize },
    /// The claim itself is malformed
    InvalidClaim,
}

/// Outcome of one claim
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "UPPERCASE")]
pub enum ClaimOutcome {
    Pass,
    Fail { kind: FailureKind, reason: String },
    /// Not checked: a capability is missing or a run could not complete
    Skip { reason: String },
}

impl ClaimOutcome {
    /// Classify an error raised while checking a claim.
    ///
    /// Capability errors skip; every other error fails.
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::CapabilityUnavailable { .. } => {
                return ClaimOutcome::Skip {
                    reason: err.to_string(),
                };
            }
            Error::ConfigurationMismatch { .. } => FailureKind::ConfigurationMismatch,
            Error::EquivalenceViolation { index, .. } => FailureKind::EquivalenceViolation { index: *index },
            _ => FailureKind::InvalidClaim,
        };
        ClaimOutcome::Fail {
            kind,
            reason: err.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Pass => "PASS",
            ClaimOutcome::Fail { .. } => "FAIL",
            ClaimOutcome::Skip { .. } => "SKIP",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, ClaimOutcome::Pass)
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, ClaimOutcome::Fail { .. })
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, ClaimOutcome::Skip { .. })
    }
}

/// Result of checking one claim
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimReport {
    pub claim: String,
    /// Identifiers of the claim's configurations, reference first
    pub configurations: Vec<String>,
    pub outcome: ClaimOutcome,
    /// Traces compared for this claim; empty unless every run completed
    pub traces: Vec<LossTrace>,
}

impl fmt::Display for ClaimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.outcome.label(), self.claim, self.configurations.join(" vs "))?;
        match &self.outcome {
            ClaimOutcome::Pass => {
                let steps = self.traces.first().map_or(0, LossTrace::len);
                write!(f, " ({steps} steps)")
            }
            ClaimOutcome::Fail { reason, .. } | ClaimOutcome::Skip { reason } => write!(f, ": {reason}"),
        }
    }
}

/// Outcomes of every claim in one harness run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessReport {
    pub backend: String,
    pub claims: Vec<ClaimReport>,
}

impl HarnessReport {
    pub fn passed(&self) -> usize {
        self.claims.iter().filter(|c| c.outcome.is_pass()).count()
    }

    pub fn failed(&self) -> usize {
        self.claims.iter().filter(|c| c.outcome.is_fail()).count()
    }

    pub fn skipped(&self) -> usize {
        self.claims.iter().filter(|c| c.outcome.is_skip()).count()
    }

    /// No claim failed. Skips do not count against success.
    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn claim(&self, name: &str) -> Option<&ClaimReport> {
        self.claims.iter().find(|c| c.claim == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for HarnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for claim in &self.claims {
            writeln!(f, "{claim}")?;
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::trace::trace;

    fn report(name: &str, outcome: ClaimOutcome) -> ClaimReport {
        ClaimReport {
            claim: name.to_string(),
            configurations: vec!["a".to_string(), "b".to_string()],
            outcome,
            traces: Vec::new(),
        }
    }

    #[test]
    fn test_outcome_from_error() {
        let skip = ClaimOutcome::from_error(&Error::CapabilityUnavailable {
            reason: "no bf16".to_string(),
        });
        assert!(skip.is_skip());

        let fail = ClaimOutcome::from_error(&Error::equivalence_violation(2, "a", "b", 1.0, 2.0));
        assert_eq!(
            fail,
            ClaimOutcome::Fail {
                kind: FailureKind::EquivalenceViolation { index: 2 },
                reason: Error::equivalence_violation(2, "a", "b", 1.0, 2.0).to_string(),
            }
        );
    }

    #[test]
    fn test_skips_do_not_fail_the_report() {
        let report = HarnessReport {
            backend: "reference".to_string(),
            claims: vec![
                report("one", ClaimOutcome::Pass),
                report("two", ClaimOutcome::Skip { reason: "no bf16".to_string() }),
            ],
        };
        assert!(report.success());
        assert_eq!((report.passed(), report.failed(), report.skipped()), (1, 0, 1));

        let text = report.to_string();
        assert!(text.contains("PASS one [a vs b]"), "{text}");
        assert!(text.contains("SKIP two [a vs b]: no bf16"), "{text}");
        assert!(text.ends_with("1 passed, 0 failed, 1 skipped"), "{text}");
    }

    #[test]
    fn test_report_json() {
        let mut pass = report("one", ClaimOutcome::Pass);
        pass.traces = vec![trace("a", &[0.5, 0.25]), trace("b", &[0.5, 0.25])];
        let failed = report(
            "two",
            ClaimOutcome::Fail {
                kind: FailureKind::ConfigurationMismatch,
                reason: "x".to_string(),
            },
        );
        let report = HarnessReport {
            backend: "reference".to_string(),
            claims: vec![pass, failed],
        };
        assert!(!report.success());

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["claims"][0]["outcome"]["outcome"], "PASS");
        assert_eq!(json["claims"][0]["traces"][1]["values"][1], 0.25);
        assert_eq!(json["claims"][1]["outcome"]["kind"], "configuration_mismatch");
    }
}
