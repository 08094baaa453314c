//! shardcheck error types

/// shardcheck result type
pub type Result<T> = std::result::Result<T, Error>;

/// shardcheck errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The execution environment cannot run a configuration (precision mode,
    /// world size). Claims hitting this are skipped, never passed.
    #[error("capability unavailable: {reason}")]
    CapabilityUnavailable {
        /// What is missing
        reason: String,
    },

    /// Configurations in a claim cannot be compared step-for-step
    #[error("configuration mismatch: {reason}")]
    ConfigurationMismatch {
        /// Why the configurations are not comparable
        reason: String,
    },

    /// Two loss traces differ at some optimizer step
    #[error(
        "equivalence violated at step {index}: {reference} = {expected:e} ({expected_bits:#010x}), \
         {candidate} = {actual:e} ({actual_bits:#010x})"
    )]
    EquivalenceViolation {
        /// Optimizer-step index of the first mismatch
        index: usize,
        /// Identifier of the reference configuration
        reference: String,
        /// Identifier of the configuration that diverged
        candidate: String,
        /// Reference loss at `index`
        expected: f32,
        /// Candidate loss at `index`
        actual: f32,
        /// Raw bits of `expected`
        expected_bits: u32,
        /// Raw bits of `actual`
        actual_bits: u32,
    },

    /// A training configuration violates its own consistency rules
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the violated rule
        reason: String,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Model construction or forward/backward error
    #[error("model error: {reason}")]
    ModelError {
        /// Description of what went wrong
        reason: String,
    },

    /// Training/optimizer error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },

    /// Dataset or loader error
    #[error("data error: {reason}")]
    DataError {
        /// Description of what went wrong
        reason: String,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build an [`Error::EquivalenceViolation`] from the two differing values.
    pub fn equivalence_violation(
        index: usize,
        reference: impl Into<String>,
        candidate: impl Into<String>,
        expected: f32,
        actual: f32,
    ) -> Self {
        Error::EquivalenceViolation {
            index,
            reference: reference.into(),
            candidate: candidate.into(),
            expected,
            actual,
            expected_bits: expected.to_bits(),
            actual_bits: actual.to_bits(),
        }
    }

    /// Whether this error means "cannot run here" rather than "ran and was wrong".
    pub fn is_capability(&self) -> bool {
        matches!(self, Error::CapabilityUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_message_carries_both_values() {
        let err = Error::equivalence_violation(3, "stage1", "dp", 0.5, 0.25);
        let msg = err.to_string();
        assert!(msg.contains("step 3"), "{msg}");
        assert!(msg.contains("stage1"), "{msg}");
        assert!(msg.contains("dp"), "{msg}");
        assert!(msg.contains("0x3f000000"), "{msg}");
        assert!(msg.contains("0x3e800000"), "{msg}");
    }

    #[test]
    fn test_capability_classification() {
        let err = Error::CapabilityUnavailable {
            reason: "bf16".to_string(),
        };
        assert!(err.is_capability());
        let err = Error::TrainingError {
            reason: "x".to_string(),
        };
        assert!(!err.is_capability());
    }
}
