//! Error types for registry operations

use thiserror::Error;

/// Main error type for registry operations
///
/// Only failures that happen before a request reaches the network, and
/// misuse of the lifecycle machinery, are errors. Reverted and timed-out
/// transactions are reported through [`crate::lifecycle::Outcome`].
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gas limit {requested} exceeds ceiling of {ceiling}")]
    ResourceLimitExceeded { requested: u64, ceiling: u64 },

    #[error("Precondition failed for {operation}: {reason}")]
    PreconditionFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("Invalid arguments for {operation}: {reason}")]
    InvalidArguments {
        operation: &'static str,
        reason: String,
    },

    #[error("Submission of {operation} rejected before reaching the network: {reason}")]
    SubmissionRejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Chain connection error: {0}")]
    ChainConnection(String),

    #[error("Contract read error in {call}: {message}")]
    ContractRead { call: &'static str, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Invalid timeout budget: {0}")]
    InvalidBudget(String),

    #[error("Inconsistent outcome for {operation}: {diagnostic}")]
    InconsistentOutcome {
        operation: &'static str,
        diagnostic: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OpsError {
    /// Errors raised before any network-bound write was attempted
    pub fn is_pre_submission(&self) -> bool {
        matches!(
            self,
            OpsError::ResourceLimitExceeded { .. }
                | OpsError::PreconditionFailed { .. }
                | OpsError::InvalidArguments { .. }
                | OpsError::SubmissionRejected { .. }
        )
    }

    /// Process exit code for the operator CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            OpsError::Config(_) | OpsError::Wallet(_) => 78,
            OpsError::ResourceLimitExceeded { .. }
            | OpsError::PreconditionFailed { .. }
            | OpsError::InvalidArguments { .. } => 65,
            OpsError::SubmissionRejected { .. } => 69,
            OpsError::InconsistentOutcome { .. } => 70,
            _ => 1,
        }
    }
}

/// Result type for registry operations
pub type OpsResult<T> = Result<T, OpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_submission_classification() {
        let err = OpsError::ResourceLimitExceeded {
            requested: 10_000_001,
            ceiling: 10_000_000,
        };
        assert!(err.is_pre_submission());
        assert_eq!(
            err.to_string(),
            "Gas limit 10000001 exceeds ceiling of 10000000"
        );

        let err = OpsError::ChainConnection("connection refused".to_string());
        assert!(!err.is_pre_submission());
        assert_eq!(err.exit_code(), 1);
    }
}
