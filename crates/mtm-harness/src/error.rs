//! Harness error types
//!
//! Errors are split by who has to react to them. Per-transaction failures
//! ([`WorkloadError`]) only ever end up in the outcome counters. Partition tool
//! failures ([`PartitionError`]) abort the running scenario. [`HarnessError`]
//! is what a scenario run returns, and its [`ErrorCategory`] keeps a broken
//! test setup apart from a property violation of the cluster under test.

use std::fmt;
use thiserror::Error;

use crate::stats::Outcome;

/// Failure of a single workload transaction
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// The server aborted the transaction (serialization failure, deadlock,
    /// multimaster abort). The session is still usable.
    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    /// The connection is unusable or the statement failed for another reason
    #[error("Transaction failed: {0}")]
    Failed(String),

    /// No session could be established with the node
    #[error("Failed to connect to {node}: {reason}")]
    Connect { node: String, reason: String },
}

impl WorkloadError {
    /// Outcome recorded for this failure
    pub fn outcome(&self) -> Outcome {
        match self {
            WorkloadError::Rollback(_) => Outcome::Rollback,
            WorkloadError::Failed(_) | WorkloadError::Connect { .. } => Outcome::Error,
        }
    }

    /// Whether the session must be dropped and re-established
    pub fn needs_reconnect(&self) -> bool {
        !matches!(self, WorkloadError::Rollback(_))
    }
}

/// SQLSTATE codes that mean "the server rolled the transaction back"
const ROLLBACK_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "40000", // transaction_rollback
    "25P02", // in_failed_sql_transaction
];

impl From<sqlx::Error> for WorkloadError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let rolled_back = db_err
                    .code()
                    .map(|code| ROLLBACK_SQLSTATES.iter().any(|state| code == *state))
                    .unwrap_or(false);
                if rolled_back {
                    WorkloadError::Rollback(db_err.to_string())
                } else {
                    WorkloadError::Failed(db_err.to_string())
                }
            }
            _ => WorkloadError::Failed(err.to_string()),
        }
    }
}

/// Partition tool errors
#[derive(Error, Debug)]
pub enum PartitionError {
    /// The tool could not be started at all
    #[error("Partition tool `{program}` unavailable: {reason}")]
    ToolUnavailable { program: String, reason: String },

    /// The tool ran and exited unsuccessfully
    #[error("`{command}` exited with {status}: {stderr}")]
    ToolFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// A partition is already outstanding
    #[error("Node {current} is already partitioned (requested {requested})")]
    AlreadyPartitioned { current: String, requested: String },
}

/// Scenario phase in which an assertion was evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionPhase {
    /// Majority liveness while one node is isolated
    Partitioned,
    /// Full recovery after healing
    Healed,
}

impl fmt::Display for AssertionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertionPhase::Partitioned => write!(f, "partitioned"),
            AssertionPhase::Healed => write!(f, "healed"),
        }
    }
}

/// Broad failure categories of a scenario run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The configuration was rejected before anything ran
    Config,
    /// Initial connections or schema preparation failed
    Setup,
    /// The partition tool failed
    Infrastructure,
    /// The cluster violated a liveness or recovery property
    Assertion,
    /// The workload did not shut down cleanly
    Teardown,
}

/// Errors returned by harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Initial connections or schema preparation failed
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Partition tool failure
    #[error("Infrastructure failure: {0}")]
    Infrastructure(#[from] PartitionError),

    /// Expected property not observed
    #[error("Assertion failed while {phase} (round {round}): node {node} committed nothing; delta: {snapshot}")]
    Assertion {
        phase: AssertionPhase,
        round: usize,
        node: String,
        snapshot: String,
    },

    /// Workload tasks did not stop
    #[error("Teardown failed: {0}")]
    Teardown(String),
}

impl HarnessError {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            HarnessError::Config(_) => ErrorCategory::Config,
            HarnessError::Setup(_) => ErrorCategory::Setup,
            HarnessError::Infrastructure(_) => ErrorCategory::Infrastructure,
            HarnessError::Assertion { .. } => ErrorCategory::Assertion,
            HarnessError::Teardown(_) => ErrorCategory::Teardown,
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Config(err.to_string())
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Config(err.to_string())
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_error_outcomes() {
        assert_eq!(WorkloadError::Rollback("x".into()).outcome(), Outcome::Rollback);
        assert_eq!(WorkloadError::Failed("x".into()).outcome(), Outcome::Error);
        assert!(!WorkloadError::Rollback("x".into()).needs_reconnect());
        assert!(WorkloadError::Failed("x".into()).needs_reconnect());
    }

    #[test]
    fn test_categories() {
        let infra: HarnessError = PartitionError::ToolUnavailable {
            program: "blockade".into(),
            reason: "not found".into(),
        }
        .into();
        assert_eq!(infra.category(), ErrorCategory::Infrastructure);
        assert_eq!(HarnessError::Setup("x".into()).category(), ErrorCategory::Setup);
        assert_eq!(HarnessError::Config("x".into()).category(), ErrorCategory::Config);
        assert_eq!(HarnessError::Teardown("x".into()).category(), ErrorCategory::Teardown);

        let assertion = HarnessError::Assertion {
            phase: AssertionPhase::Healed,
            round: 20,
            node: "node3".into(),
            snapshot: "{}".into(),
        };
        assert_eq!(assertion.category(), ErrorCategory::Assertion);
        assert!(assertion.to_string().contains("node3"));
    }
}
