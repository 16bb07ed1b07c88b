//! Error types shared by the cluster client and plan validation.

use thiserror::Error;

/// Result type alias for cluster client operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors reported by a cluster control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Network failure or timeout. Safe to retry.
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// The resource changed underneath the writer (resource version mismatch).
    #[error("conflict on {name}: expected resource version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// The control plane refused the request (validation, quota, ...).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ClusterError {
    /// Whether the operation may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

/// Reasons a rollout plan is rejected at submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan id must not be empty")]
    EmptyId,

    #[error("ratio schedule must contain at least one step")]
    EmptySchedule,

    #[error("step {index} totals {actual} replicas, expected {expected}")]
    InconsistentTotal {
        index: usize,
        expected: u32,
        actual: u32,
    },

    #[error("step {index} replica counts overflow")]
    ReplicaOverflow { index: usize },

    #[error("ratio schedule total must be greater than zero")]
    ZeroTotal,

    #[error("final step must move every replica to the target (got {source_replicas} source)")]
    IncompleteFinalStep { source_replicas: u32 },

    #[error("routing endpoint selector must not be empty")]
    EmptySelector,

    #[error("source and target workload groups must differ (both {0})")]
    SameWorkload(String),

    #[error("{0} must not be empty")]
    MissingField(&'static str),

    #[error("{0} port must be greater than zero")]
    ZeroPort(&'static str),

    #[error("duplicate gate name: {0}")]
    DuplicateGate(String),

    #[error("retry policy needs at least one attempt")]
    ZeroAttempts,

    #[error("failed to parse plan: {0}")]
    Parse(String),
}
