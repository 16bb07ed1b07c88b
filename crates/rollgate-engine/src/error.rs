//! Engine error types.

use thiserror::Error;

use rollgate_core::{ClusterError, PlanError};
use rollgate_state::{Stage, StateError};

/// Errors surfaced by the rollout engine and controller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected at submission; the plan never reaches an engine.
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    /// Concurrent modification: a held plan lock, a different plan under
    /// the same ID, or a resource version mismatch in the cluster.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cluster error: {0}")]
    Cluster(ClusterError),

    #[error("verification gate {gate} failed: {reason}")]
    VerificationFailed { gate: String, reason: String },

    #[error(
        "workload group {group} did not converge to {desired} replicas within {timeout_ms}ms (observed {observed})"
    )]
    ConvergenceTimeout {
        group: String,
        desired: u32,
        observed: u32,
        timeout_ms: u64,
    },

    /// The endpoint selector would match no live workload group.
    #[error("endpoint {endpoint} selector does not match {group}")]
    Unroutable { endpoint: String, group: String },

    #[error("rollout aborted")]
    Aborted,

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("rollout not found: {0}")]
    NotFound(String),

    #[error("illegal transition: {event} in stage {stage}")]
    IllegalTransition { stage: Stage, event: String },
}

impl From<ClusterError> for EngineError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Conflict { .. } => EngineError::Conflict(err.to_string()),
            other => EngineError::Cluster(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
