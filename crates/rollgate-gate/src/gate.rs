//! Verification gate contract.

use std::sync::Arc;

use async_trait::async_trait;

use rollgate_cluster::ClusterClient;

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    Fail(String),
    /// Not decided yet; evaluate again later.
    Pending,
}

/// What a gate is told about the rollout it is guarding.
#[derive(Clone)]
pub struct GateContext {
    pub plan_id: String,
    /// Name of the gate being evaluated (keys manual approvals).
    pub gate: String,
    /// Replicas the target should be running at this point.
    pub expected_replicas: u32,
    /// Schedule step just confirmed, for per-step gates.
    pub step_index: Option<usize>,
    pub cluster: Arc<dyn ClusterClient>,
}

/// A health check that must pass before the engine advances.
#[async_trait]
pub trait VerificationGate: Send + Sync {
    /// Short kind name for logs and audit records.
    fn kind(&self) -> &'static str;

    async fn evaluate(&self, target: &str, ctx: &GateContext) -> GateOutcome;
}
