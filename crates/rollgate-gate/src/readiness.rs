//! Readiness gate backed by the cluster's own readiness accounting.

use async_trait::async_trait;
use tracing::debug;

use crate::gate::{GateContext, GateOutcome, VerificationGate};

/// Passes once the target reports at least `expected_replicas` observed
/// and ready replicas.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadinessGate;

#[async_trait]
impl VerificationGate for ReadinessGate {
    fn kind(&self) -> &'static str {
        "readiness"
    }

    async fn evaluate(&self, target: &str, ctx: &GateContext) -> GateOutcome {
        let status = match ctx.cluster.workload_group_status(target).await {
            Ok(status) => status,
            Err(e) if e.is_retryable() => {
                debug!(%target, error = %e, "readiness status unavailable");
                return GateOutcome::Pending;
            }
            Err(e) => return GateOutcome::Fail(e.to_string()),
        };

        if status.is_gone() {
            return GateOutcome::Fail(format!("workload group {target} does not exist"));
        }
        if status.observed_replicas >= ctx.expected_replicas
            && status.ready_replicas >= ctx.expected_replicas
        {
            GateOutcome::Pass
        } else {
            GateOutcome::Pending
        }
    }
}
