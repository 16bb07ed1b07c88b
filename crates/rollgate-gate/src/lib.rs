//! rollgate-gate — verification gates that guard rollout progress.
//!
//! - **`gate`** — `VerificationGate` trait, `GateOutcome`, `GateContext`
//! - **`poll`** — bounded, cancellable polling until a gate decides
//! - **`readiness`** — target replicas observed and ready
//! - **`synthetic`** — HTTP probes through a test endpoint
//! - **`approval`** — operator approval board and manual gate

pub mod approval;
pub mod gate;
pub mod poll;
pub mod readiness;
pub mod synthetic;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use rollgate_core::{GateKind, GateSpec};

pub use approval::{ApprovalBoard, AwaitingGate, Decision, ManualApprovalGate};
pub use gate::{GateContext, GateOutcome, VerificationGate};
pub use poll::{GateVerdict, poll_gate};
pub use readiness::ReadinessGate;
pub use synthetic::SyntheticTrafficGate;

/// Instantiate the gate described by `spec`.
pub fn build_gate(spec: &GateSpec, approvals: &ApprovalBoard) -> Arc<dyn VerificationGate> {
    match &spec.kind {
        GateKind::Readiness => Arc::new(ReadinessGate),
        GateKind::SyntheticTraffic {
            address,
            path,
            header,
            expected,
            samples,
            timeout_ms,
        } => Arc::new(SyntheticTrafficGate {
            address: address.clone(),
            path: path.clone(),
            header: header.clone(),
            expected: expected.clone(),
            samples: *samples,
            timeout: Duration::from_millis(*timeout_ms),
        }),
        GateKind::ManualApproval => Arc::new(ManualApprovalGate::new(approvals.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::GateStage;

    #[test]
    fn builds_each_kind() {
        let board = ApprovalBoard::new();
        let spec = |kind| GateSpec {
            name: "g".to_string(),
            stage: GateStage::Verify,
            kind,
        };

        assert_eq!(build_gate(&spec(GateKind::Readiness), &board).kind(), "readiness");
        assert_eq!(
            build_gate(&spec(GateKind::ManualApproval), &board).kind(),
            "manual_approval"
        );
        let synthetic = GateKind::SyntheticTraffic {
            address: "127.0.0.1:9000".to_string(),
            path: "/".to_string(),
            header: "x-version".to_string(),
            expected: "v2".to_string(),
            samples: 3,
            timeout_ms: 500,
        };
        assert_eq!(build_gate(&spec(synthetic), &board).kind(), "synthetic_traffic");
    }
}
