//! Bounded, cancellable polling of a gate until it decides.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::gate::{GateContext, GateOutcome, VerificationGate};

/// Final decision of a polled gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Passed,
    Failed(String),
    /// `cancel` resolved before the gate decided.
    Cancelled,
}

/// Evaluate `gate` every `interval` until it passes or fails.
///
/// A gate still `Pending` once `deadline` has elapsed is a failure.
/// `cancel` takes priority over both evaluation and waiting.
pub async fn poll_gate<C>(
    gate: &dyn VerificationGate,
    target: &str,
    ctx: &GateContext,
    interval: Duration,
    deadline: Duration,
    cancel: C,
) -> GateVerdict
where
    C: Future<Output = ()>,
{
    let started = Instant::now();
    tokio::pin!(cancel);
    let mut evaluations = 0u32;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = &mut cancel => return GateVerdict::Cancelled,
            outcome = gate.evaluate(target, ctx) => outcome,
        };
        evaluations += 1;

        match outcome {
            GateOutcome::Pass => return GateVerdict::Passed,
            GateOutcome::Fail(reason) => return GateVerdict::Failed(reason),
            GateOutcome::Pending => {}
        }

        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return GateVerdict::Failed(format!(
                "still pending after {} evaluations ({}ms deadline)",
                evaluations,
                deadline.as_millis()
            ));
        }
        debug!(gate = %ctx.gate, kind = gate.kind(), %target, evaluations, "gate pending");

        let wait = interval.min(deadline - elapsed);
        tokio::select! {
            biased;
            _ = &mut cancel => return GateVerdict::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
