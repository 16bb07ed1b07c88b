//! Manual approval gate and the board operators record decisions on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gate::{GateContext, GateOutcome, VerificationGate};

/// An operator's decision for one gate of one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected { reason: String },
}

/// A manual gate evaluation waiting on the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitingGate {
    pub gate: String,
    pub step: Option<usize>,
}

type GateKey = (String, String);

fn key(plan_id: &str, gate: &str) -> GateKey {
    (plan_id.to_string(), gate.to_string())
}

#[derive(Debug, Default)]
struct Board {
    /// Gates with an evaluation waiting on the operator, with the schedule
    /// step that evaluation guards.
    awaiting: HashMap<GateKey, Option<usize>>,
    decisions: HashMap<GateKey, (Option<usize>, Decision)>,
}

/// Operator decisions for manual gates, keyed by `(plan_id, gate)`.
///
/// A decision is only accepted while an evaluation of that gate is waiting,
/// and is bound to the step that evaluation guards. It is consumed by the
/// evaluation that observes it, so a gate evaluated at every step needs a
/// fresh approval each time.
#[derive(Debug, Clone, Default)]
pub struct ApprovalBoard {
    inner: Arc<RwLock<Board>>,
}

impl ApprovalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve the waiting evaluation of `gate`. Returns `false` if no
    /// evaluation is waiting or it is already decided.
    pub fn approve(&self, plan_id: &str, gate: &str) -> bool {
        let recorded = self.record(plan_id, gate, Decision::Approved);
        if recorded {
            info!(plan = %plan_id, %gate, "gate approved");
        }
        recorded
    }

    /// Reject the waiting evaluation of `gate`. Same acceptance rules as
    /// [`approve`](Self::approve).
    pub fn reject(&self, plan_id: &str, gate: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let recorded = self.record(plan_id, gate, Decision::Rejected { reason: reason.clone() });
        if recorded {
            info!(plan = %plan_id, %gate, %reason, "gate rejected");
        }
        recorded
    }

    fn record(&self, plan_id: &str, gate: &str, decision: Decision) -> bool {
        let mut board = self.inner.write().expect("approval lock");
        let key = key(plan_id, gate);
        let Some(&step) = board.awaiting.get(&key) else {
            return false;
        };
        if board.decisions.contains_key(&key) {
            return false;
        }
        board.decisions.insert(key, (step, decision));
        true
    }

    /// Remove and return the decision recorded for the evaluation of `gate`
    /// at `step`. A decision made for another step is discarded.
    pub fn take_decision(&self, plan_id: &str, gate: &str, step: Option<usize>) -> Option<Decision> {
        let mut board = self.inner.write().expect("approval lock");
        let key = key(plan_id, gate);
        let (decided_for, decision) = board.decisions.remove(&key)?;
        if decided_for != step {
            return None;
        }
        board.awaiting.remove(&key);
        Some(decision)
    }

    /// Mark `gate` as waiting on the operator for `step`.
    pub fn await_decision(&self, plan_id: &str, gate: &str, step: Option<usize>) {
        self.inner
            .write()
            .expect("approval lock")
            .awaiting
            .insert(key(plan_id, gate), step);
    }

    /// Gates of `plan_id` waiting on the operator, sorted by name.
    pub fn awaiting(&self, plan_id: &str) -> Vec<AwaitingGate> {
        let board = self.inner.read().expect("approval lock");
        let mut gates: Vec<AwaitingGate> = board
            .awaiting
            .iter()
            .filter(|(key, _)| key.0 == plan_id && !board.decisions.contains_key(*key))
            .map(|((_, gate), step)| AwaitingGate {
                gate: gate.clone(),
                step: *step,
            })
            .collect();
        gates.sort_by(|a, b| a.gate.cmp(&b.gate));
        gates
    }

    /// Drop every decision and waiting evaluation recorded for `plan_id`.
    pub fn clear(&self, plan_id: &str) {
        let mut board = self.inner.write().expect("approval lock");
        board.awaiting.retain(|(plan, _), _| plan != plan_id);
        board.decisions.retain(|(plan, _), _| plan != plan_id);
    }
}

/// Waits for an operator to approve or reject through the board.
#[derive(Debug, Clone)]
pub struct ManualApprovalGate {
    board: ApprovalBoard,
}

impl ManualApprovalGate {
    pub fn new(board: ApprovalBoard) -> Self {
        Self { board }
    }
}

#[async_trait]
impl VerificationGate for ManualApprovalGate {
    fn kind(&self) -> &'static str {
        "manual_approval"
    }

    async fn evaluate(&self, _target: &str, ctx: &GateContext) -> GateOutcome {
        match self.board.take_decision(&ctx.plan_id, &ctx.gate, ctx.step_index) {
            Some(Decision::Approved) => GateOutcome::Pass,
            Some(Decision::Rejected { reason }) => GateOutcome::Fail(format!("rejected: {reason}")),
            None => {
                self.board
                    .await_decision(&ctx.plan_id, &ctx.gate, ctx.step_index);
                GateOutcome::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;

    fn ctx(step: Option<usize>) -> GateContext {
        let mut ctx = test_context();
        ctx.gate = "sign-off".to_string();
        ctx.step_index = step;
        ctx
    }

    #[tokio::test]
    async fn pending_until_decided() {
        let board = ApprovalBoard::new();
        let gate = ManualApprovalGate::new(board.clone());
        assert_eq!(gate.evaluate("web-v2", &ctx(None)).await, GateOutcome::Pending);

        assert_eq!(
            board.awaiting("plan-1"),
            vec![AwaitingGate {
                gate: "sign-off".to_string(),
                step: None,
            }]
        );

        assert!(board.approve("plan-1", "sign-off"));
        assert!(board.awaiting("plan-1").is_empty());
        assert_eq!(gate.evaluate("web-v2", &ctx(None)).await, GateOutcome::Pass);
    }

    #[test]
    fn decision_without_waiting_evaluation_is_refused() {
        let board = ApprovalBoard::new();
        assert!(!board.approve("plan-1", "sign-off"));
        assert!(!board.reject("plan-1", "sign-off", "too early"));
        assert!(board.take_decision("plan-1", "sign-off", None).is_none());
    }

    #[tokio::test]
    async fn repeated_approval_does_not_carry_to_next_step() {
        let board = ApprovalBoard::new();
        let gate = ManualApprovalGate::new(board.clone());

        assert_eq!(gate.evaluate("web-v2", &ctx(Some(0))).await, GateOutcome::Pending);
        assert!(board.approve("plan-1", "sign-off"));
        assert_eq!(gate.evaluate("web-v2", &ctx(Some(0))).await, GateOutcome::Pass);

        // Step 0 is settled; a second click has nothing to approve.
        assert!(!board.approve("plan-1", "sign-off"));
        assert_eq!(gate.evaluate("web-v2", &ctx(Some(1))).await, GateOutcome::Pending);
        assert_eq!(gate.evaluate("web-v2", &ctx(Some(1))).await, GateOutcome::Pending);

        assert!(board.approve("plan-1", "sign-off"));
        assert_eq!(gate.evaluate("web-v2", &ctx(Some(1))).await, GateOutcome::Pass);
    }

    #[tokio::test]
    async fn first_decision_wins_until_consumed() {
        let board = ApprovalBoard::new();
        let gate = ManualApprovalGate::new(board.clone());
        gate.evaluate("web-v2", &ctx(Some(0))).await;

        assert!(board.approve("plan-1", "sign-off"));
        assert!(!board.approve("plan-1", "sign-off"));
        assert!(!board.reject("plan-1", "sign-off", "changed my mind"));
        assert_eq!(gate.evaluate("web-v2", &ctx(Some(0))).await, GateOutcome::Pass);
    }

    #[tokio::test]
    async fn decision_for_another_step_is_discarded() {
        let board = ApprovalBoard::new();
        board.await_decision("plan-1", "sign-off", Some(0));
        assert!(board.approve("plan-1", "sign-off"));

        let gate = ManualApprovalGate::new(board.clone());
        assert_eq!(gate.evaluate("web-v2", &ctx(Some(1))).await, GateOutcome::Pending);
        assert_eq!(gate.evaluate("web-v2", &ctx(Some(0))).await, GateOutcome::Pending);
    }

    #[tokio::test]
    async fn rejection_fails_with_reason() {
        let board = ApprovalBoard::new();
        let gate = ManualApprovalGate::new(board.clone());
        gate.evaluate("web-v2", &ctx(None)).await;
        assert!(board.reject("plan-1", "sign-off", "latency regression"));
        assert_eq!(
            gate.evaluate("web-v2", &ctx(None)).await,
            GateOutcome::Fail("rejected: latency regression".to_string())
        );
    }

    #[tokio::test]
    async fn decisions_are_scoped_to_plan_and_gate() {
        let board = ApprovalBoard::new();
        let gate = ManualApprovalGate::new(board.clone());
        gate.evaluate("web-v2", &ctx(None)).await;
        assert!(!board.approve("plan-2", "sign-off"));
        assert!(!board.approve("plan-1", "other"));
        assert_eq!(gate.evaluate("web-v2", &ctx(None)).await, GateOutcome::Pending);
    }

    #[test]
    fn clear_drops_only_that_plan() {
        let board = ApprovalBoard::new();
        board.await_decision("plan-1", "a", None);
        board.await_decision("plan-2", "a", None);
        board.clear("plan-1");
        assert!(!board.approve("plan-1", "a"));
        assert!(board.approve("plan-2", "a"));
        assert_eq!(board.take_decision("plan-2", "a", None), Some(Decision::Approved));
    }
}
