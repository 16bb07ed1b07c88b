//! Rollout controller: the operator surface over rollout engines.
//!
//! Owns the approval board and the set of running engines. Each plan runs
//! as its own tokio task holding the plan's lock in the store; the task
//! releases the lock when its engine stops.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rollgate_cluster::ClusterClient;
use rollgate_core::{PlanId, RolloutPlan};
use rollgate_gate::{ApprovalBoard, AwaitingGate, build_gate};
use rollgate_state::{AuditKind, AuditRecord, RolloutState, Stage, StateError, StateStore, now_millis};

use crate::engine::{Control, PlanGate, RolloutEngine};
use crate::error::{EngineError, EngineResult};

struct RunningEngine {
    control: watch::Sender<Control>,
    finished: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

/// Submits plans, routes operator signals and recovers after restarts.
#[derive(Clone)]
pub struct RolloutController {
    store: StateStore,
    cluster: Arc<dyn ClusterClient>,
    approvals: ApprovalBoard,
    owner: String,
    running: Arc<RwLock<HashMap<PlanId, RunningEngine>>>,
}

impl RolloutController {
    pub fn new(store: StateStore, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            store,
            cluster,
            approvals: ApprovalBoard::new(),
            owner: format!("rollgated-{}", std::process::id()),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Identity recorded in plan locks.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }


    // ── Submission ─────────────────────────────────────────────────

    /// Validate, persist and start a plan.
    ///
    /// Resubmitting an identical plan whose engine is not running continues
    /// from its stored snapshot; a finished or halted plan is returned as is.
    pub async fn submit(&self, plan: RolloutPlan) -> EngineResult<RolloutState> {
        plan.validate()?;

        let existing = self.store.get_plan(&plan.id)?;
        if existing.as_ref().is_some_and(|stored| *stored != plan) {
            return Err(EngineError::Conflict(format!(
                "plan {} already exists with different content",
                plan.id
            )));
        }

        let snapshot = self.store.get_snapshot(&plan.id)?;
        if let Some(state) = &snapshot {
            if state.stage.is_terminal() || state.stage == Stage::Failed {
                if existing.is_none() {
                    return Err(EngineError::Conflict(format!(
                        "plan id {} was already used",
                        plan.id
                    )));
                }
                info!(plan = %plan.id, stage = %state.stage, "plan resubmitted, nothing to run");
                return Ok(state.clone());
            }
        }

        self.lock(&plan.id)?;
        let state = match snapshot {
            Some(state) => {
                info!(plan = %plan.id, stage = %state.stage, step = ?state.step_index, "continuing from snapshot");
                state
            }
            None => {
                let state = RolloutState::new(&plan.id, now_millis());
                let record = AuditRecord::new(&state, AuditKind::Control, Stage::Pending, "submitted");
                if let Err(err) = self.store.register_plan(&plan, &state, record) {
                    self.unlock(&plan.id);
                    return Err(err.into());
                }
                info!(plan = %plan.id, steps = plan.schedule.len(), "plan submitted");
                state
            }
        };

        let (engine, control) = self.engine(Arc::new(plan), state.clone(), Control::Run);
        self.spawn(engine, control).await;
        Ok(state)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn status(&self, plan_id: &str) -> EngineResult<RolloutState> {
        self.store
            .get_snapshot(plan_id)?
            .ok_or_else(|| EngineError::NotFound(plan_id.to_string()))
    }

    pub fn history(&self, plan_id: &str) -> EngineResult<Vec<AuditRecord>> {
        self.status(plan_id)?;
        Ok(self.store.list_audit(plan_id)?)
    }

    pub fn list(&self) -> EngineResult<Vec<RolloutState>> {
        Ok(self.store.list_snapshots()?)
    }

    pub fn plan(&self, plan_id: &str) -> EngineResult<RolloutPlan> {
        self.store
            .get_plan(plan_id)?
            .ok_or_else(|| EngineError::NotFound(plan_id.to_string()))
    }

    pub async fn is_running(&self, plan_id: &str) -> bool {
        self.running.read().await.contains_key(plan_id)
    }

    // ── Control ────────────────────────────────────────────────────

    /// Ask a running engine to hold at its next checkpoint.
    pub async fn pause(&self, plan_id: &str) -> EngineResult<RolloutState> {
        {
            let running = self.running.read().await;
            if let Some(engine) = running.get(plan_id) {
                engine.control.send_if_modified(|control| {
                    if *control == Control::Run {
                        *control = Control::Pause;
                        true
                    } else {
                        false
                    }
                });
                info!(plan = %plan_id, "pause requested");
                return self.status(plan_id);
            }
        }
        let state = self.status(plan_id)?;
        Err(EngineError::IllegalTransition {
            stage: state.stage,
            event: "pause".to_string(),
        })
    }

    /// Un-pause a running engine, or restart a halted one from the stage
    /// it was interrupted in.
    pub async fn resume(&self, plan_id: &str) -> EngineResult<RolloutState> {
        {
            let running = self.running.read().await;
            if let Some(engine) = running.get(plan_id) {
                engine.control.send_if_modified(|control| {
                    if *control == Control::Pause {
                        *control = Control::Run;
                        true
                    } else {
                        false
                    }
                });
                info!(plan = %plan_id, "resume requested");
                return self.status(plan_id);
            }
        }

        let mut state = self.status(plan_id)?;
        if state.stage.is_terminal() {
            return Err(EngineError::IllegalTransition {
                stage: state.stage,
                event: "resume".to_string(),
            });
        }
        let plan = Arc::new(self.plan(plan_id)?);
        self.lock(plan_id)?;

        if state.stage != Stage::Failed {
            // Idle but unfinished, e.g. paused when the daemon went down.
            if state.paused {
                state.paused = false;
                state.updated_at = now_millis();
                let record = AuditRecord::new(&state, AuditKind::Control, state.stage, "resumed");
                if let Err(err) = self.store.record_transition(&state, record) {
                    self.unlock(plan_id);
                    return Err(err.into());
                }
            }
            let (engine, control) = self.engine(plan, state.clone(), Control::Run);
            self.spawn(engine, control).await;
            return Ok(state);
        }

        let (mut engine, control) = self.engine(plan, state, Control::Run);
        if let Err(err) = engine.resume().await {
            self.unlock(plan_id);
            return Err(err);
        }
        let state = engine.state().clone();
        self.spawn(engine, control).await;
        Ok(state)
    }

    /// Roll a plan back. Signals a running engine, or starts a rollback
    /// engine for an idle one. Aborting a rolled-back plan is a no-op.
    pub async fn abort(&self, plan_id: &str) -> EngineResult<RolloutState> {
        {
            let running = self.running.read().await;
            if let Some(engine) = running.get(plan_id) {
                engine.control.send_replace(Control::Abort);
                info!(plan = %plan_id, "abort requested");
                return self.status(plan_id);
            }
        }

        let state = self.status(plan_id)?;
        match state.stage {
            Stage::RolledBack => return Ok(state),
            Stage::Completed => {
                return Err(EngineError::IllegalTransition {
                    stage: state.stage,
                    event: "abort_requested".to_string(),
                });
            }
            _ => {}
        }

        let plan = Arc::new(self.plan(plan_id)?);
        self.lock(plan_id)?;
        let (mut engine, control) = self.engine(plan, state, Control::Abort);
        if engine.state().stage != Stage::Aborting {
            if let Err(err) = engine.request_abort() {
                self.unlock(plan_id);
                return Err(err);
            }
        }
        let state = engine.state().clone();
        self.spawn(engine, control).await;
        Ok(state)
    }

    /// Approve the evaluation of `gate` the plan is waiting on. Fails with
    /// `Conflict` when the gate is not currently waiting, so a repeated
    /// approval cannot carry over to a later step.
    pub fn approve(&self, plan_id: &str, gate: &str) -> EngineResult<()> {
        self.ensure_gate(plan_id, gate)?;
        if self.approvals.approve(plan_id, gate) {
            Ok(())
        } else {
            Err(not_awaiting(plan_id, gate))
        }
    }

    pub fn reject(&self, plan_id: &str, gate: &str, reason: &str) -> EngineResult<()> {
        self.ensure_gate(plan_id, gate)?;
        if self.approvals.reject(plan_id, gate, reason) {
            Ok(())
        } else {
            Err(not_awaiting(plan_id, gate))
        }
    }

    /// Manual gates of the plan currently waiting on the operator.
    pub fn awaiting_gates(&self, plan_id: &str) -> EngineResult<Vec<AwaitingGate>> {
        self.status(plan_id)?;
        Ok(self.approvals.awaiting(plan_id))
    }

    fn ensure_gate(&self, plan_id: &str, gate: &str) -> EngineResult<()> {
        let plan = self.plan(plan_id)?;
        if plan.gates.iter().any(|g| g.name == gate) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("gate {gate} of plan {plan_id}")))
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Clear stale locks and restart every unfinished plan from its
    /// snapshot. Call once at startup, before accepting submissions.
    ///
    /// Halted (`Failed`) plans stay halted until an operator resumes or
    /// aborts them.
    pub async fn recover(&self) -> EngineResult<Vec<PlanId>> {
        let cleared = self.store.clear_locks()?;
        if cleared > 0 {
            warn!(cleared, "cleared stale plan locks");
        }

        let mut resumed = Vec::new();
        for state in self.store.list_snapshots()? {
            if state.stage.is_terminal() || state.stage == Stage::Failed {
                continue;
            }
            if self.is_running(&state.plan_id).await {
                continue;
            }
            let Some(plan) = self.store.get_plan(&state.plan_id)? else {
                warn!(plan = %state.plan_id, "snapshot without plan, skipping");
                continue;
            };

            self.lock(&state.plan_id)?;
            let initial = if state.paused {
                Control::Pause
            } else {
                Control::Run
            };
            let plan_id = state.plan_id.clone();
            info!(plan = %plan_id, stage = %state.stage, step = ?state.step_index, "recovering rollout");
            let (engine, control) = self.engine(Arc::new(plan), state, initial);
            self.spawn(engine, control).await;
            resumed.push(plan_id);
        }

        info!(count = resumed.len(), "recovery complete");
        Ok(resumed)
    }

    /// Wait for the plan's engine (if any) to stop, then return its state.
    pub async fn wait(&self, plan_id: &str) -> EngineResult<RolloutState> {
        let finished = self
            .running
            .read()
            .await
            .get(plan_id)
            .map(|engine| engine.finished.clone());
        if let Some(mut finished) = finished {
            // A dropped sender means the task was cancelled.
            let _ = finished.wait_for(|done| *done).await;
        }
        self.status(plan_id)
    }

    /// Drop a finished plan's body. Its snapshot and history are kept.
    pub fn gc(&self, plan_id: &str) -> EngineResult<bool> {
        let state = self.status(plan_id)?;
        if !state.stage.is_terminal() {
            return Err(EngineError::IllegalTransition {
                stage: state.stage,
                event: "gc".to_string(),
            });
        }
        self.approvals.clear(plan_id);
        Ok(self.store.gc_plan(plan_id)?)
    }

    /// Stop every engine where it stands. Locks are left in place and
    /// cleared by the next [`recover`](Self::recover).
    pub async fn shutdown(&self) {
        let mut running = self.running.write().await;
        for (plan_id, engine) in running.drain() {
            engine.handle.abort();
            debug!(plan = %plan_id, "engine stopped for shutdown");
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn engine(
        &self,
        plan: Arc<RolloutPlan>,
        state: RolloutState,
        initial: Control,
    ) -> (RolloutEngine, watch::Sender<Control>) {
        let (tx, rx) = watch::channel(initial);
        let gates = plan
            .gates
            .iter()
            .map(|spec| PlanGate {
                spec: spec.clone(),
                gate: build_gate(spec, &self.approvals),
            })
            .collect();
        let engine = RolloutEngine::new(
            plan,
            state,
            self.cluster.clone(),
            self.store.clone(),
            gates,
            rx,
        );
        (engine, tx)
    }

    /// Run `engine` on its own task. The caller holds the plan lock; the
    /// task releases it after deregistering the engine.
    async fn spawn(&self, engine: RolloutEngine, control: watch::Sender<Control>) {
        let plan_id = engine.state().plan_id.clone();
        let (done_tx, done_rx) = watch::channel(false);
        let running = self.running.clone();
        let store = self.store.clone();
        let owner = self.owner.clone();
        let approvals = self.approvals.clone();
        let id = plan_id.clone();

        // Registered before the task can finish and deregister itself.
        let mut guard = self.running.write().await;
        let handle = tokio::spawn(async move {
            match engine.run().await {
                Ok(state) => debug!(plan = %id, stage = %state.stage, "engine finished"),
                Err(err) => error!(plan = %id, error = %err, "engine stopped with error"),
            }
            running.write().await.remove(&id);
            approvals.clear(&id);
            if let Err(err) = store.unlock(&id, &owner) {
                warn!(plan = %id, error = %err, "failed to release plan lock");
            }
            let _ = done_tx.send(true);
        });
        guard.insert(
            plan_id,
            RunningEngine {
                control,
                finished: done_rx,
                handle,
            },
        );
    }

    fn lock(&self, plan_id: &str) -> EngineResult<()> {
        match self.store.try_lock(plan_id, &self.owner) {
            Ok(_) => Ok(()),
            Err(StateError::Locked { owner, .. }) => Err(EngineError::Conflict(format!(
                "plan {plan_id} is already running (locked by {owner})"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn unlock(&self, plan_id: &str) {
        if let Err(err) = self.store.unlock(plan_id, &self.owner) {
            warn!(plan = %plan_id, error = %err, "failed to release plan lock");
        }
    }
}

fn not_awaiting(plan_id: &str, gate: &str) -> EngineError {
    EngineError::Conflict(format!(
        "gate {gate} of plan {plan_id} is not awaiting a decision"
    ))
}
