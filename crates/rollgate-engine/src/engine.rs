//! Rollout engine: executes one plan against the cluster.
//!
//! The engine owns the plan's `RolloutState` and drives it through the
//! stages in [`crate::machine`]. Every stage change and every confirmed
//! ratio step is persisted before the engine moves on, so a restarted
//! engine continues from the last snapshot instead of from `Pending`.
//!
//! # Stage work
//!
//! ```text
//! Preparing   endpoint + source snapshot + dark target, readiness, prepare gates, promote
//! Shifting    per step: apply growing side, apply shrinking side, converge, confirm, step gates
//! Verifying   verify gates
//! Finalizing  delete source, wait until gone
//! Aborting    restore source, converge, target to zero and dark
//! ```
//!
//! Operator control arrives through a `watch` channel. Pause is honored at
//! checkpoints between units of work; abort cancels any convergence wait,
//! backoff sleep or gate poll in flight (except while already rolling back).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rollgate_cluster::ClusterClient;
use rollgate_core::{ClusterError, ClusterResult, GateSpec, GateStage, RolloutPlan, WorkloadGroupSpec};
use rollgate_gate::{GateContext, GateVerdict, ReadinessGate, VerificationGate, poll_gate};
use rollgate_state::{AuditKind, AuditRecord, RolloutState, Stage, StateStore, now_millis};

use crate::error::{EngineError, EngineResult};
use crate::machine::{Event, next_stage};

/// Name under which the built-in target readiness check is audited.
pub const TARGET_READINESS_GATE: &str = "target-readiness";

/// Operator control signal for a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    #[default]
    Run,
    Pause,
    Abort,
}

/// A plan's gate spec paired with its implementation.
#[derive(Clone)]
pub struct PlanGate {
    pub spec: GateSpec,
    pub gate: Arc<dyn VerificationGate>,
}

/// Drives a single rollout plan to a terminal or halted stage.
pub struct RolloutEngine {
    plan: Arc<RolloutPlan>,
    state: RolloutState,
    cluster: Arc<dyn ClusterClient>,
    store: StateStore,
    gates: Vec<PlanGate>,
    control: watch::Receiver<Control>,
}

impl RolloutEngine {
    pub fn new(
        plan: Arc<RolloutPlan>,
        state: RolloutState,
        cluster: Arc<dyn ClusterClient>,
        store: StateStore,
        gates: Vec<PlanGate>,
        control: watch::Receiver<Control>,
    ) -> Self {
        Self {
            plan,
            state,
            cluster,
            store,
            gates,
            control,
        }
    }

    pub fn state(&self) -> &RolloutState {
        &self.state
    }

    /// Run until the rollout is `Completed`, `RolledBack` or `Failed`.
    ///
    /// Returns the final state. Errors are only returned when the state
    /// could not be persisted; every other failure is recorded in the state.
    pub async fn run(mut self) -> EngineResult<RolloutState> {
        info!(
            plan = %self.plan.id,
            stage = %self.state.stage,
            step = ?self.state.step_index,
            "engine started"
        );

        loop {
            let stage = self.state.stage;
            if stage.is_terminal() || stage == Stage::Failed {
                info!(
                    plan = %self.plan.id,
                    stage = %stage,
                    step = ?self.state.step_index,
                    "engine stopped"
                );
                return Ok(self.state);
            }

            let control = *self.control.borrow();
            let result = if stage != Stage::Aborting && control == Control::Abort {
                Err(EngineError::Aborted)
            } else {
                self.advance().await
            };
            if let Err(err) = result {
                self.handle_error(err)?;
            }
        }
    }

    /// Move a `Failed` rollout back to the stage it was interrupted in.
    ///
    /// Resource versions are re-read from the cluster: resuming is the
    /// operator's acknowledgement of whatever changed while halted.
    pub async fn resume(&mut self) -> EngineResult<()> {
        if next_stage(&self.state, Event::Resume).is_none() {
            return Err(EngineError::IllegalTransition {
                stage: self.state.stage,
                event: Event::Resume.to_string(),
            });
        }

        let names = [self.plan.source.clone(), self.plan.target.name.clone()];
        for name in names {
            let current = self
                .with_retry(&format!("resume: get {name}"), || {
                    self.cluster.get_workload_group(&name)
                })
                .await?;
            match current.and_then(|spec| spec.resource_version) {
                Some(version) => self.state.resource_versions.insert(name, version),
                None => self.state.resource_versions.remove(&name),
            };
        }

        let detail = match self.state.last_error.take() {
            Some(err) => format!("resumed after: {err}"),
            None => "resumed".to_string(),
        };
        self.state.paused = false;
        self.transition(Event::Resume, detail)
    }

    /// Enter `Aborting` from any non-terminal stage, including `Failed`.
    pub fn request_abort(&mut self) -> EngineResult<()> {
        info!(plan = %self.plan.id, stage = %self.state.stage, "abort requested");
        self.state.paused = false;
        self.transition(Event::AbortRequested, "abort requested by operator")
    }

    async fn advance(&mut self) -> EngineResult<()> {
        match self.state.stage {
            Stage::Pending => {
                self.checkpoint().await?;
                self.transition(Event::Begin, "rollout started")
            }
            Stage::Preparing => self.prepare().await,
            Stage::Shifting => self.shift().await,
            Stage::Verifying => self.verify().await,
            Stage::Finalizing => self.finalize().await,
            Stage::Aborting => self.rollback().await,
            stage => Err(EngineError::IllegalTransition {
                stage,
                event: "advance".to_string(),
            }),
        }
    }

    /// Route a stage failure to abort, rollback or halt.
    fn handle_error(&mut self, err: EngineError) -> EngineResult<()> {
        match err {
            EngineError::Aborted => self.request_abort(),
            EngineError::VerificationFailed { .. } if self.plan.policy.auto_rollback => {
                warn!(
                    plan = %self.plan.id,
                    stage = %self.state.stage,
                    step = ?self.state.step_index,
                    error = %err,
                    "verification failed, rolling back"
                );
                self.state.last_error = Some(err.to_string());
                self.transition(Event::AbortRequested, format!("rolling back: {err}"))
            }
            EngineError::State(_) | EngineError::IllegalTransition { .. } => Err(err),
            err => {
                warn!(
                    plan = %self.plan.id,
                    stage = %self.state.stage,
                    step = ?self.state.step_index,
                    error = %err,
                    "rollout halted"
                );
                self.state.last_error = Some(err.to_string());
                self.transition(Event::Halt, err.to_string())
            }
        }
    }

    // ── Stages ─────────────────────────────────────────────────────

    async fn prepare(&mut self) -> EngineResult<()> {
        self.checkpoint().await?;
        let plan = self.plan.clone();

        if self.state.source_snapshot.is_none() {
            let source = self
                .with_retry(&format!("get {}", plan.source), || {
                    self.cluster.get_workload_group(&plan.source)
                })
                .await?
                .ok_or_else(|| ClusterError::NotFound(plan.source.clone()))?;
            if let Some(version) = source.resource_version {
                self.state.resource_versions.insert(source.name.clone(), version);
            }
            info!(
                plan = %plan.id,
                source = %source.name,
                replicas = source.replicas,
                "captured source snapshot"
            );
            self.state.source_snapshot = Some(source);
            self.save()?;
        }
        // Traffic must keep reaching the source until the target is live.
        if let Some(source) = &self.state.source_snapshot {
            self.ensure_routable(source)?;
        }

        self.with_retry(&format!("apply endpoint {}", plan.endpoint.name), || {
            self.cluster.apply_routing_endpoint(&plan.endpoint)
        })
        .await?;

        let replicas = plan.policy.preparation_replicas;
        let dark = plan
            .target
            .relabeled(plan.target.dark_labels(&plan.endpoint.selector))
            .with_replicas(replicas);
        self.apply_tracked(dark, &format!("create dark {} replicas={replicas}", plan.target.name))
            .await?;
        self.wait_converged(&[(plan.target.name.clone(), replicas)]).await?;

        self.run_gate(TARGET_READINESS_GATE, &ReadinessGate, replicas, None)
            .await?;
        self.run_gates(GateStage::Prepare, replicas, None).await?;

        // Promote at the first step's target count so the schedule, not the
        // preparation size, decides the first traffic split.
        let promoted = plan.schedule[0].target_replicas;
        let live = plan
            .target
            .relabeled(plan.target.live_labels(&plan.endpoint.selector))
            .with_replicas(promoted);
        self.ensure_routable(&live)?;
        self.apply_tracked(live, &format!("promote {} replicas={promoted}", plan.target.name))
            .await?;
        self.wait_converged(&[(plan.target.name.clone(), promoted)]).await?;
        self.state.target_live = true;
        self.transition(
            Event::TargetPromoted,
            format!("{} promoted with {promoted} replicas", plan.target.name),
        )
    }

    async fn shift(&mut self) -> EngineResult<()> {
        let plan = self.plan.clone();
        loop {
            self.checkpoint().await?;

            // A confirmed step whose gates never passed (crash, resume) is
            // verified before anything else is applied.
            if let Some(index) = self.state.step_index {
                if self.state.verified_step != Some(index) {
                    let target = plan.schedule[index].target_replicas;
                    self.run_gates(GateStage::EachStep, target, Some(index)).await?;
                    self.state.verified_step = Some(index);
                    self.save()?;
                    continue;
                }
            }

            let index = self.state.next_step();
            if index >= plan.schedule.len() {
                return self.transition(
                    Event::ScheduleComplete,
                    format!("schedule complete after {} steps", plan.schedule.len()),
                );
            }
            self.apply_step(index).await?;
        }
    }

    /// Apply schedule step `index` and confirm it once both groups converged.
    async fn apply_step(&mut self, index: usize) -> EngineResult<()> {
        let plan = self.plan.clone();
        let step = plan.schedule[index];
        let source = self
            .state
            .source_snapshot
            .clone()
            .ok_or_else(|| EngineError::NotFound(format!("source snapshot of {}", plan.id)))?;

        let source_update = source.with_replicas(step.source_replicas);
        let target_update = plan
            .target
            .relabeled(plan.target.live_labels(&plan.endpoint.selector))
            .with_replicas(step.target_replicas);

        // Grow before shrinking so capacity never dips below the total.
        let updates = if step.target_replicas >= plan.target_replicas_before(index) {
            [target_update, source_update]
        } else {
            [source_update, target_update]
        };

        info!(
            plan = %plan.id,
            step = index,
            source = step.source_replicas,
            target = step.target_replicas,
            "applying ratio step"
        );
        for update in updates {
            let what = format!("step {index}: apply {} replicas={}", update.name, update.replicas);
            self.apply_tracked(update, &what).await?;
        }

        self.wait_converged(&[
            (plan.source.clone(), step.source_replicas),
            (plan.target.name.clone(), step.target_replicas),
        ])
        .await?;

        self.state.step_index = Some(index);
        self.state.updated_at = now_millis();
        let record = AuditRecord::new(
            &self.state,
            AuditKind::Transition,
            Stage::Shifting,
            format!(
                "step {index} confirmed: source={} target={}",
                step.source_replicas, step.target_replicas
            ),
        );
        self.store.record_transition(&self.state, record)?;
        info!(plan = %plan.id, step = index, "ratio step confirmed");
        Ok(())
    }

    async fn verify(&mut self) -> EngineResult<()> {
        self.checkpoint().await?;
        let total = self.plan.total_replicas();
        self.run_gates(GateStage::Verify, total, self.state.step_index)
            .await?;
        self.transition(Event::GatesPassed, "verification gates passed")
    }

    async fn finalize(&mut self) -> EngineResult<()> {
        self.checkpoint().await?;
        let source = self.plan.source.clone();

        self.with_retry(&format!("delete {source}"), || {
            self.cluster.delete_workload_group(&source)
        })
        .await?;
        self.state.resource_versions.remove(&source);
        self.save()?;

        let timeout = self.plan.policy.step_timeout();
        let started = Instant::now();
        loop {
            let observed = match self.cluster.workload_group_status(&source).await {
                Ok(status) if status.is_gone() => break,
                Ok(status) => status.observed_replicas,
                Err(err) if err.is_retryable() => {
                    debug!(plan = %self.plan.id, group = %source, error = %err, "status unavailable");
                    0
                }
                Err(err) => return Err(err.into()),
            };
            if started.elapsed() >= timeout {
                return Err(EngineError::ConvergenceTimeout {
                    group: source,
                    desired: 0,
                    observed,
                    timeout_ms: self.plan.policy.step_timeout_ms,
                });
            }
            self.sleep(self.plan.policy.poll_interval()).await?;
        }

        self.transition(Event::SourceRetired, format!("{source} retired"))
    }

    /// Restore the pre-rollout topology.
    ///
    /// Works from whatever the cluster currently holds, with fresh resource
    /// versions, so replaying it after a partial rollback converges to the
    /// same end state.
    async fn rollback(&mut self) -> EngineResult<()> {
        let plan = self.plan.clone();
        info!(plan = %plan.id, step = ?self.state.step_index, "rolling back");

        if let Some(original) = self.state.source_snapshot.clone() {
            // Darkening a live target would leave the endpoint nothing to route to.
            if self.state.target_live {
                self.ensure_routable(&original)?;
            }
            let current = self
                .with_retry(&format!("rollback: get {}", original.name), || {
                    self.cluster.get_workload_group(&original.name)
                })
                .await?;
            let restore = WorkloadGroupSpec {
                resource_version: current.and_then(|spec| spec.resource_version),
                ..original.clone()
            };
            let what = format!("rollback: restore {} replicas={}", original.name, original.replicas);
            let version = self
                .with_retry(&what, || self.cluster.apply_workload_group(&restore))
                .await?;
            self.state.resource_versions.insert(original.name.clone(), version);
            self.save()?;
            self.wait_converged(&[(original.name.clone(), original.replicas)])
                .await?;
        }

        let target = plan.target.name.clone();
        let current = self
            .with_retry(&format!("rollback: get {target}"), || {
                self.cluster.get_workload_group(&target)
            })
            .await?;
        if let Some(current) = current {
            let dark = current
                .relabeled(plan.target.dark_labels(&plan.endpoint.selector))
                .with_replicas(0);
            let version = self
                .with_retry(&format!("rollback: darken {target}"), || {
                    self.cluster.apply_workload_group(&dark)
                })
                .await?;
            self.state.resource_versions.insert(target.clone(), version);
            self.state.target_live = false;
            self.save()?;
            self.wait_converged(&[(target.clone(), 0)]).await?;
        }

        self.state.target_live = false;
        self.state.step_index = None;
        self.state.verified_step = None;
        let restored = self
            .state
            .source_snapshot
            .as_ref()
            .map_or(0, |source| source.replicas);
        self.transition(
            Event::RollbackConverged,
            format!("{} restored with {restored} replicas, {target} dark", plan.source),
        )
    }

    /// Fail unless the plan's endpoint selector matches `group`'s labels.
    fn ensure_routable(&self, group: &WorkloadGroupSpec) -> EngineResult<()> {
        let endpoint = &self.plan.endpoint;
        if endpoint.selector.matches(&group.template.labels) {
            return Ok(());
        }
        warn!(
            plan = %self.plan.id,
            endpoint = %endpoint.name,
            group = %group.name,
            "endpoint selector matches no live group"
        );
        Err(EngineError::Unroutable {
            endpoint: endpoint.name.clone(),
            group: group.name.clone(),
        })
    }

    // ── Gates ──────────────────────────────────────────────────────

    async fn run_gates(
        &self,
        stage: GateStage,
        expected_replicas: u32,
        step: Option<usize>,
    ) -> EngineResult<()> {
        for planned in self.gates.iter().filter(|g| g.spec.stage == stage) {
            self.run_gate(&planned.spec.name, planned.gate.as_ref(), expected_replicas, step)
                .await?;
        }
        Ok(())
    }

    async fn run_gate(
        &self,
        name: &str,
        gate: &dyn VerificationGate,
        expected_replicas: u32,
        step: Option<usize>,
    ) -> EngineResult<()> {
        let policy = &self.plan.policy;
        let ctx = GateContext {
            plan_id: self.plan.id.clone(),
            gate: name.to_string(),
            expected_replicas,
            step_index: step,
            cluster: self.cluster.clone(),
        };
        debug!(plan = %self.plan.id, gate = %name, kind = gate.kind(), ?step, "evaluating gate");

        let verdict = poll_gate(
            gate,
            &self.plan.target.name,
            &ctx,
            policy.gate_poll_interval(),
            policy.gate_deadline(),
            self.abort_signal(),
        )
        .await;

        match verdict {
            GateVerdict::Passed => {
                info!(plan = %self.plan.id, gate = %name, ?step, "gate passed");
                self.audit(AuditKind::Gate, format!("gate {name} ({}) passed", gate.kind()))
            }
            GateVerdict::Failed(reason) => {
                warn!(plan = %self.plan.id, gate = %name, ?step, %reason, "gate failed");
                self.audit(
                    AuditKind::Gate,
                    format!("gate {name} ({}) failed: {reason}", gate.kind()),
                )?;
                Err(EngineError::VerificationFailed {
                    gate: name.to_string(),
                    reason,
                })
            }
            GateVerdict::Cancelled => Err(EngineError::Aborted),
        }
    }

    // ── Cluster helpers ────────────────────────────────────────────

    /// Write `spec` guarded by the resource version this engine last wrote
    /// for the group, then persist the new version.
    ///
    /// A conflict where the cluster already holds exactly `spec` is this
    /// engine's own write whose version never reached the store (a crash
    /// between the two); the current version is adopted instead.
    async fn apply_tracked(&mut self, mut spec: WorkloadGroupSpec, what: &str) -> EngineResult<u64> {
        spec.resource_version = self.state.resource_versions.get(&spec.name).copied();
        let version = match self
            .with_retry(what, || self.cluster.apply_workload_group(&spec))
            .await
        {
            Ok(version) => version,
            Err(EngineError::Conflict(msg)) => match self.applied_version(&spec, what).await? {
                Some(version) => version,
                None => return Err(EngineError::Conflict(msg)),
            },
            Err(err) => return Err(err),
        };
        self.state.resource_versions.insert(spec.name.clone(), version);
        self.save()?;
        Ok(version)
    }

    /// Current resource version of `spec.name` if the cluster's desired
    /// state already equals `spec`.
    async fn applied_version(&self, spec: &WorkloadGroupSpec, what: &str) -> EngineResult<Option<u64>> {
        let current = self
            .with_retry(&format!("{what}: re-read"), || {
                self.cluster.get_workload_group(&spec.name)
            })
            .await?;
        let Some(current) = current else {
            return Ok(None);
        };
        let Some(version) = current.resource_version else {
            return Ok(None);
        };
        let unversioned = |group: &WorkloadGroupSpec| WorkloadGroupSpec {
            resource_version: None,
            ..group.clone()
        };
        if unversioned(&current) != unversioned(spec) {
            return Ok(None);
        }
        info!(
            plan = %self.plan.id,
            group = %spec.name,
            version,
            "write already present in cluster, adopting its version"
        );
        self.audit(
            AuditKind::Attempt,
            format!("{what}: already applied at version {version}"),
        )?;
        Ok(Some(version))
    }

    /// Run a cluster operation, retrying transient errors with backoff.
    ///
    /// Every attempt is written to the audit log. Non-transient errors
    /// (including conflicts) are returned immediately.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClusterResult<T>>,
    {
        let retry = &self.plan.policy.retry;
        let mut attempt = 1;
        loop {
            let result = op().await;
            let outcome = match &result {
                Ok(_) => "ok".to_string(),
                Err(err) => err.to_string(),
            };
            self.audit(
                AuditKind::Attempt,
                format!("{what}: attempt {attempt}/{}: {outcome}", retry.max_attempts),
            )?;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        plan = %self.plan.id,
                        op = %what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "cluster operation failed, retrying"
                    );
                    self.sleep(delay).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Poll until every `(group, desired)` pair reports
    /// `observed_replicas == desired`, bounded by the step timeout.
    async fn wait_converged(&self, groups: &[(String, u32)]) -> EngineResult<()> {
        let policy = &self.plan.policy;
        let started = Instant::now();
        loop {
            let mut lagging = None;
            for (name, desired) in groups {
                let observed = match self.cluster.workload_group_status(name).await {
                    Ok(status) if status.exists && !status.terminating => status.observed_replicas,
                    Ok(_) => 0,
                    Err(err) if err.is_retryable() => {
                        debug!(plan = %self.plan.id, group = %name, error = %err, "status unavailable");
                        if lagging.is_none() {
                            lagging = Some((name.clone(), *desired, 0));
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                if observed != *desired && lagging.is_none() {
                    lagging = Some((name.clone(), *desired, observed));
                }
            }

            let Some((group, desired, observed)) = lagging else {
                return Ok(());
            };
            let elapsed = started.elapsed();
            if elapsed >= policy.step_timeout() {
                return Err(EngineError::ConvergenceTimeout {
                    group,
                    desired,
                    observed,
                    timeout_ms: policy.step_timeout_ms,
                });
            }
            debug!(plan = %self.plan.id, %group, desired, observed, "waiting for convergence");
            self.sleep(policy.poll_interval().min(policy.step_timeout() - elapsed))
                .await?;
        }
    }

    // ── Control ────────────────────────────────────────────────────

    /// Honor a pending pause: persist `paused`, then wait for resume or abort.
    async fn checkpoint(&mut self) -> EngineResult<()> {
        let control = *self.control.borrow_and_update();
        match control {
            Control::Run => return Ok(()),
            Control::Abort => return Err(EngineError::Aborted),
            Control::Pause => {}
        }

        info!(plan = %self.plan.id, stage = %self.state.stage, step = ?self.state.step_index, "rollout paused");
        self.state.paused = true;
        self.record_control("paused")?;

        loop {
            if self.control.changed().await.is_err() {
                // Controller is gone; stay parked until the task is dropped.
                std::future::pending::<()>().await;
            }
            let control = *self.control.borrow_and_update();
            match control {
                Control::Pause => continue,
                Control::Abort => return Err(EngineError::Aborted),
                Control::Run => {
                    info!(plan = %self.plan.id, stage = %self.state.stage, "rollout resumed");
                    self.state.paused = false;
                    return self.record_control("resumed");
                }
            }
        }
    }

    /// Resolves once an abort is signalled. Never resolves while the engine
    /// is already rolling back.
    fn abort_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut control = self.control.clone();
        let cancellable = self.state.stage != Stage::Aborting;
        async move {
            if !cancellable {
                return std::future::pending().await;
            }
            loop {
                if *control.borrow_and_update() == Control::Abort {
                    return;
                }
                if control.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> EngineResult<()> {
        tokio::select! {
            biased;
            _ = self.abort_signal() => Err(EngineError::Aborted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Apply `event` through the stage machine and persist the result with
    /// its audit record in one write.
    fn transition(&mut self, event: Event, detail: impl Into<String>) -> EngineResult<()> {
        let from = self.state.stage;
        let to = next_stage(&self.state, event).ok_or_else(|| EngineError::IllegalTransition {
            stage: from,
            event: event.to_string(),
        })?;

        match event {
            Event::Halt => self.state.failed_stage = Some(from),
            Event::Resume => self.state.failed_stage = None,
            _ => {}
        }
        let now = now_millis();
        self.state.stage = to;
        self.state.updated_at = now;
        if to.is_terminal() {
            self.state.finished_at = Some(now);
        }

        let record = AuditRecord::new(&self.state, AuditKind::Transition, from, detail);
        self.store.record_transition(&self.state, record)?;
        info!(
            plan = %self.plan.id,
            %from,
            %to,
            %event,
            step = ?self.state.step_index,
            "stage transition"
        );
        Ok(())
    }

    fn record_control(&mut self, detail: &str) -> EngineResult<()> {
        self.state.updated_at = now_millis();
        let record = AuditRecord::new(&self.state, AuditKind::Control, self.state.stage, detail);
        self.store.record_transition(&self.state, record)?;
        Ok(())
    }

    fn audit(&self, kind: AuditKind, detail: String) -> EngineResult<()> {
        let mut record = AuditRecord::new(&self.state, kind, self.state.stage, detail);
        record.timestamp = now_millis();
        self.store.append_audit(record)?;
        Ok(())
    }

    fn save(&mut self) -> EngineResult<()> {
        self.state.updated_at = now_millis();
        self.store.put_snapshot(&self.state)?;
        Ok(())
    }
}
