//! Fixtures shared by engine and controller tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use rollgate_cluster::InMemoryCluster;
use rollgate_core::{
    GateKind, GateSpec, GateStage, LabelSelector, PodTemplate, RatioStep, RetryPolicy,
    RolloutPlan, RolloutPolicy, RoutingEndpointSpec, WorkloadGroupSpec,
};
use rollgate_gate::{GateContext, GateOutcome, VerificationGate};
use rollgate_state::{AuditKind, AuditRecord, RolloutState, Stage, StateStore, now_millis};

use crate::engine::{Control, PlanGate, RolloutEngine};

pub const SOURCE: &str = "web-v1";
pub const TARGET: &str = "web-v2";
pub const ENDPOINT: &str = "web";
pub const PLAN: &str = "web-v2-rollout";

pub fn fast_policy() -> RolloutPolicy {
    RolloutPolicy {
        auto_rollback: true,
        preparation_replicas: 1,
        step_timeout_ms: 2_000,
        poll_interval_ms: 1,
        gate_poll_interval_ms: 1,
        gate_deadline_ms: 2_000,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
    }
}

fn labels(version: &str) -> rollgate_core::Labels {
    [
        ("app".to_string(), "web".to_string()),
        ("version".to_string(), version.to_string()),
    ]
    .into()
}

pub fn source_group(replicas: u32) -> WorkloadGroupSpec {
    WorkloadGroupSpec {
        name: SOURCE.to_string(),
        replicas,
        template: PodTemplate {
            image: "registry/web:v1".to_string(),
            labels: labels("v1"),
            container_port: 8080,
            readiness: None,
        },
        resource_version: None,
    }
}

pub fn plan(schedule: &[(u32, u32)]) -> RolloutPlan {
    RolloutPlan {
        id: PLAN.to_string(),
        source: SOURCE.to_string(),
        target: WorkloadGroupSpec {
            name: TARGET.to_string(),
            replicas: 0,
            template: PodTemplate {
                image: "registry/web:v2".to_string(),
                labels: labels("v2"),
                container_port: 8080,
                readiness: None,
            },
            resource_version: None,
        },
        endpoint: RoutingEndpointSpec {
            name: ENDPOINT.to_string(),
            selector: LabelSelector::new([("app", "web")]),
            target_port: 8080,
        },
        schedule: schedule
            .iter()
            .map(|&(s, t)| RatioStep::new(s, t))
            .collect(),
        gates: Vec::new(),
        policy: fast_policy(),
    }
}

/// The canary schedule most tests run: `[(2,0), (1,1), (0,2)]`.
pub fn canary_plan() -> RolloutPlan {
    plan(&[(2, 0), (1, 1), (0, 2)])
}

pub fn seeded_cluster(source_replicas: u32) -> InMemoryCluster {
    let cluster = InMemoryCluster::new();
    cluster.insert_group(source_group(source_replicas));
    cluster
}

pub fn plan_gate(name: &str, stage: GateStage, gate: impl VerificationGate + 'static) -> PlanGate {
    PlanGate {
        spec: GateSpec {
            name: name.to_string(),
            stage,
            kind: GateKind::Readiness,
        },
        gate: Arc::new(gate),
    }
}

/// Register `plan` in `store` and build an engine for its fresh state.
pub fn new_engine(
    plan: &RolloutPlan,
    cluster: &InMemoryCluster,
    store: &StateStore,
    gates: Vec<PlanGate>,
) -> (RolloutEngine, watch::Sender<Control>) {
    let state = RolloutState::new(&plan.id, now_millis());
    let record = AuditRecord::new(&state, AuditKind::Control, Stage::Pending, "submitted");
    store.register_plan(plan, &state, record).unwrap();
    engine_from_snapshot(plan, cluster, store, gates)
}

/// Build an engine continuing from the stored snapshot, as after a restart.
pub fn engine_from_snapshot(
    plan: &RolloutPlan,
    cluster: &InMemoryCluster,
    store: &StateStore,
    gates: Vec<PlanGate>,
) -> (RolloutEngine, watch::Sender<Control>) {
    let state = store.get_snapshot(&plan.id).unwrap().unwrap();
    let (tx, rx) = watch::channel(Control::Run);
    let engine = RolloutEngine::new(
        Arc::new(plan.clone()),
        state,
        Arc::new(cluster.clone()),
        store.clone(),
        gates,
        rx,
    );
    (engine, tx)
}

/// Poll the stored snapshot until `pred` holds.
pub async fn wait_until<F>(store: &StateStore, plan_id: &str, pred: F) -> RolloutState
where
    F: Fn(&RolloutState) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(state) = store.get_snapshot(plan_id).unwrap() {
            if pred(&state) {
                return state;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting on {plan_id}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Fails at one schedule step, passes everywhere else.
pub struct FailAtStep(pub usize);

#[async_trait]
impl VerificationGate for FailAtStep {
    fn kind(&self) -> &'static str {
        "fail_at_step"
    }

    async fn evaluate(&self, _target: &str, ctx: &GateContext) -> GateOutcome {
        if ctx.step_index == Some(self.0) {
            GateOutcome::Fail("error rate 12% above 5% budget".to_string())
        } else {
            GateOutcome::Pass
        }
    }
}

/// Pending at one schedule step until released, passes everywhere else.
pub struct Latch {
    step: usize,
    open: Arc<AtomicBool>,
}

impl Latch {
    pub fn new(step: usize) -> (Self, Arc<AtomicBool>) {
        let open = Arc::new(AtomicBool::new(false));
        (
            Self {
                step,
                open: open.clone(),
            },
            open,
        )
    }
}

pub fn release(open: &AtomicBool) {
    open.store(true, Ordering::SeqCst);
}

#[async_trait]
impl VerificationGate for Latch {
    fn kind(&self) -> &'static str {
        "latch"
    }

    async fn evaluate(&self, _target: &str, ctx: &GateContext) -> GateOutcome {
        if ctx.step_index == Some(self.step) && !self.open.load(Ordering::SeqCst) {
            GateOutcome::Pending
        } else {
            GateOutcome::Pass
        }
    }
}

/// Never decides.
pub struct Hold;

#[async_trait]
impl VerificationGate for Hold {
    fn kind(&self) -> &'static str {
        "hold"
    }

    async fn evaluate(&self, _target: &str, _ctx: &GateContext) -> GateOutcome {
        GateOutcome::Pending
    }
}
