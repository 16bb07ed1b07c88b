//! Shared fixtures for gate tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rollgate_cluster::InMemoryCluster;
use rollgate_core::{Labels, PodTemplate, WorkloadGroupSpec};

use crate::gate::{GateContext, GateOutcome, VerificationGate};

/// Gate that replays a fixed script, then repeats its last outcome.
pub struct ScriptedGate {
    script: Mutex<VecDeque<GateOutcome>>,
    last: Mutex<GateOutcome>,
    evaluations: Mutex<u32>,
}

impl ScriptedGate {
    pub fn new<I: IntoIterator<Item = GateOutcome>>(outcomes: I) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            last: Mutex::new(GateOutcome::Pending),
            evaluations: Mutex::new(0),
        }
    }

    pub fn always(outcome: GateOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(outcome),
            evaluations: Mutex::new(0),
        }
    }

    pub fn evaluations(&self) -> u32 {
        *self.evaluations.lock().unwrap()
    }
}

#[async_trait]
impl VerificationGate for ScriptedGate {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn evaluate(&self, _target: &str, _ctx: &GateContext) -> GateOutcome {
        *self.evaluations.lock().unwrap() += 1;
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            *last = next;
        }
        last.clone()
    }
}

pub fn group(name: &str, replicas: u32) -> WorkloadGroupSpec {
    WorkloadGroupSpec {
        name: name.to_string(),
        replicas,
        template: PodTemplate {
            image: format!("registry/{name}"),
            labels: Labels::new(),
            container_port: 8080,
            readiness: None,
        },
        resource_version: None,
    }
}

pub fn cluster_context(expected_replicas: u32) -> (InMemoryCluster, GateContext) {
    let cluster = InMemoryCluster::new();
    let ctx = GateContext {
        plan_id: "plan-1".to_string(),
        gate: "gate".to_string(),
        expected_replicas,
        step_index: None,
        cluster: Arc::new(cluster.clone()),
    };
    (cluster, ctx)
}

pub fn test_context() -> GateContext {
    cluster_context(1).1
}
