//! Rollout plans: the immutable description of a source to target transition.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::types::{RoutingEndpointSpec, WorkloadGroupSpec};

/// Unique identifier of a submitted plan.
pub type PlanId = String;

/// One entry of the replica ratio schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatioStep {
    pub source_replicas: u32,
    pub target_replicas: u32,
}

impl RatioStep {
    pub const fn new(source_replicas: u32, target_replicas: u32) -> Self {
        Self {
            source_replicas,
            target_replicas,
        }
    }

    pub fn total(&self) -> u32 {
        self.source_replicas.saturating_add(self.target_replicas)
    }

    /// Total replicas, or `None` if the sum does not fit in a `u32`.
    pub fn checked_total(&self) -> Option<u32> {
        self.source_replicas.checked_add(self.target_replicas)
    }
}

/// Point in the rollout at which a gate is evaluated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    /// Before the dark target is promoted into traffic.
    Prepare,
    /// After every confirmed ratio step.
    EachStep,
    /// After the final step, before the source is retired.
    #[default]
    Verify,
}

/// What a gate checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateKind {
    /// Target group reports enough ready replicas.
    Readiness,
    /// HTTP requests through a test endpoint carry the expected header.
    SyntheticTraffic {
        /// `host:port` of the test endpoint.
        address: String,
        #[serde(default = "default_probe_path")]
        path: String,
        header: String,
        expected: String,
        #[serde(default = "default_samples")]
        samples: u32,
        #[serde(default = "default_request_timeout_ms")]
        timeout_ms: u64,
    },
    /// Blocks until an operator approves or rejects.
    ManualApproval,
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_samples() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

/// A named verification gate attached to a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateSpec {
    pub name: String,
    #[serde(default)]
    pub stage: GateStage,
    #[serde(flatten)]
    pub kind: GateKind,
}

/// Bounded exponential backoff for cluster operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    ///
    /// Doubles from `base_delay_ms` and caps at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Tunables for how a plan is executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RolloutPolicy {
    /// Roll back automatically when a gate fails (otherwise halt in `Failed`).
    pub auto_rollback: bool,
    /// Replicas the dark target is created with.
    pub preparation_replicas: u32,
    /// Upper bound on waiting for a step to converge.
    pub step_timeout_ms: u64,
    /// Interval between convergence status polls.
    pub poll_interval_ms: u64,
    /// Interval between evaluations of a `Pending` gate.
    pub gate_poll_interval_ms: u64,
    /// A gate still `Pending` after this long fails.
    pub gate_deadline_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            auto_rollback: true,
            preparation_replicas: 1,
            step_timeout_ms: 300_000,
            poll_interval_ms: 1_000,
            gate_poll_interval_ms: 2_000,
            gate_deadline_ms: 600_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl RolloutPolicy {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn gate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.gate_poll_interval_ms)
    }

    pub fn gate_deadline(&self) -> Duration {
        Duration::from_millis(self.gate_deadline_ms)
    }
}

/// Immutable description of a desired source → target transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutPlan {
    pub id: PlanId,
    /// Name of the workload group currently serving traffic.
    pub source: String,
    /// Workload group to roll out. Its `replicas` field is ignored; the
    /// schedule decides replica counts.
    pub target: WorkloadGroupSpec,
    /// Endpoint whose selector is the label subset required for traffic.
    pub endpoint: RoutingEndpointSpec,
    pub schedule: Vec<RatioStep>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub policy: RolloutPolicy,
}

impl RolloutPlan {
    /// Parse a plan from JSON.
    pub fn from_json(s: &str) -> Result<Self, PlanError> {
        serde_json::from_str(s).map_err(|e| PlanError::Parse(e.to_string()))
    }

    /// Parse a plan from TOML.
    pub fn from_toml(s: &str) -> Result<Self, PlanError> {
        toml::from_str(s).map_err(|e| PlanError::Parse(e.to_string()))
    }

    /// Load a plan file, choosing the format by extension (`.toml` or JSON).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let plan = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            _ => Self::from_json(&content)?,
        };
        Ok(plan)
    }

    /// Replica count kept constant across every step.
    pub fn total_replicas(&self) -> u32 {
        self.schedule.first().map(RatioStep::total).unwrap_or(0)
    }

    /// Target replica count before schedule step `index` is applied. The
    /// target is promoted at the first step's count, so step 0 starts there.
    pub fn target_replicas_before(&self, index: usize) -> u32 {
        self.schedule
            .get(index.saturating_sub(1))
            .map_or(0, |step| step.target_replicas)
    }

    /// Check every structural invariant. Plans failing this never reach
    /// the engine.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.id.trim().is_empty() {
            return Err(PlanError::EmptyId);
        }
        if self.source.trim().is_empty() {
            return Err(PlanError::MissingField("source"));
        }
        if self.target.name.trim().is_empty() {
            return Err(PlanError::MissingField("target.name"));
        }
        if self.target.template.image.trim().is_empty() {
            return Err(PlanError::MissingField("target.template.image"));
        }
        if self.endpoint.name.trim().is_empty() {
            return Err(PlanError::MissingField("endpoint.name"));
        }
        if self.source == self.target.name {
            return Err(PlanError::SameWorkload(self.source.clone()));
        }
        if self.target.template.container_port == 0 {
            return Err(PlanError::ZeroPort("target container"));
        }
        if self.endpoint.target_port == 0 {
            return Err(PlanError::ZeroPort("endpoint target"));
        }
        if self.endpoint.selector.is_empty() {
            return Err(PlanError::EmptySelector);
        }

        let first = self.schedule.first().ok_or(PlanError::EmptySchedule)?;
        let expected = first
            .checked_total()
            .ok_or(PlanError::ReplicaOverflow { index: 0 })?;
        if expected == 0 {
            return Err(PlanError::ZeroTotal);
        }
        for (index, step) in self.schedule.iter().enumerate() {
            let actual = step
                .checked_total()
                .ok_or(PlanError::ReplicaOverflow { index })?;
            if actual != expected {
                return Err(PlanError::InconsistentTotal {
                    index,
                    expected,
                    actual,
                });
            }
        }
        // Non-empty checked above.
        let last = self.schedule[self.schedule.len() - 1];
        if last.source_replicas != 0 {
            return Err(PlanError::IncompleteFinalStep {
                source_replicas: last.source_replicas,
            });
        }

        let mut seen = HashSet::new();
        for gate in &self.gates {
            if gate.name.trim().is_empty() {
                return Err(PlanError::MissingField("gate name"));
            }
            if !seen.insert(gate.name.as_str()) {
                return Err(PlanError::DuplicateGate(gate.name.clone()));
            }
        }

        if self.policy.retry.max_attempts == 0 {
            return Err(PlanError::ZeroAttempts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LabelSelector, PodTemplate};

    fn test_plan(schedule: &[(u32, u32)]) -> RolloutPlan {
        RolloutPlan {
            id: "web-v2".to_string(),
            source: "web-v1".to_string(),
            target: WorkloadGroupSpec {
                name: "web-v2".to_string(),
                replicas: 0,
                template: PodTemplate {
                    image: "registry/web:v2".to_string(),
                    labels: [("version".to_string(), "v2".to_string())].into(),
                    container_port: 8080,
                    readiness: None,
                },
                resource_version: None,
            },
            endpoint: RoutingEndpointSpec {
                name: "web".to_string(),
                selector: LabelSelector::new([("app", "web")]),
                target_port: 8080,
            },
            schedule: schedule
                .iter()
                .map(|&(s, t)| RatioStep::new(s, t))
                .collect(),
            gates: Vec::new(),
            policy: RolloutPolicy::default(),
        }
    }

    #[test]
    fn canary_schedule_is_valid() {
        let plan = test_plan(&[(2, 0), (1, 1), (0, 2)]);
        assert_eq!(plan.validate(), Ok(()));
        assert_eq!(plan.total_replicas(), 2);
    }

    #[test]
    fn blue_green_is_a_two_step_schedule() {
        let plan = test_plan(&[(4, 0), (0, 4)]);
        assert_eq!(plan.validate(), Ok(()));
    }

    #[test]
    fn inconsistent_total_rejected() {
        let plan = test_plan(&[(3, 0), (2, 2), (0, 3)]);
        assert_eq!(
            plan.validate(),
            Err(PlanError::InconsistentTotal {
                index: 1,
                expected: 3,
                actual: 4
            })
        );
    }

    #[test]
    fn overflowing_step_rejected() {
        let plan = test_plan(&[(u32::MAX, 1), (0, 0)]);
        assert_eq!(
            plan.validate(),
            Err(PlanError::ReplicaOverflow { index: 0 })
        );

        let plan = test_plan(&[(2, 0), (u32::MAX, 2), (0, 2)]);
        assert_eq!(
            plan.validate(),
            Err(PlanError::ReplicaOverflow { index: 1 })
        );
    }

    #[test]
    fn empty_schedule_rejected() {
        let plan = test_plan(&[]);
        assert_eq!(plan.validate(), Err(PlanError::EmptySchedule));
    }

    #[test]
    fn zero_total_rejected() {
        let plan = test_plan(&[(0, 0)]);
        assert_eq!(plan.validate(), Err(PlanError::ZeroTotal));
    }

    #[test]
    fn final_step_must_drain_source() {
        let plan = test_plan(&[(3, 0), (1, 2)]);
        assert_eq!(
            plan.validate(),
            Err(PlanError::IncompleteFinalStep { source_replicas: 1 })
        );
    }

    #[test]
    fn empty_selector_rejected() {
        let mut plan = test_plan(&[(1, 0), (0, 1)]);
        plan.endpoint.selector = LabelSelector::default();
        assert_eq!(plan.validate(), Err(PlanError::EmptySelector));
    }

    #[test]
    fn same_source_and_target_rejected() {
        let mut plan = test_plan(&[(1, 0), (0, 1)]);
        plan.source = "web-v2".to_string();
        assert_eq!(
            plan.validate(),
            Err(PlanError::SameWorkload("web-v2".to_string()))
        );
    }

    #[test]
    fn duplicate_gate_names_rejected() {
        let mut plan = test_plan(&[(1, 0), (0, 1)]);
        let gate = GateSpec {
            name: "approve".to_string(),
            stage: GateStage::Verify,
            kind: GateKind::ManualApproval,
        };
        plan.gates = vec![gate.clone(), gate];
        assert_eq!(
            plan.validate(),
            Err(PlanError::DuplicateGate("approve".to_string()))
        );
    }

    #[test]
    fn zero_retry_attempts_rejected() {
        let mut plan = test_plan(&[(1, 0), (0, 1)]);
        plan.policy.retry.max_attempts = 0;
        assert_eq!(plan.validate(), Err(PlanError::ZeroAttempts));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn target_replicas_before_first_step_is_promotion_count() {
        let plan = test_plan(&[(2, 0), (1, 1), (0, 2)]);
        assert_eq!(plan.target_replicas_before(0), 0);
        assert_eq!(plan.target_replicas_before(2), 1);

        let plan = test_plan(&[(3, 1), (0, 4)]);
        assert_eq!(plan.target_replicas_before(0), 1);
        assert_eq!(plan.target_replicas_before(1), 1);
    }

    #[test]
    fn parses_toml_plan_with_defaults() {
        let toml_str = r#"
id = "web-v2"
source = "web-v1"
schedule = [
    { source_replicas = 2, target_replicas = 0 },
    { source_replicas = 0, target_replicas = 2 },
]

[target]
name = "web-v2"
replicas = 0

[target.template]
image = "registry/web:v2"
container_port = 8080

[endpoint]
name = "web"
target_port = 8080
selector = { app = "web" }

[[gates]]
name = "smoke"
stage = "each_step"
kind = "synthetic_traffic"
address = "127.0.0.1:9000"
header = "x-version"
expected = "v2"
"#;
        let plan = RolloutPlan::from_toml(toml_str).unwrap();
        assert_eq!(plan.validate(), Ok(()));
        assert_eq!(plan.policy, RolloutPolicy::default());
        assert_eq!(plan.gates[0].stage, GateStage::EachStep);
        match &plan.gates[0].kind {
            GateKind::SyntheticTraffic { path, samples, .. } => {
                assert_eq!(path, "/");
                assert_eq!(*samples, 3);
            }
            other => panic!("unexpected gate kind: {other:?}"),
        }
    }

    #[test]
    fn parses_json_plan() {
        let plan = test_plan(&[(1, 0), (0, 1)]);
        let json = serde_json::to_string(&plan).unwrap();
        let back = RolloutPlan::from_json(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            RolloutPlan::from_json("{not json"),
            Err(PlanError::Parse(_))
        ));
    }
}
