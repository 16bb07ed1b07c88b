//! Cluster-facing data model shared across rollgate crates.
//!
//! These types describe what the orchestration platform manages:
//! workload groups (a replica set of pods running one version) and
//! routing endpoints (a selector-based entry point). The rollout engine
//! only ever refers to them by name and mutates them through a
//! `ClusterClient`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Pod labels, ordered for stable serialization.
pub type Labels = BTreeMap<String, String>;

/// Label key added to a target group while it is staged outside traffic.
pub const STAGE_LABEL: &str = "rollgate.io/stage";

/// Value of [`STAGE_LABEL`] on a dark (not traffic-eligible) group.
pub const STAGE_DARK: &str = "dark";

// ── Selector ──────────────────────────────────────────────────────

/// Set of `key=value` constraints a workload group must carry to
/// receive traffic from a routing endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LabelSelector {
    pub match_labels: Labels,
}

impl LabelSelector {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// True when every constraint is present in `labels` with an equal value.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

// ── Workload group ────────────────────────────────────────────────

/// Readiness check carried in the pod template.
///
/// The platform evaluates it; rollgate only reads the resulting
/// `ready_replicas` count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadinessCheck {
    /// HTTP path to probe (e.g., "/healthz").
    pub path: String,
    pub port: u16,
    /// Probe period (e.g., "5s").
    #[serde(default = "default_period")]
    pub period: String,
    /// Timeout per probe (e.g., "2s").
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Consecutive failures before a pod is marked unready.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_period() -> String {
    "5s".to_string()
}

fn default_timeout() -> String {
    "2s".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

/// Template for the pods of a workload group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodTemplate {
    /// Container image reference (e.g., "registry/app:v2").
    pub image: String,
    #[serde(default)]
    pub labels: Labels,
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ReadinessCheck>,
}

/// Desired state of a workload group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadGroupSpec {
    pub name: String,
    #[serde(default)]
    pub replicas: u32,
    pub template: PodTemplate,
    /// Version the writer last observed. `None` applies unconditionally;
    /// `Some(v)` is rejected with a conflict if the cluster holds another version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<u64>,
}

impl WorkloadGroupSpec {
    /// Copy of this spec with a different replica count.
    pub fn with_replicas(&self, replicas: u32) -> Self {
        Self {
            replicas,
            ..self.clone()
        }
    }

    /// Labels that make this group match `selector`.
    ///
    /// The template labels overlaid with the selector constraints, with the
    /// dark stage marker removed.
    pub fn live_labels(&self, selector: &LabelSelector) -> Labels {
        let mut labels = self.template.labels.clone();
        labels.remove(STAGE_LABEL);
        for (k, v) in &selector.match_labels {
            labels.insert(k.clone(), v.clone());
        }
        labels
    }

    /// Labels that deliberately fail `selector`.
    ///
    /// Every selector key is stripped and the dark stage marker added, so a
    /// non-empty selector can never match.
    pub fn dark_labels(&self, selector: &LabelSelector) -> Labels {
        let mut labels = self.template.labels.clone();
        for k in selector.match_labels.keys() {
            labels.remove(k);
        }
        labels.insert(STAGE_LABEL.to_string(), STAGE_DARK.to_string());
        labels
    }

    /// Copy of this spec carrying the given label set.
    pub fn relabeled(&self, labels: Labels) -> Self {
        let mut spec = self.clone();
        spec.template.labels = labels;
        spec
    }
}

/// Observed state of a workload group as reported by the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadGroupStatus {
    pub exists: bool,
    pub observed_replicas: u32,
    pub ready_replicas: u32,
    /// Deletion requested but not yet complete.
    #[serde(default)]
    pub terminating: bool,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: Labels,
}

impl WorkloadGroupStatus {
    /// Status for a group the cluster does not know about.
    pub fn absent() -> Self {
        Self::default()
    }

    /// Whether the group has been removed (or is on its way out).
    pub fn is_gone(&self) -> bool {
        !self.exists || self.terminating
    }
}

// ── Routing endpoint ──────────────────────────────────────────────

/// Stable network entry point forwarding to groups matching `selector`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingEndpointSpec {
    pub name: String,
    pub selector: LabelSelector,
    pub target_port: u16,
}
