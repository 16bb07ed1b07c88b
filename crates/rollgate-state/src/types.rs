//! Persisted rollout state: stage snapshots, audit records and locks.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use rollgate_core::{PlanId, WorkloadGroupSpec};

// ── Stage ─────────────────────────────────────────────────────────

/// Stage of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Submitted, nothing touched yet.
    Pending,
    /// Target created with the dark label set, awaiting readiness.
    Preparing,
    /// Walking the replica ratio schedule.
    Shifting,
    /// Final step applied, running verification gates.
    Verifying,
    /// Retiring the source workload group.
    Finalizing,
    Completed,
    /// Restoring the pre-rollout topology.
    Aborting,
    RolledBack,
    /// Halted on an unrecoverable error; awaits resume or rollback.
    Failed,
}

impl Stage {
    /// Completed and RolledBack never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Preparing => "preparing",
            Stage::Shifting => "shifting",
            Stage::Verifying => "verifying",
            Stage::Finalizing => "finalizing",
            Stage::Completed => "completed",
            Stage::Aborting => "aborting",
            Stage::RolledBack => "rolled_back",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Snapshot ──────────────────────────────────────────────────────

/// Current state of one plan's rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutState {
    pub plan_id: PlanId,
    pub stage: Stage,
    /// Last schedule step whose updates both converged.
    pub step_index: Option<usize>,
    /// Last schedule step whose per-step gates passed.
    #[serde(default)]
    pub verified_step: Option<usize>,
    /// Target carries the live label set.
    #[serde(default)]
    pub target_live: bool,
    #[serde(default)]
    pub paused: bool,
    /// Source group as it was before the rollout touched it.
    #[serde(default)]
    pub source_snapshot: Option<WorkloadGroupSpec>,
    /// Resource version the engine last wrote per workload group.
    #[serde(default)]
    pub resource_versions: BTreeMap<String, u64>,
    /// Stage that was interrupted when the rollout entered `Failed`.
    #[serde(default)]
    pub failed_stage: Option<Stage>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Unix timestamp (milliseconds) of submission.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last persisted change.
    pub updated_at: u64,
    #[serde(default)]
    pub finished_at: Option<u64>,
}

impl RolloutState {
    /// Fresh `Pending` state for a newly submitted plan.
    pub fn new(plan_id: &str, now: u64) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            stage: Stage::Pending,
            step_index: None,
            verified_step: None,
            target_live: false,
            paused: false,
            source_snapshot: None,
            resource_versions: BTreeMap::new(),
            failed_stage: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Index of the next schedule step to apply.
    pub fn next_step(&self) -> usize {
        self.step_index.map_or(0, |i| i + 1)
    }
}

// ── Audit ─────────────────────────────────────────────────────────

/// Category of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Stage change (or step confirmation within `Shifting`).
    Transition,
    /// One attempt at a cluster operation.
    Attempt,
    /// Verification gate verdict.
    Gate,
    /// Operator control signal (pause, resume, abort).
    Control,
}

/// One entry of a plan's append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub plan_id: PlanId,
    /// Assigned by the store on append; 1-based per plan.
    #[serde(default)]
    pub seq: u64,
    /// Unix timestamp (milliseconds).
    pub timestamp: u64,
    pub kind: AuditKind,
    pub from: Stage,
    pub to: Stage,
    pub step_index: Option<usize>,
    pub detail: String,
}

impl AuditRecord {
    pub fn new(
        state: &RolloutState,
        kind: AuditKind,
        from: Stage,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: state.plan_id.clone(),
            seq: 0,
            timestamp: state.updated_at,
            kind,
            from,
            to: state.stage,
            step_index: state.step_index,
            detail: detail.into(),
        }
    }
}

pub(crate) fn audit_key(plan_id: &str, seq: u64) -> String {
    format!("{plan_id}:{seq:020}")
}

// ── Locks ─────────────────────────────────────────────────────────

/// Exclusive execution right on a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub plan_id: PlanId,
    pub owner: String,
    /// Unix timestamp (milliseconds).
    pub acquired_at: u64,
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
