//! In-memory control plane.
//!
//! Simulates the parts of an orchestration platform the rollout engine
//! depends on: workload groups that converge towards their desired
//! replica count after a configurable number of status polls, routing
//! endpoints resolved by label selector, optimistic concurrency through
//! resource versions, and graceful deletion. Faults can be injected per
//! operation and recent calls are logged, which makes it the test double
//! for the engine and the backend of `rollgated standalone`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use rollgate_core::{
    ClusterError, ClusterResult, Labels, RoutingEndpointSpec, WorkloadGroupSpec,
    WorkloadGroupStatus,
};

use crate::client::ClusterClient;

/// Calls kept in the log before the oldest are dropped. Status polls
/// dominate it, so a long-running daemon would otherwise grow without bound.
pub const CALL_LOG_LIMIT: usize = 10_000;

/// Cluster client operations, for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ApplyWorkloadGroup,
    GetWorkloadGroup,
    WorkloadGroupStatus,
    DeleteWorkloadGroup,
    ApplyRoutingEndpoint,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::ApplyWorkloadGroup => "apply_workload_group",
            Operation::GetWorkloadGroup => "get_workload_group",
            Operation::WorkloadGroupStatus => "workload_group_status",
            Operation::DeleteWorkloadGroup => "delete_workload_group",
            Operation::ApplyRoutingEndpoint => "apply_routing_endpoint",
        };
        f.write_str(s)
    }
}

/// One logged client call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub op: Operation,
    pub name: String,
    /// Desired replicas for `ApplyWorkloadGroup` calls.
    pub replicas: Option<u32>,
    /// Whether the call returned an error.
    pub failed: bool,
}

/// Pending injected failure.
struct Fault {
    op: Operation,
    /// Only calls on this resource fail; `None` matches any.
    name: Option<String>,
    error: ClusterError,
    remaining: u32,
}

/// Internal state for a single workload group.
struct GroupEntry {
    spec: WorkloadGroupSpec,
    version: u64,
    observed: u32,
    /// Status polls left before `observed` catches up with `spec.replicas`.
    lag_remaining: u32,
    terminating: bool,
}

struct Inner {
    groups: HashMap<String, GroupEntry>,
    endpoints: HashMap<String, RoutingEndpointSpec>,
    faults: Vec<Fault>,
    calls: VecDeque<CallRecord>,
    call_log_limit: usize,
    /// Groups whose observed replicas never move.
    frozen: HashSet<String>,
    /// Groups reporting zero ready replicas.
    unready: HashSet<String>,
    next_version: u64,
    convergence_lag: u32,
    graceful_delete: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            endpoints: HashMap::new(),
            faults: Vec::new(),
            calls: VecDeque::new(),
            call_log_limit: CALL_LOG_LIMIT,
            frozen: HashSet::new(),
            unready: HashSet::new(),
            next_version: 0,
            convergence_lag: 0,
            graceful_delete: false,
        }
    }
}

impl Inner {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Consume a matching injected fault, if any.
    fn take_fault(&mut self, op: Operation, name: &str) -> Option<ClusterError> {
        let idx = self.faults.iter().position(|f| {
            f.op == op && f.name.as_deref().is_none_or(|n| n == name) && f.remaining > 0
        })?;
        let fault = &mut self.faults[idx];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(idx);
        }
        Some(error)
    }

    fn log(&mut self, op: Operation, name: &str, replicas: Option<u32>, failed: bool) {
        if self.calls.len() >= self.call_log_limit {
            self.calls.pop_front();
        }
        self.calls.push_back(CallRecord {
            op,
            name: name.to_string(),
            replicas,
            failed,
        });
    }
}

/// Thread-safe simulated control plane.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of status polls a changed group takes to converge.
    pub fn set_convergence_lag(&self, polls: u32) {
        self.inner.write().expect("cluster lock").convergence_lag = polls;
    }

    /// When enabled, deletes leave the group `terminating` until the next
    /// status poll instead of removing it at once.
    pub fn set_graceful_delete(&self, enabled: bool) {
        self.inner.write().expect("cluster lock").graceful_delete = enabled;
    }

    /// Stop (or restart) convergence of a group's observed replicas.
    pub fn freeze(&self, name: &str, frozen: bool) {
        let mut inner = self.inner.write().expect("cluster lock");
        if frozen {
            inner.frozen.insert(name.to_string());
        } else {
            inner.frozen.remove(name);
        }
    }

    /// Make a group report zero ready replicas (or restore readiness).
    pub fn set_ready(&self, name: &str, ready: bool) {
        let mut inner = self.inner.write().expect("cluster lock");
        if ready {
            inner.unready.remove(name);
        } else {
            inner.unready.insert(name.to_string());
        }
    }

    /// Fail the next `times` calls of `op` (optionally only on `name`).
    pub fn inject_fault(&self, op: Operation, name: Option<&str>, error: ClusterError, times: u32) {
        let mut inner = self.inner.write().expect("cluster lock");
        debug!(%op, ?name, %error, times, "fault injected");
        inner.faults.push(Fault {
            op,
            name: name.map(str::to_string),
            error,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.inner.write().expect("cluster lock").faults.clear();
    }

    /// Seed a fully converged group, bypassing faults and the call log.
    pub fn insert_group(&self, spec: WorkloadGroupSpec) -> u64 {
        let mut inner = self.inner.write().expect("cluster lock");
        let version = inner.bump_version();
        let observed = spec.replicas;
        inner.groups.insert(
            spec.name.clone(),
            GroupEntry {
                spec: WorkloadGroupSpec {
                    resource_version: Some(version),
                    ..spec
                },
                version,
                observed,
                lag_remaining: 0,
                terminating: false,
            },
        );
        version
    }

    /// Simulate an out-of-band edit: bumps the resource version (and
    /// optionally the replica count) without going through the client.
    pub fn modify_externally(&self, name: &str, replicas: Option<u32>) -> Option<u64> {
        let mut inner = self.inner.write().expect("cluster lock");
        let version = inner.bump_version();
        let entry = inner.groups.get_mut(name)?;
        entry.version = version;
        entry.spec.resource_version = Some(version);
        if let Some(r) = replicas {
            entry.spec.replicas = r;
            entry.observed = r;
        }
        Some(version)
    }

    /// Current desired spec of a group (test inspection).
    pub fn group(&self, name: &str) -> Option<WorkloadGroupSpec> {
        let inner = self.inner.read().expect("cluster lock");
        inner.groups.get(name).map(|e| e.spec.clone())
    }

    /// Labels currently carried by a group.
    pub fn labels(&self, name: &str) -> Option<Labels> {
        self.group(name).map(|g| g.template.labels)
    }

    pub fn endpoint(&self, name: &str) -> Option<RoutingEndpointSpec> {
        let inner = self.inner.read().expect("cluster lock");
        inner.endpoints.get(name).cloned()
    }

    /// Groups currently receiving traffic from an endpoint: selector match
    /// and at least one observed replica.
    pub fn traffic_recipients(&self, endpoint: &str) -> Vec<String> {
        let inner = self.inner.read().expect("cluster lock");
        let Some(ep) = inner.endpoints.get(endpoint) else {
            return Vec::new();
        };
        let mut names: Vec<String> = inner
            .groups
            .values()
            .filter(|e| !e.terminating && e.observed > 0)
            .filter(|e| ep.selector.matches(&e.spec.template.labels))
            .map(|e| e.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// The most recent calls, oldest first, up to [`CALL_LOG_LIMIT`].
    pub fn calls(&self) -> Vec<CallRecord> {
        let inner = self.inner.read().expect("cluster lock");
        inner.calls.iter().cloned().collect()
    }

    /// Number of calls of `op` on `name`.
    pub fn call_count(&self, op: Operation, name: &str) -> usize {
        let inner = self.inner.read().expect("cluster lock");
        inner
            .calls
            .iter()
            .filter(|c| c.op == op && c.name == name)
            .count()
    }

    /// Replica counts of successful applies on `name`, in order.
    pub fn applied_replicas(&self, name: &str) -> Vec<u32> {
        let inner = self.inner.read().expect("cluster lock");
        inner
            .calls
            .iter()
            .filter(|c| c.op == Operation::ApplyWorkloadGroup && c.name == name && !c.failed)
            .filter_map(|c| c.replicas)
            .collect()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn apply_workload_group(&self, spec: &WorkloadGroupSpec) -> ClusterResult<u64> {
        let mut inner = self.inner.write().expect("cluster lock");
        let op = Operation::ApplyWorkloadGroup;
        if let Some(err) = inner.take_fault(op, &spec.name) {
            inner.log(op, &spec.name, Some(spec.replicas), true);
            return Err(err);
        }

        if let Some(expected) = spec.resource_version {
            let actual = inner.groups.get(&spec.name).map(|e| e.version).unwrap_or(0);
            if actual != expected {
                inner.log(op, &spec.name, Some(spec.replicas), true);
                return Err(ClusterError::Conflict {
                    name: spec.name.clone(),
                    expected,
                    actual,
                });
            }
        }

        let version = inner.bump_version();
        let lag = inner.convergence_lag;
        let stored = WorkloadGroupSpec {
            resource_version: Some(version),
            ..spec.clone()
        };
        match inner.groups.get_mut(&spec.name) {
            Some(entry) => {
                if entry.spec.replicas != spec.replicas {
                    entry.lag_remaining = lag;
                }
                entry.spec = stored;
                entry.version = version;
                entry.terminating = false;
            }
            None => {
                inner.groups.insert(
                    spec.name.clone(),
                    GroupEntry {
                        spec: stored,
                        version,
                        observed: 0,
                        lag_remaining: lag,
                        terminating: false,
                    },
                );
            }
        }
        inner.log(op, &spec.name, Some(spec.replicas), false);
        debug!(group = %spec.name, replicas = spec.replicas, version, "workload group applied");
        Ok(version)
    }

    async fn get_workload_group(&self, name: &str) -> ClusterResult<Option<WorkloadGroupSpec>> {
        let mut inner = self.inner.write().expect("cluster lock");
        let op = Operation::GetWorkloadGroup;
        if let Some(err) = inner.take_fault(op, name) {
            inner.log(op, name, None, true);
            return Err(err);
        }
        inner.log(op, name, None, false);
        Ok(inner
            .groups
            .get(name)
            .filter(|e| !e.terminating)
            .map(|e| e.spec.clone()))
    }

    async fn workload_group_status(&self, name: &str) -> ClusterResult<WorkloadGroupStatus> {
        let mut inner = self.inner.write().expect("cluster lock");
        let op = Operation::WorkloadGroupStatus;
        if let Some(err) = inner.take_fault(op, name) {
            inner.log(op, name, None, true);
            return Err(err);
        }
        inner.log(op, name, None, false);

        let frozen = inner.frozen.contains(name);
        let unready = inner.unready.contains(name);
        let Some(entry) = inner.groups.get_mut(name) else {
            return Ok(WorkloadGroupStatus::absent());
        };

        if entry.terminating {
            // Graceful deletion finishes on the poll after it was requested.
            let status = WorkloadGroupStatus {
                exists: true,
                observed_replicas: entry.observed,
                ready_replicas: 0,
                terminating: true,
                resource_version: entry.version,
                labels: entry.spec.template.labels.clone(),
            };
            inner.groups.remove(name);
            return Ok(status);
        }

        if !frozen {
            if entry.lag_remaining > 0 {
                entry.lag_remaining -= 1;
            } else {
                entry.observed = entry.spec.replicas;
            }
        }

        Ok(WorkloadGroupStatus {
            exists: true,
            observed_replicas: entry.observed,
            ready_replicas: if unready { 0 } else { entry.observed },
            terminating: false,
            resource_version: entry.version,
            labels: entry.spec.template.labels.clone(),
        })
    }

    async fn delete_workload_group(&self, name: &str) -> ClusterResult<()> {
        let mut inner = self.inner.write().expect("cluster lock");
        let op = Operation::DeleteWorkloadGroup;
        if let Some(err) = inner.take_fault(op, name) {
            inner.log(op, name, None, true);
            return Err(err);
        }
        inner.log(op, name, None, false);
        if inner.graceful_delete {
            if let Some(entry) = inner.groups.get_mut(name) {
                entry.terminating = true;
            }
        } else {
            inner.groups.remove(name);
        }
        debug!(group = %name, "workload group deleted");
        Ok(())
    }

    async fn apply_routing_endpoint(&self, spec: &RoutingEndpointSpec) -> ClusterResult<()> {
        let mut inner = self.inner.write().expect("cluster lock");
        let op = Operation::ApplyRoutingEndpoint;
        if let Some(err) = inner.take_fault(op, &spec.name) {
            inner.log(op, &spec.name, None, true);
            return Err(err);
        }
        inner.log(op, &spec.name, None, false);
        inner.endpoints.insert(spec.name.clone(), spec.clone());
        Ok(())
    }
}
