//! Cluster client contract.
//!
//! The rollout engine never owns cluster resources; it mutates them
//! through this trait. Implementations must be safe for concurrent use
//! by several engines at once.

use async_trait::async_trait;

use rollgate_core::{ClusterResult, RoutingEndpointSpec, WorkloadGroupSpec, WorkloadGroupStatus};

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create or update a workload group. Returns the new resource version.
    ///
    /// A spec carrying `resource_version: Some(v)` is rejected with
    /// `ClusterError::Conflict` when the stored version differs.
    async fn apply_workload_group(&self, spec: &WorkloadGroupSpec) -> ClusterResult<u64>;

    /// Current desired spec of a workload group, with its resource version.
    async fn get_workload_group(&self, name: &str) -> ClusterResult<Option<WorkloadGroupSpec>>;

    /// Observed status. Unknown groups report `exists: false`.
    async fn workload_group_status(&self, name: &str) -> ClusterResult<WorkloadGroupStatus>;

    /// Delete a workload group. Deleting an absent group succeeds.
    async fn delete_workload_group(&self, name: &str) -> ClusterResult<()>;

    /// Create or update a routing endpoint.
    async fn apply_routing_endpoint(&self, spec: &RoutingEndpointSpec) -> ClusterResult<()>;
}
