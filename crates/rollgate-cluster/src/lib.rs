//! rollgate-cluster — the boundary to the orchestration platform.
//!
//! - **`client`** — `ClusterClient`, the async contract the engine drives
//! - **`memory`** — `InMemoryCluster`, a simulated control plane with
//!   convergence lag, fault injection and a call log

pub mod client;
pub mod memory;

pub use client::ClusterClient;
pub use memory::{CallRecord, InMemoryCluster, Operation};
