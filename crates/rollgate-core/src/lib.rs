//! rollgate-core — shared types for the rollgate rollout controller.
//!
//! - **`types`** — workload groups, routing endpoints, label selectors
//! - **`plan`** — rollout plans, ratio schedules, gate specs, validation
//! - **`error`** — cluster and plan error taxonomy
//! - **`config`** — `rollgate.toml` daemon configuration

pub mod config;
pub mod error;
pub mod plan;
pub mod types;

pub use config::RollgateConfig;
pub use error::{ClusterError, ClusterResult, PlanError};
pub use plan::*;
pub use types::*;
