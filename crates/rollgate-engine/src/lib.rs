//! rollgate-engine — executes rollout plans.
//!
//! - **`machine`** — pure stage transition function (`next_stage`)
//! - **`engine`** — `RolloutEngine`: preparation, ratio steps, gates,
//!   finalization and rollback against a `ClusterClient`
//! - **`controller`** — `RolloutController`: submit, status, pause, resume,
//!   abort, approvals and crash recovery over many engines
//! - **`error`** — `EngineError`
//!
//! # Lifecycle
//!
//! ```text
//! Pending → Preparing → Shifting → Verifying → Finalizing → Completed
//! any non-terminal stage ── abort / gate failure ──→ Aborting → RolledBack
//! Preparing ‥ Finalizing, Aborting ── error ──→ Failed ── resume ──→ interrupted stage
//! ```

pub mod controller;
pub mod engine;
pub mod error;
pub mod machine;

#[cfg(test)]
mod testing;

pub use controller::RolloutController;
pub use engine::{Control, PlanGate, RolloutEngine, TARGET_READINESS_GATE};
pub use error::{EngineError, EngineResult};
pub use machine::{Event, next_stage};
