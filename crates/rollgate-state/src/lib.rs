//! rollgate-state — audit/status store for rollgate.
//!
//! Backed by [redb](https://docs.rs/redb), persists submitted plans, the
//! current `RolloutState` snapshot of every plan, an append-only audit
//! log, and plan-scoped execution locks.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! A stage transition writes the new snapshot and its audit record in one
//! write transaction, so a crash never leaves the two out of step.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
