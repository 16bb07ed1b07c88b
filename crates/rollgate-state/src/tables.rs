//! redb table definitions for the rollgate state store.
//!
//! Value columns hold JSON-serialized domain types. Audit records use the
//! composite key `{plan_id}:{seq}` with a zero-padded sequence so a key scan
//! returns them in append order.

use redb::TableDefinition;

/// Submitted rollout plans keyed by plan ID.
pub const PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");

/// Current `RolloutState` snapshot keyed by plan ID.
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Append-only audit log keyed by `{plan_id}:{seq:020}`.
pub const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");

/// Last assigned audit sequence number per plan.
pub const AUDIT_SEQ: TableDefinition<&str, u64> = TableDefinition::new("audit_seq");

/// Execution locks keyed by plan ID.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
