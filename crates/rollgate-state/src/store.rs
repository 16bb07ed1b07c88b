//! StateStore — redb-backed audit/status persistence for rollgate.
//!
//! Provides typed operations over plans, snapshots, the audit log and
//! plan locks. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use rollgate_core::RolloutPlan;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PLANS).map_err(map_err!(Table))?;
        txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.open_table(AUDIT_SEQ).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Plans ──────────────────────────────────────────────────────

    /// Store a submitted plan together with its initial snapshot and the
    /// submission audit record, in one transaction.
    pub fn register_plan(
        &self,
        plan: &RolloutPlan,
        state: &RolloutState,
        record: AuditRecord,
    ) -> StateResult<u64> {
        let plan_bytes = encode(plan)?;
        let state_bytes = encode(state)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut plans = txn.open_table(PLANS).map_err(map_err!(Table))?;
            plans
                .insert(plan.id.as_str(), plan_bytes.as_slice())
                .map_err(map_err!(Write))?;
            let mut snapshots = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            snapshots
                .insert(state.plan_id.as_str(), state_bytes.as_slice())
                .map_err(map_err!(Write))?;
            seq = append_in(&txn, record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan = %plan.id, "plan registered");
        Ok(seq)
    }

    /// Get a plan by ID.
    pub fn get_plan(&self, plan_id: &str) -> StateResult<Option<RolloutPlan>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLANS).map_err(map_err!(Table))?;
        match table.get(plan_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Drop a plan body once its rollout is terminal. The snapshot and
    /// audit log are retained. Returns true if the plan existed.
    pub fn gc_plan(&self, plan_id: &str) -> StateResult<bool> {
        let snapshot = self
            .get_snapshot(plan_id)?
            .ok_or_else(|| StateError::NotFound(plan_id.to_string()))?;
        if !snapshot.stage.is_terminal() {
            return Err(StateError::Write(format!(
                "plan {plan_id} is still {}",
                snapshot.stage
            )));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PLANS).map_err(map_err!(Table))?;
            existed = table.remove(plan_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan = %plan_id, existed, "plan garbage-collected");
        Ok(existed)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Insert or overwrite a snapshot without an audit record.
    pub fn put_snapshot(&self, state: &RolloutState) -> StateResult<()> {
        let value = encode(state)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(state.plan_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the current snapshot of a plan.
    pub fn get_snapshot(&self, plan_id: &str) -> StateResult<Option<RolloutState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(plan_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List every snapshot.
    pub fn list_snapshots(&self) -> StateResult<Vec<RolloutState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Persist a snapshot and its audit record atomically. Returns the
    /// record's sequence number.
    pub fn record_transition(&self, state: &RolloutState, record: AuditRecord) -> StateResult<u64> {
        let value = encode(state)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(state.plan_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            seq = append_in(&txn, record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan = %state.plan_id, stage = %state.stage, seq, "transition recorded");
        Ok(seq)
    }

    // ── Audit log ──────────────────────────────────────────────────

    /// Append a record to a plan's audit log. Returns its sequence number.
    pub fn append_audit(&self, record: AuditRecord) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq = append_in(&txn, record)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// Full audit history of a plan in append order.
    pub fn list_audit(&self, plan_id: &str) -> StateResult<Vec<AuditRecord>> {
        let prefix = format!("{plan_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: AuditRecord = decode(value.value())?;
                // Another plan ID may share the prefix (`a` vs `a:b`).
                if record.plan_id == plan_id {
                    results.push(record);
                }
            }
        }
        Ok(results)
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Take the execution lock on a plan. Fails with `Locked` if any owner
    /// (including `owner` itself) already holds it.
    pub fn try_lock(&self, plan_id: &str, owner: &str) -> StateResult<LockRecord> {
        let lock = LockRecord {
            plan_id: plan_id.to_string(),
            owner: owner.to_string(),
            acquired_at: now_millis(),
        };
        let value = encode(&lock)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held: Option<LockRecord> = match table.get(plan_id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(held) = held {
                return Err(StateError::Locked {
                    plan_id: plan_id.to_string(),
                    owner: held.owner,
                });
            }
            table
                .insert(plan_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan = %plan_id, %owner, "plan locked");
        Ok(lock)
    }

    /// Release a plan lock held by `owner`. Returns true if it was released.
    pub fn unlock(&self, plan_id: &str, owner: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held: Option<LockRecord> = match table.get(plan_id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            released = match held {
                Some(lock) if lock.owner == owner => {
                    table.remove(plan_id).map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan = %plan_id, %owner, released, "plan unlock");
        Ok(released)
    }

    /// Current holder of a plan lock.
    pub fn lock_holder(&self, plan_id: &str) -> StateResult<Option<LockRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(plan_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Drop every lock. Called at startup: redb holds the database file
    /// exclusively, so any lock found then belongs to a dead process.
    pub fn clear_locks(&self) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    Some(key.value().to_string())
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count, "stale locks cleared");
        Ok(count)
    }
}

/// Append `record` inside an open write transaction, assigning its sequence.
fn append_in(txn: &redb::WriteTransaction, mut record: AuditRecord) -> StateResult<u64> {
    let mut seqs = txn.open_table(AUDIT_SEQ).map_err(map_err!(Table))?;
    let last = seqs
        .get(record.plan_id.as_str())
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let seq = last + 1;
    seqs.insert(record.plan_id.as_str(), seq)
        .map_err(map_err!(Write))?;

    record.seq = seq;
    let key = audit_key(&record.plan_id, seq);
    let value = encode(&record)?;
    let mut audit = txn.open_table(AUDIT).map_err(map_err!(Table))?;
    audit
        .insert(key.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(seq)
}
