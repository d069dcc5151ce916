//! Row-level locks.
//!
//! Rows are locked in batches: one script checks every requested row and
//! either locks all of them under the caller's token or none. A per-table
//! index set tracks which rows are locked so an operator can list or clear
//! them.

use latchkey_core::{KeySpace, LatchkeyResult, LockConfig, OwnerToken};
use latchkey_storage::{AtomicScript, RowKey, SharedRemote};
use std::collections::BTreeSet;
use std::time::Duration;

/// Batch row locker. One instance owns one token; every batch it locks is
/// released with that token.
#[derive(Clone)]
pub struct RowLock {
    remote: SharedRemote,
    keys: KeySpace,
    token: OwnerToken,
    lease: Duration,
}

impl std::fmt::Debug for RowLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowLock")
            .field("namespace", &self.keys.namespace())
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl RowLock {
    pub fn new(remote: SharedRemote, keys: KeySpace, config: &LockConfig) -> Self {
        Self {
            remote,
            keys,
            token: OwnerToken::generate(),
            lease: config.lease_time,
        }
    }

    pub fn token(&self) -> &OwnerToken {
        &self.token
    }

    fn row_keys<S: AsRef<str>>(&self, table: &str, row_ids: &[S]) -> Vec<RowKey> {
        let unique: BTreeSet<&str> = row_ids.iter().map(AsRef::as_ref).collect();
        unique
            .into_iter()
            .map(|row_id| RowKey {
                key: self.keys.row(table, row_id),
                row_id: row_id.to_string(),
            })
            .collect()
    }

    /// Lock every listed row or none. Returns false if any row was already
    /// locked, by anyone.
    pub async fn lock_rows<S: AsRef<str>>(&self, table: &str, row_ids: &[S]) -> LatchkeyResult<bool> {
        let rows = self.row_keys(table, row_ids);
        if rows.is_empty() {
            return Ok(true);
        }
        let count = rows.len();
        let script = AtomicScript::LockRows {
            index_key: self.keys.row_index(table),
            rows,
            token: self.token.clone(),
            ttl: self.lease,
        };
        let locked = self.remote.run_script(&script).await?.into_flag(script.name())?;
        tracing::debug!(table, rows = count, locked, "Row lock batch");
        Ok(locked)
    }

    /// Release the listed rows this locker holds. Rows held by others are
    /// left alone. Returns how many were released.
    pub async fn unlock_rows<S: AsRef<str>>(&self, table: &str, row_ids: &[S]) -> LatchkeyResult<u64> {
        let rows = self.row_keys(table, row_ids);
        if rows.is_empty() {
            return Ok(0);
        }
        let script = AtomicScript::UnlockRows {
            index_key: self.keys.row_index(table),
            rows,
            token: self.token.clone(),
        };
        let released = self.remote.run_script(&script).await?.into_int(script.name())?;
        Ok(released.max(0) as u64)
    }

    pub async fn is_row_locked(&self, table: &str, row_id: &str) -> LatchkeyResult<bool> {
        self.remote.exists(&self.keys.row(table, row_id)).await
    }

    /// Row ids currently recorded as locked in `table`, sorted.
    pub async fn locked_rows(&self, table: &str) -> LatchkeyResult<Vec<String>> {
        let mut rows = self.remote.smembers(&self.keys.row_index(table)).await?;
        rows.sort();
        Ok(rows)
    }

    /// Drop every row lock in `table` regardless of owner.
    pub async fn force_unlock_all(&self, table: &str) -> LatchkeyResult<u64> {
        let script = AtomicScript::ForceUnlockRows {
            index_key: self.keys.row_index(table),
            row_key_prefix: self.keys.row(table, ""),
        };
        let released = self.remote.run_script(&script).await?.into_int(script.name())?;
        tracing::warn!(table, released, "Row locks forcibly cleared");
        Ok(released.max(0) as u64)
    }
}
