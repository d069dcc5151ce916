//! Whole-table locks.
//!
//! A table lock is an owner set plus a mode record. Exclusive requires no
//! lock of either mode; shared joins existing shared holders. The mode
//! record and the set are deleted together when the last owner leaves.

use latchkey_core::{KeySpace, LatchkeyResult, LockConfig, LockMode, OwnerToken};
use latchkey_storage::{AtomicScript, SharedRemote};
use std::time::Duration;

/// Whole-table lock in shared or exclusive mode.
#[derive(Clone)]
pub struct TableLock {
    remote: SharedRemote,
    keys: KeySpace,
    token: OwnerToken,
    lease: Duration,
}

impl std::fmt::Debug for TableLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableLock")
            .field("namespace", &self.keys.namespace())
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl TableLock {
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

    /// Single attempt. Returns false when the mode conflicts with the
    /// current holders.
    pub async fn lock_table(&self, table: &str, mode: LockMode) -> LatchkeyResult<bool> {
        let script = AtomicScript::LockTable {
            mode_key: self.keys.table_mode(table),
            owners_key: self.keys.table_owners(table),
            token: self.token.clone(),
            mode,
            ttl: self.lease,
        };
        let granted = self.remote.run_script(&script).await?.into_flag(script.name())?;
        tracing::debug!(table, %mode, granted, "Table lock attempt");
        Ok(granted)
    }

    /// Leave the owner set. The lock disappears with its last owner.
    pub async fn unlock_table(&self, table: &str) -> LatchkeyResult<bool> {
        let script = AtomicScript::UnlockTable {
            mode_key: self.keys.table_mode(table),
            owners_key: self.keys.table_owners(table),
            token: self.token.clone(),
        };
        Ok(self.remote.run_script(&script).await?.into_flag(script.name())?)
    }

    /// Current mode, `None` when unlocked.
    pub async fn table_mode(&self, table: &str) -> LatchkeyResult<Option<LockMode>> {
        let Some(raw) = self.remote.get(&self.keys.table_mode(table)).await? else {
            return Ok(None);
        };
        let mode = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| LockMode::from_wire_str(s).ok());
        if mode.is_none() {
            tracing::warn!(table, "Unrecognised table lock mode record");
        }
        Ok(mode)
    }

    pub async fn owners(&self, table: &str) -> LatchkeyResult<Vec<String>> {
        let mut owners = self.remote.smembers(&self.keys.table_owners(table)).await?;
        owners.sort();
        Ok(owners)
    }

    /// Drop the table lock regardless of owners.
    pub async fn force_unlock(&self, table: &str) -> LatchkeyResult<bool> {
        let removed = self
            .remote
            .delete(&[self.keys.table_mode(table), self.keys.table_owners(table)])
            .await?;
        tracing::warn!(table, "Table lock forcibly cleared");
        Ok(removed > 0)
    }
}
