//! Catalogue of atomic check-then-act transactions.
//!
//! Every coordination protocol in the lock crate is expressed through these
//! scripts plus the plain set/list commands. A backend must execute each
//! script without interleaving any other client's commands; the Redis
//! backend runs them as Lua, the in-memory backend under its store mutex.
//!
//! Keys are passed fully namespaced. TTLs are applied as millisecond
//! expiries.

use latchkey_core::{LockMode, OwnerToken, RemoteError};
use std::time::Duration;

/// Heartbeat key of a fair-lock waiter.
pub fn waiter_key(queue_key: &str, token: &str) -> String {
    format!("{queue_key}:waiter:{token}")
}

/// A row key and the row identifier it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub key: String,
    pub row_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicScript {
    /// Delete `key` only if it holds `token`. Replies 1 when deleted.
    CompareAndDelete { key: String, token: OwnerToken },

    /// Reset the expiry of `key` only if it holds `token`. Replies 1 when extended.
    CompareAndExpire {
        key: String,
        token: OwnerToken,
        ttl: Duration,
    },

    /// Poll the fair lock for `token`. A token missing from the queue is
    /// appended, and every poll re-arms both the queue expiry and the
    /// waiter's heartbeat key (see [`waiter_key`]). Heads whose heartbeat has
    /// expired are popped. The lock is granted if the token heads the queue
    /// and the lock record can be written; the token is popped from the
    /// queue in the same step. Replies 1 when granted.
    FairAcquire {
        lock_key: String,
        queue_key: String,
        token: OwnerToken,
        ttl: Duration,
    },

    /// Remove every occurrence of `token` from the queue along with its
    /// heartbeat. Replies the count.
    QueueRemove { queue_key: String, token: OwnerToken },

    /// Write the exclusive record if it is absent and the shared owner set is
    /// empty. Replies 1 when acquired.
    ExclusiveAcquire {
        exclusive_key: String,
        shared_key: String,
        token: OwnerToken,
        ttl: Duration,
    },

    /// Join the shared owner set if no exclusive record exists.
    SharedAcquire {
        exclusive_key: String,
        shared_key: String,
        token: OwnerToken,
        ttl: Duration,
    },

    /// Replace the exclusive record held by `token` with a shared entry for
    /// the same token in one step. Replies 1 when downgraded.
    Downgrade {
        exclusive_key: String,
        shared_key: String,
        token: OwnerToken,
        ttl: Duration,
    },

    /// Leave the shared owner set, deleting it once empty. Replies 1 if the
    /// token was a member.
    SharedRelease { shared_key: String, token: OwnerToken },

    /// Lock every row or none of them. Replies 1 when all rows were locked.
    LockRows {
        index_key: String,
        rows: Vec<RowKey>,
        token: OwnerToken,
        ttl: Duration,
    },

    /// Release the listed rows held by `token`. Replies the number released.
    UnlockRows {
        index_key: String,
        rows: Vec<RowKey>,
        token: OwnerToken,
    },

    /// Delete every indexed row lock of a table regardless of owner.
    /// `row_key_prefix` followed by a row id yields that row's key.
    ForceUnlockRows {
        index_key: String,
        row_key_prefix: String,
    },

    /// Take a table lock in the given mode. Replies 1 when granted.
    LockTable {
        mode_key: String,
        owners_key: String,
        token: OwnerToken,
        mode: LockMode,
        ttl: Duration,
    },

    /// Leave the table's owner set, deleting both keys once empty.
    UnlockTable {
        mode_key: String,
        owners_key: String,
        token: OwnerToken,
    },

    /// Re-arm the expiry of `set_key` and every key in `keys` while `token` is
    /// a member of `set_key`. Replies 1 when renewed.
    RenewMembership {
        set_key: String,
        keys: Vec<String>,
        token: OwnerToken,
        ttl: Duration,
    },

    /// Take one permit if any remain. An absent counter counts as `count`.
    SemaphoreAcquire {
        counter_key: String,
        owners_key: String,
        token: OwnerToken,
        count: u32,
        ttl: Duration,
    },

    /// Return a permit if `token` holds one, never raising the counter above
    /// `count`. Replies 1 if the token was a holder.
    SemaphoreRelease {
        counter_key: String,
        owners_key: String,
        token: OwnerToken,
        count: u32,
    },

    /// Read a value and its version in one step. Replies `Versioned`.
    VersionedGet { key: String, version_key: String },

    /// Store `value` if the version still equals `expected`, bumping it by
    /// one. `ttl` applies to the value only; the version never expires.
    /// Replies the new version, or -1 on a version mismatch.
    CompareAndSetVersion {
        key: String,
        version_key: String,
        value: Vec<u8>,
        expected: i64,
        ttl: Option<Duration>,
    },

    /// Delete the value and bump its version. Replies the number of values
    /// deleted.
    DeleteVersioned { key: String, version_key: String },
}

impl AtomicScript {
    /// Stable script name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            AtomicScript::CompareAndDelete { .. } => "compare_and_delete",
            AtomicScript::CompareAndExpire { .. } => "compare_and_expire",
            AtomicScript::FairAcquire { .. } => "fair_acquire",
            AtomicScript::QueueRemove { .. } => "queue_remove",
            AtomicScript::ExclusiveAcquire { .. } => "exclusive_acquire",
            AtomicScript::SharedAcquire { .. } => "shared_acquire",
            AtomicScript::Downgrade { .. } => "downgrade",
            AtomicScript::SharedRelease { .. } => "shared_release",
            AtomicScript::LockRows { .. } => "lock_rows",
            AtomicScript::UnlockRows { .. } => "unlock_rows",
            AtomicScript::ForceUnlockRows { .. } => "force_unlock_rows",
            AtomicScript::LockTable { .. } => "lock_table",
            AtomicScript::UnlockTable { .. } => "unlock_table",
            AtomicScript::RenewMembership { .. } => "renew_membership",
            AtomicScript::SemaphoreAcquire { .. } => "semaphore_acquire",
            AtomicScript::SemaphoreRelease { .. } => "semaphore_release",
            AtomicScript::VersionedGet { .. } => "versioned_get",
            AtomicScript::CompareAndSetVersion { .. } => "compare_and_set_version",
            AtomicScript::DeleteVersioned { .. } => "delete_versioned",
        }
    }
}

/// Result of running an atomic script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Int(i64),
    Versioned { value: Option<Vec<u8>>, version: i64 },
}

impl ScriptReply {
    pub fn into_int(self, script: &'static str) -> Result<i64, RemoteError> {
        match self {
            ScriptReply::Int(n) => Ok(n),
            other => Err(RemoteError::InvalidReply {
                reason: format!("{script} expected an integer, got {other:?}"),
            }),
        }
    }

    /// Integer reply interpreted as success when it equals 1.
    pub fn into_flag(self, script: &'static str) -> Result<bool, RemoteError> {
        self.into_int(script).map(|n| n == 1)
    }

    pub fn into_versioned(self, script: &'static str) -> Result<(Option<Vec<u8>>, i64), RemoteError> {
        match self {
            ScriptReply::Versioned { value, version } => Ok((value, version)),
            other => Err(RemoteError::InvalidReply {
                reason: format!("{script} expected a versioned value, got {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_conversions() {
        assert_eq!(ScriptReply::Int(1).into_flag("x"), Ok(true));
        assert_eq!(ScriptReply::Int(0).into_flag("x"), Ok(false));
        assert!(ScriptReply::Int(3).into_versioned("x").is_err());
        let versioned = ScriptReply::Versioned {
            value: None,
            version: 2,
        };
        assert!(versioned.clone().into_int("x").is_err());
        assert_eq!(versioned.into_versioned("x"), Ok((None, 2)));
    }

    #[test]
    fn test_names_are_distinct() {
        let token = OwnerToken::generate();
        let a = AtomicScript::CompareAndDelete {
            key: "k".into(),
            token: token.clone(),
        };
        let b = AtomicScript::QueueRemove {
            queue_key: "q".into(),
            token,
        };
        assert_ne!(a.name(), b.name());
    }
}
