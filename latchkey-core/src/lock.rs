//! Lock modes, lock records and the remote key layout.
//!
//! Every lock flavor stores its state under a predictable key in the remote
//! store. `KeySpace` is the only place those keys are built, so two processes
//! configured with the same namespace always agree on where a lock lives.
//!
//! ```text
//! {ns}:lock:{name}                  mutual-exclusion record
//! {ns}:fair_lock:{name}             fair lock record
//! {ns}:fair_lock:{name}:queue       FIFO waiter queue
//! {ns}:rwlock:{name}                downgradable lock, exclusive record
//! {ns}:rwlock:{name}:shared         downgradable lock, shared owner set
//! {ns}:pessimistic_lock:{name}      pessimistic record
//! {ns}:{key}:version                optimistic version counter
//! {ns}:row_lock:{table}:{row}       one locked row
//! {ns}:row_lock:{table}:rows        index of locked rows
//! {ns}:table_lock:{table}:mode      table lock mode
//! {ns}:table_lock:{table}:owners    table lock owner set
//! {ns}:semaphore:{name}             permit counter
//! {ns}:semaphore:{name}:owners      permit holders
//! ```

use crate::{OwnerToken, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// LOCK MODE ENUM
// ============================================================================

/// Lock mode determining concurrency behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Only one holder can acquire the lock
    Exclusive,
    /// Multiple holders can acquire the lock
    Shared,
}

impl LockMode {
    /// Representation stored in the remote store.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            LockMode::Exclusive => "exclusive",
            LockMode::Shared => "shared",
        }
    }

    /// Parse the representation stored in the remote store.
    pub fn from_wire_str(s: &str) -> Result<Self, LockModeParseError> {
        match s.to_lowercase().as_str() {
            "exclusive" => Ok(LockMode::Exclusive),
            "shared" => Ok(LockMode::Shared),
            _ => Err(LockModeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

impl FromStr for LockMode {
    type Err = LockModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire_str(s)
    }
}

/// Error when parsing an invalid lock mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockModeParseError(pub String);

impl fmt::Display for LockModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid lock mode: {}", self.0)
    }
}

impl std::error::Error for LockModeParseError {}

// ============================================================================
// LOCK RECORD
// ============================================================================

/// Client-side view of a held lock.
///
/// The remote store only keeps the owner token under the lock key; the rest
/// is bookkeeping kept by the holder for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub owner: OwnerToken,
    pub mode: LockMode,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LockRecord {
    /// Build a record for a lock acquired at `now` with the given lease.
    pub fn new(
        resource: impl Into<String>,
        owner: OwnerToken,
        mode: LockMode,
        now: Timestamp,
        lease: Duration,
    ) -> Self {
        Self {
            resource: resource.into(),
            owner,
            mode,
            acquired_at: now,
            expires_at: now + to_chrono(lease),
        }
    }

    /// Check if the lock has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Time since acquisition.
    pub fn held_for(&self, now: Timestamp) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Push the expiry out to `now + lease`.
    pub fn renew(&mut self, now: Timestamp, lease: Duration) {
        self.expires_at = now + to_chrono(lease);
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::milliseconds(duration.as_millis() as i64))
}

// ============================================================================
// KEY LAYOUT
// ============================================================================

/// Namespaced key builder for every structure kept in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix an arbitrary cache key.
    pub fn key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.namespace, key)
        }
    }

    /// Strip the namespace prefix again, if present.
    pub fn strip<'a>(&self, full: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            return full;
        }
        full.strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(full)
    }

    pub fn mutex(&self, name: &str) -> String {
        self.key(&format!("lock:{name}"))
    }

    pub fn fair(&self, name: &str) -> String {
        self.key(&format!("fair_lock:{name}"))
    }

    pub fn fair_queue(&self, name: &str) -> String {
        self.key(&format!("fair_lock:{name}:queue"))
    }

    pub fn rw_exclusive(&self, name: &str) -> String {
        self.key(&format!("rwlock:{name}"))
    }

    pub fn rw_shared(&self, name: &str) -> String {
        self.key(&format!("rwlock:{name}:shared"))
    }

    pub fn pessimistic(&self, name: &str) -> String {
        self.key(&format!("pessimistic_lock:{name}"))
    }

    pub fn version(&self, key: &str) -> String {
        self.key(&format!("{key}:version"))
    }

    pub fn row(&self, table: &str, row: &str) -> String {
        self.key(&format!("row_lock:{table}:{row}"))
    }

    pub fn row_index(&self, table: &str) -> String {
        self.key(&format!("row_lock:{table}:rows"))
    }

    pub fn table_mode(&self, table: &str) -> String {
        self.key(&format!("table_lock:{table}:mode"))
    }

    pub fn table_owners(&self, table: &str) -> String {
        self.key(&format!("table_lock:{table}:owners"))
    }

    pub fn semaphore(&self, name: &str) -> String {
        self.key(&format!("semaphore:{name}"))
    }

    pub fn semaphore_owners(&self, name: &str) -> String {
        self.key(&format!("semaphore:{name}:owners"))
    }
}
