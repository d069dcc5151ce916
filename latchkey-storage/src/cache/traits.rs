//! Vocabulary shared by every cache tier.
//!
//! Both the local store and the remote store speak in terms of the types
//! defined here, which is what lets the two-tier façade move entries between
//! them without translation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Precondition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SetCondition {
    /// Unconditional write
    #[default]
    Always,
    /// Write only if the key does not exist (`NX`)
    IfAbsent,
    /// Write only if the key already exists (`XX`)
    IfPresent,
}

impl SetCondition {
    /// Whether the write may proceed given the key's current existence.
    pub fn permits(self, exists: bool) -> bool {
        match self {
            SetCondition::Always => true,
            SetCondition::IfAbsent => !exists,
            SetCondition::IfPresent => exists,
        }
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TtlStatus {
    /// The key does not exist
    Missing,
    /// The key exists and never expires
    NoExpiry,
    /// The key expires after the given duration
    Expires(Duration),
}

impl TtlStatus {
    pub fn exists(&self) -> bool {
        !matches!(self, TtlStatus::Missing)
    }

    /// Remaining duration, if the key exists and has one.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            TtlStatus::Expires(d) => Some(*d),
            _ => None,
        }
    }

    /// Legacy integer encoding: `-1` for missing, `None` for no expiry,
    /// whole seconds otherwise.
    pub fn as_legacy_secs(&self) -> Option<i64> {
        match self {
            TtlStatus::Missing => Some(-1),
            TtlStatus::NoExpiry => None,
            TtlStatus::Expires(d) => Some(d.as_secs() as i64),
        }
    }
}

/// Why an entry left the local store without an explicit delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvictionReason {
    /// Removed to make room under `max_items` or `max_bytes`
    Capacity,
    /// Removed because its TTL elapsed
    Expired,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of entries dropped because they expired.
    pub expirations: u64,
    /// Bytes currently held.
    pub current_size: u64,
    /// Entries currently held.
    pub current_items: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_permits() {
        assert!(SetCondition::Always.permits(true));
        assert!(SetCondition::Always.permits(false));
        assert!(SetCondition::IfAbsent.permits(false));
        assert!(!SetCondition::IfAbsent.permits(true));
        assert!(SetCondition::IfPresent.permits(true));
        assert!(!SetCondition::IfPresent.permits(false));
    }

    #[test]
    fn test_ttl_legacy_encoding() {
        assert_eq!(TtlStatus::Missing.as_legacy_secs(), Some(-1));
        assert_eq!(TtlStatus::NoExpiry.as_legacy_secs(), None);
        assert_eq!(
            TtlStatus::Expires(Duration::from_millis(2500)).as_legacy_secs(),
            Some(2)
        );
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
