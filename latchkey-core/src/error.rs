//! Error types for latchkey operations

use std::time::Duration;
use thiserror::Error;

/// Local cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Entry {key} is {size} bytes, over the per-item limit of {limit} bytes")]
    OversizedEntry {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Remote store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Operation against a key holding the wrong kind of value: {key}")]
    WrongType { key: String },

    #[error("Atomic script {script} failed: {reason}")]
    ScriptFailed { script: String, reason: String },

    #[error("Unexpected reply from remote store: {reason}")]
    InvalidReply { reason: String },
}

/// Lock and coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock acquisition timed out for {resource} after {waited:?}")]
    AcquisitionTimeout { resource: String, waited: Duration },

    #[error("Lock on {resource} is not held by this owner")]
    NotOwned { resource: String },

    #[error("Version conflict on {key}: expected version {expected}")]
    VersionConflict { key: String, expected: i64 },

    #[error("Invalid lock state for {resource}: {reason}")]
    InvalidState { resource: String, reason: String },

    #[error("Cache warm-up already in progress")]
    WarmupInProgress,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Monitoring and alert delivery errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Alert sink {sink} failed: {reason}")]
    SinkFailed { sink: String, reason: String },

    #[error("Metric source {source_name} failed: {reason}")]
    SourceFailed { source_name: String, reason: String },
}

/// Master error type for all latchkey errors.
#[derive(Debug, Clone, Error)]
pub enum LatchkeyError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

impl LatchkeyError {
    /// True when the remote store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LatchkeyError::Remote(RemoteError::Unavailable { .. }))
    }

    /// True for an optimistic version mismatch.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, LatchkeyError::Lock(LockError::VersionConflict { .. }))
    }

    /// True for an acquisition that ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LatchkeyError::Lock(LockError::AcquisitionTimeout { .. }))
    }
}

impl From<serde_json::Error> for LatchkeyError {
    fn from(err: serde_json::Error) -> Self {
        LatchkeyError::Cache(CacheError::Serialization {
            reason: err.to_string(),
        })
    }
}

/// Result type alias for latchkey operations.
pub type LatchkeyResult<T> = Result<T, LatchkeyError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_display_oversized() {
        let err = CacheError::OversizedEntry {
            key: "report:42".to_string(),
            size: 2048,
            limit: 1024,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("report:42"));
        assert!(msg.contains("2048"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_lock_error_display_timeout() {
        let err = LockError::AcquisitionTimeout {
            resource: "grades".to_string(),
            waited: Duration::from_millis(250),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("grades"));
    }

    #[test]
    fn test_lock_error_display_version_conflict() {
        let err = LockError::VersionConflict {
            key: "student:7".to_string(),
            expected: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("student:7"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "lock.lease_time".to_string(),
            value: "0ms".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("lock.lease_time"));
        assert!(msg.contains("0ms"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_latchkey_error_from_variants() {
        let cache = LatchkeyError::from(CacheError::LockPoisoned);
        assert!(matches!(cache, LatchkeyError::Cache(_)));

        let remote = LatchkeyError::from(RemoteError::Unavailable {
            reason: "connection refused".to_string(),
        });
        assert!(remote.is_unavailable());

        let lock = LatchkeyError::from(LockError::VersionConflict {
            key: "k".to_string(),
            expected: 1,
        });
        assert!(lock.is_version_conflict());
        assert!(!lock.is_timeout());

        let config = LatchkeyError::from(ConfigError::MissingRequired {
            field: "namespace".to_string(),
        });
        assert!(matches!(config, LatchkeyError::Config(_)));

        let monitor = LatchkeyError::from(MonitorError::SinkFailed {
            sink: "webhook".to_string(),
            reason: "503".to_string(),
        });
        assert!(matches!(monitor, LatchkeyError::Monitor(_)));
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let parse = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err = LatchkeyError::from(parse);
        assert!(matches!(
            err,
            LatchkeyError::Cache(CacheError::Serialization { .. })
        ));
    }
}
