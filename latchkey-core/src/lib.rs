//! Latchkey Core - Shared Types
//!
//! Pure data structures shared by the storage, lock and monitor crates:
//! the error taxonomy, configuration, owner tokens, lock records and the
//! remote key layout. This crate performs no I/O.

pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod lock;

pub use config::{
    BackoffConfig, LatchkeyConfig, LocalStoreConfig, LockConfig, MonitorConfig, RemoteConfig,
    SemaphoreConfig, SerializationFormat, SerializerConfig, WarmerConfig,
};
pub use error::{
    CacheError, ConfigError, LatchkeyError, LatchkeyResult, LockError, MonitorError, RemoteError,
};
pub use health::{HealthCheck, HealthStatus};
pub use identity::{new_alert_id, AlertId, OwnerToken, Timestamp};
pub use lock::{KeySpace, LockMode, LockModeParseError, LockRecord};
