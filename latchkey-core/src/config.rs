//! Configuration types
//!
//! One `LatchkeyConfig` is built at process start (from defaults, a TOML
//! document or `LATCHKEY_*` environment variables) and passed by reference to
//! every component that needs it.

use crate::{ConfigError, LatchkeyResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Local (in-process) store bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// Maximum number of entries, unbounded when unset
    pub max_items: Option<usize>,
    /// Maximum total size of stored values in bytes, unbounded when unset
    pub max_bytes: Option<usize>,
    /// Interval of the background expiry sweep
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// TTL applied when a write does not specify one
    #[serde(with = "option_duration_ms")]
    pub default_ttl: Option<Duration>,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            max_items: Some(10_000),
            max_bytes: None,
            cleanup_interval: Duration::from_secs(60),
            default_ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Settings shared by the blocking lock flavors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long `acquire` waits; `None` waits indefinitely
    #[serde(with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    /// Sleep between acquisition attempts
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
    /// Lifetime of the remote lock record before it expires on its own
    #[serde(with = "duration_ms")]
    pub lease_time: Duration,
    /// Keep extending the lease while the lock is held
    pub auto_renew: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            retry_interval: Duration::from_millis(100),
            lease_time: Duration::from_secs(30),
            auto_renew: true,
        }
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay to wait before attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor as f64;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Semaphore settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    /// Number of permits
    pub count: u32,
    #[serde(with = "option_duration_ms")]
    pub timeout: Option<Duration>,
    /// Lifetime of the permit counter and holder set
    #[serde(with = "duration_ms")]
    pub lease_time: Duration,
    pub backoff: BackoffConfig,
    /// Keep a held permit alive past `lease_time`
    pub auto_renew: bool,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            count: 1,
            timeout: Some(Duration::from_secs(30)),
            lease_time: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            auto_renew: true,
        }
    }
}

/// Cache warmer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    pub batch_size: usize,
    /// Maximum writes in flight per batch
    pub concurrency: usize,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 5,
        }
    }
}

/// Monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_ms")]
    pub collection_interval: Duration,
    /// How long metric samples and alerts are kept
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    /// Cooldown applied to rules that do not set their own
    #[serde(with = "duration_ms")]
    pub default_cooldown: Duration,
    /// Hard cap on stored samples regardless of age
    pub max_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 3600),
            default_cooldown: Duration::from_secs(300),
            max_history: 10_000,
        }
    }
}

/// Wire format of values written through the typed cache helpers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

/// Typed value encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    pub format: SerializationFormat,
    /// Prefix encoded values with a marker byte and deflate large ones
    pub compress: bool,
    /// Encoded size in bytes from which compression is attempted
    pub compression_threshold: usize,
    /// zlib level, 0 to 9
    pub compression_level: u32,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            format: SerializationFormat::Json,
            compress: false,
            compression_threshold: 1024,
            compression_level: 6,
        }
    }
}

/// Remote store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatchkeyConfig {
    /// Prefix applied to every remote key
    pub namespace: String,
    /// TTL used by the two-tier cache when a write does not specify one
    #[serde(with = "option_duration_ms")]
    pub default_ttl: Option<Duration>,
    pub local: LocalStoreConfig,
    pub lock: LockConfig,
    pub semaphore: SemaphoreConfig,
    pub warmer: WarmerConfig,
    pub monitor: MonitorConfig,
    pub remote: RemoteConfig,
    pub serializer: SerializerConfig,
}

impl Default for LatchkeyConfig {
    fn default() -> Self {
        Self {
            namespace: "latchkey".to_string(),
            default_ttl: Some(Duration::from_secs(300)),
            local: LocalStoreConfig::default(),
            lock: LockConfig::default(),
            semaphore: SemaphoreConfig::default(),
            warmer: WarmerConfig::default(),
            monitor: MonitorConfig::default(),
            remote: RemoteConfig::default(),
            serializer: SerializerConfig::default(),
        }
    }
}

impl LatchkeyConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `LATCHKEY_NAMESPACE`: Remote key prefix (default: latchkey)
    /// - `LATCHKEY_DEFAULT_TTL_SECS`: Default cache TTL, 0 for none (default: 300)
    /// - `LATCHKEY_LOCAL_MAX_ITEMS`: Local store item bound (default: 10000)
    /// - `LATCHKEY_LOCAL_MAX_BYTES`: Local store byte bound (default: unbounded)
    /// - `LATCHKEY_LOCAL_CLEANUP_INTERVAL_SECS`: Expiry sweep interval (default: 60)
    /// - `LATCHKEY_LOCK_TIMEOUT_MS`: Acquire timeout, 0 to wait forever (default: 30000)
    /// - `LATCHKEY_LOCK_RETRY_INTERVAL_MS`: Retry sleep (default: 100)
    /// - `LATCHKEY_LOCK_LEASE_MS`: Lease time (default: 30000)
    /// - `LATCHKEY_SEMAPHORE_COUNT`: Permits (default: 1)
    /// - `LATCHKEY_WARMER_BATCH_SIZE`: Keys per batch (default: 100)
    /// - `LATCHKEY_WARMER_CONCURRENCY`: Writes in flight (default: 5)
    /// - `LATCHKEY_MONITOR_INTERVAL_SECS`: Collection interval (default: 60)
    /// - `LATCHKEY_REDIS_URL`: Remote store URL
    /// - `LATCHKEY_CACHE_COMPRESS`: Compress typed cache values (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_ttl = match env_parse::<u64>("LATCHKEY_DEFAULT_TTL_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.default_ttl,
        };

        let lock_timeout = match env_parse::<u64>("LATCHKEY_LOCK_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.lock.timeout,
        };

        Self {
            namespace: std::env::var("LATCHKEY_NAMESPACE").unwrap_or(defaults.namespace),
            default_ttl,
            local: LocalStoreConfig {
                max_items: env_parse("LATCHKEY_LOCAL_MAX_ITEMS").or(defaults.local.max_items),
                max_bytes: env_parse("LATCHKEY_LOCAL_MAX_BYTES").or(defaults.local.max_bytes),
                cleanup_interval: env_parse("LATCHKEY_LOCAL_CLEANUP_INTERVAL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.local.cleanup_interval),
                default_ttl,
            },
            lock: LockConfig {
                timeout: lock_timeout,
                retry_interval: env_parse("LATCHKEY_LOCK_RETRY_INTERVAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.lock.retry_interval),
                lease_time: env_parse("LATCHKEY_LOCK_LEASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.lock.lease_time),
                auto_renew: defaults.lock.auto_renew,
            },
            semaphore: SemaphoreConfig {
                count: env_parse("LATCHKEY_SEMAPHORE_COUNT").unwrap_or(defaults.semaphore.count),
                ..defaults.semaphore
            },
            warmer: WarmerConfig {
                batch_size: env_parse("LATCHKEY_WARMER_BATCH_SIZE")
                    .unwrap_or(defaults.warmer.batch_size),
                concurrency: env_parse("LATCHKEY_WARMER_CONCURRENCY")
                    .unwrap_or(defaults.warmer.concurrency),
            },
            monitor: MonitorConfig {
                collection_interval: env_parse("LATCHKEY_MONITOR_INTERVAL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.monitor.collection_interval),
                ..defaults.monitor
            },
            remote: RemoteConfig {
                url: std::env::var("LATCHKEY_REDIS_URL").unwrap_or(defaults.remote.url),
                ..defaults.remote
            },
            serializer: SerializerConfig {
                compress: env_parse("LATCHKEY_CACHE_COMPRESS").unwrap_or(defaults.serializer.compress),
                ..defaults.serializer
            },
        }
    }

    /// Parse a TOML document; missing fields fall back to defaults.
    pub fn from_toml_str(raw: &str) -> LatchkeyResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - namespace is not empty
    /// - local bounds, when set, are non-zero
    /// - every interval and lease is positive
    /// - lock retry interval is shorter than the lease
    /// - semaphore count, warmer batch size and concurrency are at least 1
    /// - backoff multiplier is at least 1.0
    /// - compression level is at most 9
    pub fn validate(&self) -> LatchkeyResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace", &self.namespace, "namespace must not be empty"));
        }

        if self.local.max_items == Some(0) {
            return Err(invalid("local.max_items", "0", "max_items must be greater than 0"));
        }

        if self.local.max_bytes == Some(0) {
            return Err(invalid("local.max_bytes", "0", "max_bytes must be greater than 0"));
        }

        for (field, value) in [
            ("local.cleanup_interval", self.local.cleanup_interval),
            ("lock.retry_interval", self.lock.retry_interval),
            ("lock.lease_time", self.lock.lease_time),
            ("semaphore.lease_time", self.semaphore.lease_time),
            ("monitor.collection_interval", self.monitor.collection_interval),
            ("monitor.retention", self.monitor.retention),
            ("remote.command_timeout", self.remote.command_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(
                    field,
                    &format!("{:?}", value),
                    &format!("{} must be positive", field),
                ));
            }
        }

        if self.lock.retry_interval >= self.lock.lease_time {
            return Err(invalid(
                "lock.retry_interval",
                &format!("{:?}", self.lock.retry_interval),
                "retry_interval must be shorter than lease_time",
            ));
        }

        if self.semaphore.count == 0 {
            return Err(invalid("semaphore.count", "0", "count must be at least 1"));
        }

        if self.semaphore.backoff.backoff_multiplier < 1.0 {
            return Err(invalid(
                "semaphore.backoff.backoff_multiplier",
                &self.semaphore.backoff.backoff_multiplier.to_string(),
                "backoff_multiplier must be at least 1.0",
            ));
        }

        if self.warmer.batch_size == 0 {
            return Err(invalid("warmer.batch_size", "0", "batch_size must be at least 1"));
        }

        if self.warmer.concurrency == 0 {
            return Err(invalid("warmer.concurrency", "0", "concurrency must be at least 1"));
        }

        if self.monitor.max_history == 0 {
            return Err(invalid("monitor.max_history", "0", "max_history must be at least 1"));
        }

        if self.serializer.compression_level > 9 {
            return Err(invalid(
                "serializer.compression_level",
                &self.serializer.compression_level.to_string(),
                "compression_level must be between 0 and 9",
            ));
        }

        Ok(())
    }

    /// Set the namespace prefix.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set lock timing.
    pub fn with_lock_timing(mut self, retry_interval: Duration, lease_time: Duration) -> Self {
        self.lock.retry_interval = retry_interval;
        self.lock.lease_time = lease_time;
        self
    }

    /// Set the acquisition timeout; `None` waits indefinitely.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock.timeout = timeout;
        self
    }

    /// Set the semaphore permit count.
    pub fn with_semaphore_count(mut self, count: u32) -> Self {
        self.semaphore.count = count;
        self
    }

    /// Set local store bounds.
    pub fn with_local_bounds(mut self, max_items: Option<usize>, max_bytes: Option<usize>) -> Self {
        self.local.max_items = max_items;
        self.local.max_bytes = max_bytes;
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::LatchkeyError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Optional durations as integer milliseconds.
mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LatchkeyError;
    use proptest::prelude::*;

    fn invalid_field(config: &LatchkeyConfig) -> Option<String> {
        match config.validate() {
            Err(LatchkeyError::Config(ConfigError::InvalidValue { field, .. })) => Some(field),
            _ => None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(LatchkeyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_namespace() {
        let config = LatchkeyConfig::default().with_namespace("  ");
        assert_eq!(invalid_field(&config).as_deref(), Some("namespace"));
    }

    #[test]
    fn test_rejects_retry_longer_than_lease() {
        let config = LatchkeyConfig::default()
            .with_lock_timing(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(invalid_field(&config).as_deref(), Some("lock.retry_interval"));
    }

    #[test]
    fn test_rejects_zero_semaphore() {
        let config = LatchkeyConfig::default().with_semaphore_count(0);
        assert_eq!(invalid_field(&config).as_deref(), Some("semaphore.count"));
    }

    #[test]
    fn test_rejects_zero_local_bound() {
        let config = LatchkeyConfig::default().with_local_bounds(Some(0), None);
        assert_eq!(invalid_field(&config).as_deref(), Some("local.max_items"));
    }

    #[test]
    fn test_from_toml_fills_defaults() {
        let raw = r#"
            namespace = "school"

            [lock]
            lease_time = 10000
            retry_interval = 50

            [semaphore]
            count = 4
        "#;
        let config = LatchkeyConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.namespace, "school");
        assert_eq!(config.lock.lease_time, Duration::from_secs(10));
        assert_eq!(config.lock.retry_interval, Duration::from_millis(50));
        assert_eq!(config.semaphore.count, 4);
        assert_eq!(config.warmer, WarmerConfig::default());
    }

    #[test]
    fn test_serializer_section() {
        let raw = r#"
            [serializer]
            format = "msgpack"
            compress = true
            compression_threshold = 256
        "#;
        let config = LatchkeyConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.serializer.format, SerializationFormat::MessagePack);
        assert!(config.serializer.compress);
        assert_eq!(config.serializer.compression_threshold, 256);
        assert_eq!(config.serializer.compression_level, 6);

        let mut config = LatchkeyConfig::default();
        config.serializer.compression_level = 10;
        assert_eq!(
            invalid_field(&config).as_deref(),
            Some("serializer.compression_level")
        );
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let raw = r#"
            [warmer]
            batch_size = 0
        "#;
        assert!(LatchkeyConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(0), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(40));
        assert_eq!(backoff.delay_for(20), Duration::from_millis(500));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_backoff_never_exceeds_cap(attempt in 0u32..200) {
            let backoff = BackoffConfig::default();
            prop_assert!(backoff.delay_for(attempt) <= backoff.max_backoff);
        }

        #[test]
        fn prop_positive_timings_validate(
            retry_ms in 1u64..1_000,
            extra_ms in 1u64..60_000,
            count in 1u32..64,
        ) {
            let config = LatchkeyConfig::default()
                .with_lock_timing(
                    Duration::from_millis(retry_ms),
                    Duration::from_millis(retry_ms + extra_ms),
                )
                .with_semaphore_count(count);
            prop_assert!(config.validate().is_ok());
        }
    }
}
