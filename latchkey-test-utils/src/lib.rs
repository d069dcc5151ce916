//! Latchkey Test Utilities
//!
//! Shared test infrastructure for the latchkey workspace:
//! - Proptest generators for keys, row ids, tokens and configs
//! - A fault-injecting remote store and a recording alert sink
//! - Test fixtures for common scenarios
//! - Assertions over the error taxonomy

// Re-export core types for convenience
pub use latchkey_core::{
    LatchkeyConfig, LatchkeyError, LatchkeyResult, LockConfig, LockError, LockMode,
    MonitorConfig, OwnerToken, RemoteError,
};
pub use latchkey_monitor::{Alert, AlertLevel, AlertSink};
pub use latchkey_storage::{
    AtomicScript, InMemoryRemoteStore, RemoteStore, ScriptReply, SetCondition, SharedRemote,
    TtlStatus,
};

pub use fixtures::{init_tracing, test_cache, test_config, test_remote};
pub use generators::{
    key_strategy, lock_mode_strategy, row_ids_strategy, token_strategy, ttl_strategy,
    value_strategy,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Remote store wrapper that can be switched into failing every call with
/// [`RemoteError::Unavailable`], as a dropped connection would.
pub struct FlakyRemoteStore {
    inner: SharedRemote,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl std::fmt::Debug for FlakyRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyRemoteStore")
            .field("failing", &self.is_failing())
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl FlakyRemoteStore {
    pub fn new(inner: SharedRemote) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Healthy wrapper around a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRemoteStore::new()))
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    /// Calls seen so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> LatchkeyResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing() {
            return Err(RemoteError::Unavailable {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FlakyRemoteStore {
    async fn get(&self, key: &str) -> LatchkeyResult<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> LatchkeyResult<bool> {
        self.check()?;
        self.inner.set(key, value, ttl, condition).await
    }

    async fn delete(&self, keys: &[String]) -> LatchkeyResult<u64> {
        self.check()?;
        self.inner.delete(keys).await
    }

    async fn exists(&self, key: &str) -> LatchkeyResult<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> LatchkeyResult<bool> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> LatchkeyResult<TtlStatus> {
        self.check()?;
        self.inner.ttl(key).await
    }

    async fn keys(&self, pattern: &str) -> LatchkeyResult<Vec<String>> {
        self.check()?;
        self.inner.keys(pattern).await
    }

    async fn sadd(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        self.check()?;
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        self.check()?;
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> LatchkeyResult<Vec<String>> {
        self.check()?;
        self.inner.smembers(key).await
    }

    async fn scard(&self, key: &str) -> LatchkeyResult<u64> {
        self.check()?;
        self.inner.scard(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        self.check()?;
        self.inner.sismember(key, member).await
    }

    async fn lpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        self.check()?;
        self.inner.lpush(key, value).await
    }

    async fn rpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        self.check()?;
        self.inner.rpush(key, value).await
    }

    async fn lindex(&self, key: &str, index: i64) -> LatchkeyResult<Option<String>> {
        self.check()?;
        self.inner.lindex(key, index).await
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> LatchkeyResult<u64> {
        self.check()?;
        self.inner.lrem(key, count, value).await
    }

    async fn llen(&self, key: &str) -> LatchkeyResult<u64> {
        self.check()?;
        self.inner.llen(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> LatchkeyResult<Vec<String>> {
        self.check()?;
        self.inner.lrange(key, start, stop).await
    }

    async fn run_script(&self, script: &AtomicScript) -> LatchkeyResult<ScriptReply> {
        self.check()?;
        self.inner.run_script(script).await
    }

    async fn ping(&self) -> LatchkeyResult<()> {
        self.check()?;
        self.inner.ping().await
    }
}

// ============================================================================
// RECORDING SINK
// ============================================================================

/// Alert sink that keeps every alert it is handed. When switched to failing
/// it still records the alert before reporting the failure.
#[derive(Debug, Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Names of the rules that fired, in delivery order.
    pub fn rules(&self) -> Vec<String> {
        self.alerts().into_iter().map(|a| a.rule).collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.clear();
        }
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> LatchkeyResult<()> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(latchkey_core::MonitorError::SinkFailed {
                sink: "recording".to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for latchkey inputs.

    use super::*;
    use proptest::prelude::*;

    /// Colon-separated cache key, e.g. `student:42:grades`.
    pub fn key_strategy() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(:[a-z0-9]{1,6}){0,2}"
    }

    /// Up to five numeric row ids, possibly repeated, possibly none.
    pub fn row_ids_strategy() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(
            (1u32..20).prop_map(|id| id.to_string()),
            0..6,
        )
    }

    /// Fresh owner token per case.
    pub fn token_strategy() -> impl Strategy<Value = OwnerToken> {
        Just(()).prop_map(|_| OwnerToken::generate())
    }

    pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..256)
    }

    /// No TTL, or one between one second and one hour.
    pub fn ttl_strategy() -> impl Strategy<Value = Option<Duration>> {
        prop_oneof![
            Just(None),
            (1u64..3600).prop_map(|secs| Some(Duration::from_secs(secs))),
        ]
    }

    pub fn lock_mode_strategy() -> impl Strategy<Value = LockMode> {
        prop_oneof![Just(LockMode::Exclusive), Just(LockMode::Shared)]
    }

    pub fn alert_level_strategy() -> impl Strategy<Value = AlertLevel> {
        prop_oneof![
            Just(AlertLevel::Info),
            Just(AlertLevel::Warning),
            Just(AlertLevel::Critical),
        ]
    }

    /// Lock settings that always pass validation.
    pub fn lock_config_strategy() -> impl Strategy<Value = LockConfig> {
        (
            prop::option::of(100u64..10_000),
            1u64..500,
            1_000u64..60_000,
            any::<bool>(),
        )
            .prop_map(|(timeout_ms, retry_ms, lease_ms, auto_renew)| LockConfig {
                timeout: timeout_ms.map(Duration::from_millis),
                retry_interval: Duration::from_millis(retry_ms),
                lease_time: Duration::from_millis(lease_ms),
                auto_renew,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;
    use latchkey_storage::{LocalStore, TwoTierCache};

    /// Configuration tuned for tests: `test` namespace, short waits, small
    /// local store, one-second monitor interval.
    pub fn test_config() -> LatchkeyConfig {
        let mut config = LatchkeyConfig::default().with_namespace("test");
        config.local.max_items = Some(100);
        config.lock = LockConfig {
            timeout: Some(Duration::from_secs(5)),
            retry_interval: Duration::from_millis(10),
            lease_time: Duration::from_secs(5),
            auto_renew: true,
        };
        config.semaphore.timeout = Some(Duration::from_secs(5));
        config.semaphore.lease_time = Duration::from_secs(5);
        config.warmer.batch_size = 10;
        config.warmer.concurrency = 2;
        config.monitor = MonitorConfig {
            collection_interval: Duration::from_secs(1),
            retention: Duration::from_secs(3600),
            default_cooldown: Duration::from_secs(10),
            max_history: 100,
        };
        config
    }

    pub fn test_remote() -> SharedRemote {
        Arc::new(InMemoryRemoteStore::new())
    }

    /// Two-tier cache over a fresh local store and the given remote.
    pub fn test_cache(remote: SharedRemote, config: &LatchkeyConfig) -> Arc<TwoTierCache> {
        Arc::new(TwoTierCache::new(
            Arc::new(LocalStore::new(&config.local)),
            remote,
            config,
        ))
    }

    /// Install a test-writer subscriber honoring `RUST_LOG`. Safe to call
    /// from every test.
    pub fn init_tracing() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the latchkey error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_timeout<T: std::fmt::Debug>(result: &LatchkeyResult<T>) {
        match result {
            Err(e) if e.is_timeout() => {}
            other => panic!("Expected acquisition timeout, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_version_conflict<T: std::fmt::Debug>(result: &LatchkeyResult<T>) {
        match result {
            Err(e) if e.is_version_conflict() => {}
            other => panic!("Expected version conflict, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_unavailable<T: std::fmt::Debug>(result: &LatchkeyResult<T>) {
        match result {
            Err(e) if e.is_unavailable() => {}
            other => panic!("Expected remote store unavailable, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_owned<T: std::fmt::Debug>(result: &LatchkeyResult<T>) {
        match result {
            Err(LatchkeyError::Lock(LockError::NotOwned { .. })) => {}
            other => panic!("Expected NotOwned, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_ttl_within(status: TtlStatus, max: Duration) {
        match status {
            TtlStatus::Expires(left) => assert!(left <= max, "TTL {:?} exceeds {:?}", left, max),
            other => panic!("Expected an expiring key, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_monitor::{AlertRule, MetricSnapshot};
    use proptest::prelude::*;

    #[test]
    fn test_config_is_valid() {
        let config = fixtures::test_config();
        config.validate().unwrap();
        assert_eq!(config.namespace, "test");
    }

    #[tokio::test]
    async fn test_flaky_store_switches() {
        let store = FlakyRemoteStore::in_memory();
        assert!(store.set("k", b"v", None, SetCondition::Always).await.unwrap());

        store.set_failing(true);
        assertions::assert_unavailable(&store.get("k").await);
        assertions::assert_unavailable(&store.ping().await);

        store.set_failing(false);
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.calls(), 4);
    }

    #[tokio::test]
    async fn test_recording_sink_records_even_when_failing() {
        let sink = RecordingSink::new();
        let alert = Alert::new(&AlertRule::new("r", "m", |_| true), &MetricSnapshot::new());
        sink.send(&alert).await.unwrap();
        sink.set_failing(true);
        assert!(sink.send(&alert).await.is_err());
        assert_eq!(sink.rules(), vec!["r".to_string(), "r".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_lock_config_is_valid(lock in generators::lock_config_strategy()) {
            let mut config = fixtures::test_config();
            config.lock = lock;
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_generated_keys_are_namespaced_cleanly(key in generators::key_strategy()) {
            prop_assert!(!key.is_empty());
            prop_assert!(!key.starts_with(':'));
            prop_assert!(!key.contains('*'));
        }

        #[test]
        fn prop_row_ids_are_numeric(rows in generators::row_ids_strategy()) {
            prop_assert!(rows.len() < 6);
            prop_assert!(rows.iter().all(|r| r.parse::<u32>().is_ok()));
        }
    }
}
