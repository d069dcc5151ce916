//! Two-tier cache façade.
//!
//! Composes a [`LocalStore`] with a shared [`RemoteStore`]. Reads are
//! read-through with local backfill, writes are write-through with the remote
//! tier written first. Keys are namespaced once here and stored under the
//! same full key in both tiers, so pattern invalidation can address both.
//! Typed helpers encode through the configured [`ValueSerializer`].

use super::local::LocalStore;
use super::serializer::ValueSerializer;
use super::traits::{SetCondition, TtlStatus};
use crate::remote::SharedRemote;
use latchkey_core::{CacheError, KeySpace, LatchkeyConfig, LatchkeyError, LatchkeyResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Default)]
struct TierCounters {
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of the per-tier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub local_hits: u64,
    pub local_misses: u64,
    pub remote_hits: u64,
    pub remote_misses: u64,
    pub sets: u64,
    pub errors: u64,
}

impl TierStats {
    /// Fraction of reads served by the local tier.
    pub fn local_hit_rate(&self) -> f64 {
        ratio(self.local_hits, self.local_hits + self.local_misses)
    }

    /// Fraction of local misses that the remote tier answered.
    pub fn remote_hit_rate(&self) -> f64 {
        ratio(self.remote_hits, self.remote_hits + self.remote_misses)
    }

    /// Fraction of reads answered by either tier.
    pub fn hit_rate(&self) -> f64 {
        ratio(self.local_hits + self.remote_hits, self.local_hits + self.local_misses)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

impl TierCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TierStats {
        TierStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            local_misses: self.local_misses.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            remote_misses: self.remote_misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// FAÇADE
// ============================================================================

/// Read-through, write-through cache over a local and a remote tier.
pub struct TwoTierCache {
    local: Arc<LocalStore>,
    remote: SharedRemote,
    keys: KeySpace,
    default_ttl: Option<Duration>,
    serializer: ValueSerializer,
    counters: TierCounters,
}

impl std::fmt::Debug for TwoTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("namespace", &self.keys.namespace())
            .field("default_ttl", &self.default_ttl)
            .field("serializer", &self.serializer)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl TwoTierCache {
    pub fn new(local: Arc<LocalStore>, remote: SharedRemote, config: &LatchkeyConfig) -> Self {
        Self {
            local,
            remote,
            keys: KeySpace::new(config.namespace.clone()),
            default_ttl: config.default_ttl,
            serializer: ValueSerializer::from_config(&config.serializer),
            counters: TierCounters::default(),
        }
    }

    /// Replace the serializer used by the typed helpers.
    pub fn with_serializer(mut self, serializer: ValueSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn serializer(&self) -> &ValueSerializer {
        &self.serializer
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn remote(&self) -> &SharedRemote {
        &self.remote
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn stats(&self) -> TierStats {
        self.counters.snapshot()
    }

    fn track<T>(&self, result: LatchkeyResult<T>) -> LatchkeyResult<T> {
        if result.is_err() {
            TierCounters::bump(&self.counters.errors);
        }
        result
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read through both tiers, backfilling the local tier on a remote hit.
    pub async fn get(&self, key: &str) -> LatchkeyResult<Option<Vec<u8>>> {
        let full = self.keys.key(key);

        if let Some(value) = self.local.get(&full)? {
            TierCounters::bump(&self.counters.local_hits);
            return Ok(Some(value));
        }
        TierCounters::bump(&self.counters.local_misses);

        let fetched = self.track(self.remote.get_with_ttl(&full).await)?;
        let Some((value, ttl)) = fetched else {
            TierCounters::bump(&self.counters.remote_misses);
            return Ok(None);
        };
        TierCounters::bump(&self.counters.remote_hits);

        let local_ttl = match ttl {
            TtlStatus::Expires(remaining) => Some(remaining),
            // expired between the two reads; nothing worth backfilling
            TtlStatus::Missing => return Ok(Some(value)),
            TtlStatus::NoExpiry => None,
        };
        self.store_local(&full, value.clone(), local_ttl);
        Ok(Some(value))
    }

    /// Read several keys. Missing keys are absent from the result.
    pub async fn get_many(&self, keys: &[&str]) -> LatchkeyResult<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert((*key).to_string(), value);
            }
        }
        Ok(found)
    }

    pub async fn exists(&self, key: &str) -> LatchkeyResult<bool> {
        let full = self.keys.key(key);
        if self.local.exists(&full)? {
            return Ok(true);
        }
        self.track(self.remote.exists(&full).await)
    }

    /// Remaining lifetime as seen by the remote tier.
    pub async fn ttl(&self, key: &str) -> LatchkeyResult<TtlStatus> {
        let full = self.keys.key(key);
        self.track(self.remote.ttl(&full).await)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write to the remote tier, then the local tier. `ttl = None` applies
    /// the configured default TTL.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> LatchkeyResult<()> {
        self.set_with(key, value, ttl, SetCondition::Always)
            .await
            .map(|_| ())
    }

    /// Conditional write. Returns false when the remote condition failed, in
    /// which case the local tier is left untouched.
    pub async fn set_with(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> LatchkeyResult<bool> {
        let full = self.keys.key(key);
        let ttl = ttl.or(self.default_ttl);

        let written = self.track(self.remote.set(&full, value, ttl, condition).await)?;
        if !written {
            return Ok(false);
        }
        TierCounters::bump(&self.counters.sets);
        self.store_local(&full, value.to_vec(), ttl);
        Ok(true)
    }

    pub async fn set_many(
        &self,
        entries: impl IntoIterator<Item = (String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> LatchkeyResult<usize> {
        let mut written = 0;
        for (key, value) in entries {
            self.set(&key, &value, ttl).await?;
            written += 1;
        }
        Ok(written)
    }

    fn store_local(&self, full: &str, value: Vec<u8>, ttl: Option<Duration>) {
        match self.local.set(full, value, ttl) {
            Ok(()) => {}
            Err(LatchkeyError::Cache(CacheError::OversizedEntry { size, limit, .. })) => {
                tracing::debug!(key = %full, size, limit, "Skipping local tier for oversized entry");
            }
            Err(e) => {
                // the remote write already succeeded; drop the stale local copy
                tracing::warn!(key = %full, error = %e, "Local tier write failed");
                if let Err(e) = self.local.delete(full) {
                    tracing::warn!(key = %full, error = %e, "Failed to drop stale local copy");
                }
            }
        }
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Delete a key from both tiers. Returns whether the remote key existed.
    pub async fn delete(&self, key: &str) -> LatchkeyResult<bool> {
        let full = self.keys.key(key);
        let removed = self.track(self.remote.delete(std::slice::from_ref(&full)).await)?;
        self.local.delete(&full)?;
        Ok(removed > 0)
    }

    pub async fn invalidate(&self, key: &str) -> LatchkeyResult<()> {
        self.delete(key).await.map(|_| ())
    }

    /// Invalidate every key matching a glob pattern in both tiers. Returns
    /// the number of remote keys removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> LatchkeyResult<u64> {
        let full = self.keys.key(pattern);
        let local_removed = self.local.clear(Some(&full))?;
        let remote_removed = self.track(self.remote.delete_pattern(&full).await)?;
        tracing::debug!(
            pattern = %full,
            local_removed,
            remote_removed,
            "Invalidated cache pattern"
        );
        Ok(remote_removed)
    }

    // ========================================================================
    // TYPED HELPERS
    // ========================================================================

    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> LatchkeyResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(self.serializer.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_typed<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> LatchkeyResult<()> {
        let bytes = self.serializer.encode(value)?;
        self.set(key, &bytes, ttl).await
    }

    /// Return the cached value for `key`, or compute it with `loader` and
    /// cache the result.
    ///
    /// An unreachable remote tier turns the read into a miss and the write
    /// into a logged no-op; the loader's value is still returned. Loader
    /// errors propagate unchanged.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> LatchkeyResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = LatchkeyResult<T>>,
    {
        match self.get_typed::<T>(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.is_unavailable() => {
                tracing::warn!(key, error = %e, "Cache read failed, loading directly");
            }
            Err(LatchkeyError::Cache(CacheError::Serialization { reason })) => {
                tracing::warn!(key, reason = %reason, "Discarding undecodable cached value");
            }
            Err(e) => return Err(e),
        }

        let value = loader().await?;
        if let Err(e) = self.set_typed(key, &value, ttl).await {
            tracing::warn!(key, error = %e, "Failed to cache loaded value");
        }
        Ok(value)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemoteStore, RemoteStore};
    use latchkey_core::LocalStoreConfig;
    use std::sync::atomic::AtomicUsize;

    fn config() -> LatchkeyConfig {
        LatchkeyConfig::default().with_namespace("test")
    }

    fn cache_with(local: LocalStore) -> (TwoTierCache, Arc<InMemoryRemoteStore>) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let cache = TwoTierCache::new(Arc::new(local), remote.clone(), &config());
        (cache, remote)
    }

    fn cache() -> (TwoTierCache, Arc<InMemoryRemoteStore>) {
        cache_with(LocalStore::unbounded())
    }

    #[tokio::test]
    async fn test_remote_hit_backfills_local() {
        let (cache, remote) = cache();
        remote
            .set("test:k", b"v", Some(Duration::from_secs(60)), SetCondition::Always)
            .await
            .unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        let stats = cache.stats();
        assert_eq!(stats.local_misses, 1);
        assert_eq!(stats.remote_hits, 1);

        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.stats().local_hits, 1);
        assert!(matches!(
            cache.local().ttl("test:k").unwrap(),
            TtlStatus::Expires(d) if d <= Duration::from_secs(60)
        ));
    }

    #[tokio::test]
    async fn test_set_writes_both_tiers() {
        let (cache, remote) = cache();
        cache.set("k", b"v", None).await.unwrap();
        assert_eq!(remote.get("test:k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.local().get("test:k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.stats().sets, 1);
    }

    #[tokio::test]
    async fn test_oversized_value_skips_local_tier() {
        let local = LocalStore::new(&LocalStoreConfig {
            max_bytes: Some(16),
            ..LocalStoreConfig::default()
        });
        let (cache, remote) = cache_with(local);
        let big = vec![7u8; 64];

        cache.set("big", &big, None).await.unwrap();
        assert_eq!(remote.get("test:big").await.unwrap(), Some(big));
        assert!(!cache.local().exists("test:big").unwrap());
    }

    #[tokio::test]
    async fn test_conditional_set_leaves_local_untouched() {
        let (cache, _remote) = cache();
        assert!(cache
            .set_with("k", b"1", None, SetCondition::IfAbsent)
            .await
            .unwrap());
        cache.local().delete("test:k").unwrap();
        assert!(!cache
            .set_with("k", b"2", None, SetCondition::IfAbsent)
            .await
            .unwrap());
        assert!(!cache.local().exists("test:k").unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_invalidate_pattern_clears_both_tiers() {
        let (cache, remote) = cache();
        cache.set("student:1", b"a", None).await.unwrap();
        cache.set("student:2", b"b", None).await.unwrap();
        cache.set("staff:1", b"c", None).await.unwrap();

        assert_eq!(cache.invalidate_pattern("student:*").await.unwrap(), 2);
        assert!(!cache.local().exists("test:student:1").unwrap());
        assert!(!remote.exists("test:student:2").await.unwrap());
        assert!(cache.exists("staff:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_get_many() {
        let (cache, _remote) = cache();
        cache
            .set_many(
                vec![("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())],
                None,
            )
            .await
            .unwrap();
        assert!(cache.delete("a").await.unwrap());
        assert!(!cache.delete("a").await.unwrap());

        let found = cache.get_many(&["a", "b", "c"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("b"), Some(&b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_typed_round_trip_is_plain_json_by_default() {
        let (cache, remote) = cache();
        cache.set_typed("grades", &vec![90, 85], None).await.unwrap();
        let grades: Option<Vec<u32>> = cache.get_typed("grades").await.unwrap();
        assert_eq!(grades, Some(vec![90, 85]));
        assert_eq!(remote.get("test:grades").await.unwrap(), Some(b"[90,85]".to_vec()));
    }

    #[tokio::test]
    async fn test_compressed_serializer_shrinks_large_values() {
        let (cache, remote) = cache();
        let cache = cache.with_serializer(ValueSerializer::msgpack().with_compression(1024, 6));
        let timetable = vec!["period 1: maths".to_string(); 200];

        cache.set_typed("timetable", &timetable, None).await.unwrap();
        let stored = remote.get("test:timetable").await.unwrap().unwrap();
        assert_eq!(stored[0], b'c');
        assert!(stored.len() < 1024);

        let read: Option<Vec<String>> = cache.get_typed("timetable").await.unwrap();
        assert_eq!(read, Some(timetable));
    }

    #[tokio::test]
    async fn test_get_or_load_replaces_undecodable_value() {
        let (cache, remote) = cache();
        remote
            .set("test:report", b"not json", None, SetCondition::Always)
            .await
            .unwrap();
        let value: u32 = cache
            .get_or_load("report", None, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(cache.get_typed::<u32>("report").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_poisoned_local_tier_does_not_fail_write() {
        let (cache, remote) = cache();
        cache.local().poison();
        cache.set("k", b"v", None).await.unwrap();
        assert_eq!(remote.get("test:k").await.unwrap(), Some(b"v".to_vec()));
        assert!(cache.local().get("test:k").is_err());
    }

    #[tokio::test]
    async fn test_get_or_load_calls_loader_once() {
        let (cache, _remote) = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: String = cache
                .get_or_load("report", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("computed".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_load_propagates_loader_error() {
        let (cache, _remote) = cache();
        let result: LatchkeyResult<u32> = cache
            .get_or_load("k", None, || async {
                Err(CacheError::Serialization {
                    reason: "boom".into(),
                }
                .into())
            })
            .await;
        assert!(result.is_err());
        assert!(!cache.exists("k").await.unwrap());
    }

    #[test]
    fn test_hit_rates() {
        let stats = TierStats {
            local_hits: 3,
            local_misses: 1,
            remote_hits: 1,
            remote_misses: 0,
            sets: 0,
            errors: 0,
        };
        assert_eq!(stats.local_hit_rate(), 0.75);
        assert_eq!(stats.remote_hit_rate(), 1.0);
        assert_eq!(stats.hit_rate(), 1.0);
        assert_eq!(TierStats::default().hit_rate(), 0.0);
    }
}
