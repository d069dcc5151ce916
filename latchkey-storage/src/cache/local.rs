//! In-process LRU + TTL store.
//!
//! Entries live in an `IndexMap` ordered from least to most recently used:
//! every hit or successful write moves the entry to the back, eviction pops
//! from the front. All operations are synchronous and serialized by a single
//! mutex; none of them await.
//!
//! Expiry is enforced twice: lazily when a key is touched, and by an optional
//! background sweep (`spawn_sweeper`) that runs independently of reads.

use super::pattern::KeyPattern;
use super::traits::{CacheStats, EvictionReason, SetCondition, TtlStatus};
use chrono::Utc;
use indexmap::IndexMap;
use latchkey_core::{CacheError, LatchkeyResult, LocalStoreConfig, Timestamp};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// A stored value plus its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub expire_at: Option<Instant>,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub hit_count: u64,
    pub size_bytes: usize,
}

impl CacheEntry {
    fn new(key: &str, value: Vec<u8>, expire_at: Option<Instant>) -> Self {
        let now = Utc::now();
        Self {
            size_bytes: entry_size(key, &value),
            value,
            expire_at,
            created_at: now,
            last_accessed_at: now,
            hit_count: 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.is_some_and(|at| now >= at)
    }

    pub fn ttl(&self, now: Instant) -> TtlStatus {
        match self.expire_at {
            None => TtlStatus::NoExpiry,
            Some(at) if at > now => TtlStatus::Expires(at - now),
            Some(_) => TtlStatus::Missing,
        }
    }
}

/// Accounted size of an entry: key plus value bytes.
pub fn entry_size(key: &str, value: &[u8]) -> usize {
    key.len() + value.len()
}

/// Callback invoked after an entry is evicted or expires.
pub type EvictionListener = Arc<dyn Fn(&str, EvictionReason) + Send + Sync>;

#[derive(Default)]
struct Inner {
    entries: IndexMap<String, CacheEntry>,
    total_bytes: usize,
    stats: CacheStats,
}

impl Inner {
    fn remove_index(&mut self, idx: usize) -> Option<(String, CacheEntry)> {
        let removed = self.entries.shift_remove_index(idx)?;
        self.total_bytes = self.total_bytes.saturating_sub(removed.1.size_bytes);
        Some(removed)
    }

    fn remove_key(&mut self, key: &str) -> Option<CacheEntry> {
        let idx = self.entries.get_index_of(key)?;
        self.remove_index(idx).map(|(_, entry)| entry)
    }

    /// Index of a live entry, dropping it first if it has expired.
    fn live_index(&mut self, key: &str, now: Instant, expired: &mut Vec<String>) -> Option<usize> {
        let idx = self.entries.get_index_of(key)?;
        if self.entries[idx].is_expired(now) {
            self.remove_index(idx);
            self.stats.expirations += 1;
            expired.push(key.to_string());
            return None;
        }
        Some(idx)
    }

    fn touch(&mut self, idx: usize) -> usize {
        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        last
    }
}

/// Bounded in-process cache.
pub struct LocalStore {
    inner: Mutex<Inner>,
    max_items: Option<usize>,
    max_bytes: Option<usize>,
    default_ttl: Option<Duration>,
    cleanup_interval: Duration,
    listener: Option<EvictionListener>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("max_items", &self.max_items)
            .field("max_bytes", &self.max_bytes)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    pub fn new(config: &LocalStoreConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_items: config.max_items,
            max_bytes: config.max_bytes,
            default_ttl: config.default_ttl,
            cleanup_interval: config.cleanup_interval,
            listener: None,
        }
    }

    /// Store with no bounds and no default TTL.
    pub fn unbounded() -> Self {
        Self::new(&LocalStoreConfig {
            max_items: None,
            max_bytes: None,
            default_ttl: None,
            ..LocalStoreConfig::default()
        })
    }

    /// Register a callback for evictions and expirations.
    pub fn with_eviction_listener(mut self, listener: EvictionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn max_bytes(&self) -> Option<usize> {
        self.max_bytes
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    fn lock(&self) -> LatchkeyResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| CacheError::LockPoisoned.into())
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.inner.lock();
            panic!("poisoning local store");
        }));
    }

    fn notify(&self, keys: &[String], reason: EvictionReason) {
        if let Some(listener) = &self.listener {
            for key in keys {
                listener(key, reason);
            }
        }
    }

    /// Read a value, refreshing its LRU position.
    pub fn get(&self, key: &str) -> LatchkeyResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let value = {
            let mut guard = self.lock()?;
            let inner = &mut *guard;
            match inner.live_index(key, now, &mut expired) {
                Some(idx) => {
                    let idx = inner.touch(idx);
                    let entry = &mut inner.entries[idx];
                    entry.hit_count += 1;
                    entry.last_accessed_at = Utc::now();
                    inner.stats.hits += 1;
                    Some(entry.value.clone())
                }
                None => {
                    inner.stats.misses += 1;
                    None
                }
            }
        };
        self.notify(&expired, EvictionReason::Expired);
        Ok(value)
    }

    /// Read a value together with its remaining lifetime.
    pub fn get_with_ttl(&self, key: &str) -> LatchkeyResult<Option<(Vec<u8>, TtlStatus)>> {
        let Some(value) = self.get(key)? else {
            return Ok(None);
        };
        let ttl = self.ttl(key)?;
        Ok(Some((value, ttl)))
    }

    /// Unconditional write. `None` applies the store's default TTL.
    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> LatchkeyResult<()> {
        self.set_with(key, value, ttl, SetCondition::Always).map(|_| ())
    }

    /// Conditional write. Returns whether the value was stored.
    ///
    /// A value whose accounted size exceeds `max_bytes` is rejected with
    /// `CacheError::OversizedEntry` and nothing is stored.
    pub fn set_with(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> LatchkeyResult<bool> {
        let size = entry_size(key, &value);
        if let Some(limit) = self.max_bytes {
            if size > limit {
                return Err(CacheError::OversizedEntry {
                    key: key.to_string(),
                    size,
                    limit,
                }
                .into());
            }
        }

        let now = Instant::now();
        let mut expired = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut guard = self.lock()?;
            let inner = &mut *guard;
            let exists = inner.live_index(key, now, &mut expired).is_some();
            if !condition.permits(exists) {
                drop(guard);
                self.notify(&expired, EvictionReason::Expired);
                return Ok(false);
            }

            let expire_at = ttl.or(self.default_ttl).map(|d| now + d);
            let entry = CacheEntry::new(key, value, expire_at);
            let (idx, previous) = inner.entries.insert_full(key.to_string(), entry);
            if let Some(previous) = previous {
                inner.total_bytes = inner.total_bytes.saturating_sub(previous.size_bytes);
            }
            inner.total_bytes += size;
            inner.touch(idx);

            while inner.entries.len() > 1 && self.over_bounds(inner) {
                if let Some((evicted_key, _)) = inner.remove_index(0) {
                    inner.stats.evictions += 1;
                    evicted.push(evicted_key);
                }
            }
        }

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted least recently used entries");
        }
        self.notify(&expired, EvictionReason::Expired);
        self.notify(&evicted, EvictionReason::Capacity);
        Ok(true)
    }

    fn over_bounds(&self, inner: &Inner) -> bool {
        self.max_items.is_some_and(|max| inner.entries.len() > max)
            || self.max_bytes.is_some_and(|max| inner.total_bytes > max)
    }

    pub fn delete(&self, key: &str) -> LatchkeyResult<bool> {
        Ok(self.lock()?.remove_key(key).is_some())
    }

    /// Existence check; does not change LRU order.
    pub fn exists(&self, key: &str) -> LatchkeyResult<bool> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let found = self.lock()?.live_index(key, now, &mut expired).is_some();
        self.notify(&expired, EvictionReason::Expired);
        Ok(found)
    }

    /// Set a new TTL on an existing key. Returns false if the key is absent.
    pub fn expire(&self, key: &str, ttl: Duration) -> LatchkeyResult<bool> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let updated = {
            let mut guard = self.lock()?;
            match guard.live_index(key, now, &mut expired) {
                Some(idx) => {
                    guard.entries[idx].expire_at = Some(now + ttl);
                    true
                }
                None => false,
            }
        };
        self.notify(&expired, EvictionReason::Expired);
        Ok(updated)
    }

    /// Remove the TTL from an existing key.
    pub fn persist(&self, key: &str) -> LatchkeyResult<bool> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let updated = {
            let mut guard = self.lock()?;
            match guard.live_index(key, now, &mut expired) {
                Some(idx) => {
                    guard.entries[idx].expire_at = None;
                    true
                }
                None => false,
            }
        };
        self.notify(&expired, EvictionReason::Expired);
        Ok(updated)
    }

    pub fn ttl(&self, key: &str) -> LatchkeyResult<TtlStatus> {
        let now = Instant::now();
        let guard = self.lock()?;
        Ok(guard
            .entries
            .get(key)
            .map_or(TtlStatus::Missing, |entry| entry.ttl(now)))
    }

    /// Remove every key, or only those matching a glob pattern.
    /// Returns the number of entries removed.
    pub fn clear(&self, pattern: Option<&str>) -> LatchkeyResult<usize> {
        let mut guard = self.lock()?;
        match pattern {
            None => {
                let removed = guard.entries.len();
                guard.entries.clear();
                guard.total_bytes = 0;
                Ok(removed)
            }
            Some(pattern) => {
                let pattern = KeyPattern::new(pattern)?;
                let inner = &mut *guard;
                let before = inner.entries.len();
                let mut freed = 0usize;
                inner.entries.retain(|key, entry| {
                    let keep = !pattern.matches(key);
                    if !keep {
                        freed += entry.size_bytes;
                    }
                    keep
                });
                inner.total_bytes = inner.total_bytes.saturating_sub(freed);
                Ok(before - inner.entries.len())
            }
        }
    }

    /// Live keys, optionally filtered by a glob pattern, oldest first.
    pub fn keys(&self, pattern: Option<&str>) -> LatchkeyResult<Vec<String>> {
        let pattern = match pattern {
            Some(p) => KeyPattern::new(p)?,
            None => KeyPattern::any(),
        };
        let now = Instant::now();
        let guard = self.lock()?;
        Ok(guard
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Snapshot of an entry's metadata without touching LRU order.
    pub fn get_entry(&self, key: &str) -> LatchkeyResult<Option<CacheEntry>> {
        let now = Instant::now();
        let guard = self.lock()?;
        Ok(guard
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned())
    }

    pub fn stats(&self) -> LatchkeyResult<CacheStats> {
        let guard = self.lock()?;
        Ok(CacheStats {
            current_size: guard.total_bytes as u64,
            current_items: guard.entries.len() as u64,
            ..guard.stats.clone()
        })
    }

    pub fn len(&self) -> usize {
        self.lock().map(|guard| guard.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> LatchkeyResult<usize> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut guard = self.lock()?;
            let inner = &mut *guard;
            let mut removed = Vec::new();
            let mut freed = 0usize;
            inner.entries.retain(|key, entry| {
                if entry.is_expired(now) {
                    freed += entry.size_bytes;
                    removed.push(key.clone());
                    false
                } else {
                    true
                }
            });
            inner.total_bytes = inner.total_bytes.saturating_sub(freed);
            inner.stats.expirations += removed.len() as u64;
            removed
        };
        self.notify(&expired, EvictionReason::Expired);
        Ok(expired.len())
    }

    /// Spawn the background expiry sweep.
    ///
    /// The task stops when `shutdown_rx` flips to `true`, when its sender is
    /// dropped, or when the last strong reference to the store goes away.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let period = self.cleanup_interval;
        tokio::spawn(sweep_loop(store, period, shutdown_rx))
    }
}

async fn sweep_loop(store: Weak<LocalStore>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_secs = period.as_secs(), "Local store sweeper started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Swept expired entries"),
                    Err(e) => tracing::error!(error = %e, "Local store sweep failed"),
                }
            }
        }
    }

    tracing::info!("Local store sweeper stopped");
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_core::LatchkeyError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bounded(max_items: Option<usize>, max_bytes: Option<usize>) -> LocalStore {
        LocalStore::new(&LocalStoreConfig {
            max_items,
            max_bytes,
            default_ttl: None,
            cleanup_interval: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_set_get_delete() {
        let store = LocalStore::unbounded();
        store.set("a", b"1".to_vec(), None).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert!(store.exists("a").unwrap());
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_lru_evicts_least_recently_read() {
        let store = bounded(Some(3), None);
        for key in ["k1", "k2", "k3"] {
            store.set(key, key.as_bytes().to_vec(), None).unwrap();
        }
        for key in ["k2", "k3"] {
            store.get(key).unwrap();
        }
        store.set("k4", b"k4".to_vec(), None).unwrap();

        assert!(!store.exists("k1").unwrap());
        for key in ["k2", "k3", "k4"] {
            assert!(store.exists(key).unwrap(), "{key} should survive");
        }
        assert_eq!(store.stats().unwrap().evictions, 1);
    }

    #[test]
    fn test_read_protects_oldest_entry() {
        let store = bounded(Some(2), None);
        store.set("old", b"1".to_vec(), None).unwrap();
        store.set("new", b"2".to_vec(), None).unwrap();
        store.get("old").unwrap();
        store.set("newest", b"3".to_vec(), None).unwrap();
        assert!(store.exists("old").unwrap());
        assert!(!store.exists("new").unwrap());
    }

    #[test]
    fn test_byte_bound_evicts_and_rejects_oversized() {
        let store = bounded(None, Some(10));
        store.set("a", vec![0; 5], None).unwrap();
        store.set("b", vec![0; 5], None).unwrap();
        assert!(!store.exists("a").unwrap());
        assert!(store.stats().unwrap().current_size <= 10);

        let err = store.set("big", vec![0; 64], None).unwrap_err();
        assert!(matches!(
            err,
            LatchkeyError::Cache(CacheError::OversizedEntry { size: 67, limit: 10, .. })
        ));
        assert!(!store.exists("big").unwrap());
        assert!(store.exists("b").unwrap());
    }

    #[test]
    fn test_conditional_writes() {
        let store = LocalStore::unbounded();
        assert!(store.set_with("k", b"1".to_vec(), None, SetCondition::IfPresent).is_ok_and(|s| !s));
        assert!(store.set_with("k", b"1".to_vec(), None, SetCondition::IfAbsent).unwrap());
        assert!(!store.set_with("k", b"2".to_vec(), None, SetCondition::IfAbsent).unwrap());
        assert!(store.set_with("k", b"3".to_vec(), None, SetCondition::IfPresent).unwrap());
        assert_eq!(store.get("k").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_overwrite_keeps_byte_accounting() {
        let store = LocalStore::unbounded();
        store.set("k", vec![0; 10], None).unwrap();
        store.set("k", vec![0; 4], None).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.current_items, 1);
        assert_eq!(stats.current_size, 5);
    }

    #[test]
    fn test_clear_with_pattern() {
        let store = LocalStore::unbounded();
        for key in ["user:1", "user:2", "grade:1"] {
            store.set(key, b"x".to_vec(), None).unwrap();
        }
        assert_eq!(store.clear(Some("user:*")).unwrap(), 2);
        assert_eq!(store.keys(None).unwrap(), vec!["grade:1".to_string()]);
        assert_eq!(store.clear(None).unwrap(), 1);
        assert!(store.is_empty());
        assert_eq!(store.stats().unwrap().current_size, 0);
    }

    #[test]
    fn test_stats_and_entry_metadata() {
        let store = LocalStore::unbounded();
        store.set("k", b"v".to_vec(), None).unwrap();
        store.get("k").unwrap();
        store.get("k").unwrap();
        store.get("missing").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.current_items, 1);

        let entry = store.get_entry("k").unwrap().unwrap();
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.size_bytes, 2);
        assert!(entry.last_accessed_at >= entry.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_is_a_miss() {
        let store = LocalStore::unbounded();
        store.set("k", b"v".to_vec(), Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(store.ttl("k").unwrap(), TtlStatus::Expires(_)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.ttl("k").unwrap(), TtlStatus::Missing);
        assert_eq!(store.stats().unwrap().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reporting() {
        let store = LocalStore::unbounded();
        store.set("forever", b"v".to_vec(), None).unwrap();
        assert_eq!(store.ttl("forever").unwrap(), TtlStatus::NoExpiry);
        assert_eq!(store.ttl("missing").unwrap(), TtlStatus::Missing);
        assert_eq!(store.ttl("missing").unwrap().as_legacy_secs(), Some(-1));
        assert_eq!(store.ttl("forever").unwrap().as_legacy_secs(), None);

        assert!(store.expire("forever", Duration::from_secs(10)).unwrap());
        assert_eq!(
            store.ttl("forever").unwrap(),
            TtlStatus::Expires(Duration::from_secs(10))
        );
        assert!(store.persist("forever").unwrap());
        assert_eq!(store.ttl("forever").unwrap(), TtlStatus::NoExpiry);
        assert!(!store.expire("missing", Duration::from_secs(1)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies() {
        let store = LocalStore::new(&LocalStoreConfig {
            default_ttl: Some(Duration::from_secs(30)),
            ..LocalStoreConfig::default()
        });
        store.set("k", b"v".to_vec(), None).unwrap();
        assert_eq!(
            store.ttl("k").unwrap(),
            TtlStatus::Expires(Duration::from_secs(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_without_reads() {
        let store = Arc::new(bounded(None, None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = store.spawn_sweeper(shutdown_rx);

        store.set("short", b"v".to_vec(), Some(Duration::from_millis(500))).unwrap();
        store.set("long", b"v".to_vec(), None).unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().unwrap().expirations, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_eviction_listener_receives_reasons() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = evicted.clone();
        let store = bounded(Some(1), None).with_eviction_listener(Arc::new(move |_, reason| {
            if reason == EvictionReason::Capacity {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));
        store.set("a", b"1".to_vec(), None).unwrap();
        store.set("b", b"2".to_vec(), None).unwrap();
        store.set("c", b"3".to_vec(), None).unwrap();
        assert_eq!(evicted.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_item_bound_holds(
            max in 1usize..16,
            keys in proptest::collection::vec("[a-z]{1,4}", 1..64),
        ) {
            let store = bounded(Some(max), None);
            for key in &keys {
                store.set(key, key.as_bytes().to_vec(), None).unwrap();
                prop_assert!(store.len() <= max);
            }
        }

        #[test]
        fn prop_most_recent_write_survives(
            max in 1usize..8,
            keys in proptest::collection::vec("[a-z]{1,3}", 1..32),
        ) {
            let store = bounded(Some(max), None);
            for key in &keys {
                store.set(key, vec![1], None).unwrap();
            }
            let last = keys.last().unwrap();
            prop_assert!(store.exists(last).unwrap());
        }

        #[test]
        fn prop_byte_accounting_matches_contents(
            writes in proptest::collection::vec(("[a-d]", 0usize..32), 1..48),
        ) {
            let store = bounded(None, Some(64));
            for (key, len) in &writes {
                let _ = store.set(key, vec![0; *len], None);
            }
            let expected: usize = store
                .keys(None)
                .unwrap()
                .iter()
                .map(|k| store.get_entry(k).unwrap().unwrap().size_bytes)
                .sum();
            let stats = store.stats().unwrap();
            prop_assert_eq!(stats.current_size as usize, expected);
            prop_assert!(stats.current_size <= 64);
        }
    }
}
