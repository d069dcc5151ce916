//! Metric snapshots and the sources that produce them.
//!
//! Each source reports a flat map of numbers. The monitor prefixes every
//! name with the source name (`local.hits`, `cache.remote_misses`) and adds a
//! `hit_ratio` wherever a `hits`/`misses` pair exists.

use async_trait::async_trait;
use chrono::Utc;
use latchkey_core::{HealthCheck, LatchkeyResult, Timestamp};
use latchkey_storage::{CacheWarmer, LocalStore, RemoteStore, SharedRemote, TwoTierCache};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Named numeric readings taken at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub taken_at: Timestamp,
    pub values: BTreeMap<String, f64>,
}

impl Default for MetricSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(taken_at: Timestamp) -> Self {
        Self {
            taken_at,
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add `{prefix}hit_ratio` for every `{prefix}hits` with a matching
    /// `{prefix}misses`, skipping pairs with no traffic.
    pub fn derive_hit_ratios(&mut self) {
        let mut derived = Vec::new();
        for (name, hits) in &self.values {
            let Some(prefix) = name.strip_suffix("hits") else {
                continue;
            };
            let ratio_name = format!("{prefix}hit_ratio");
            if self.values.contains_key(&ratio_name) {
                continue;
            }
            if let Some(misses) = self.values.get(&format!("{prefix}misses")) {
                let total = hits + misses;
                if total > 0.0 {
                    derived.push((ratio_name, hits / total));
                }
            }
        }
        self.values.extend(derived);
    }

    /// Fold another snapshot in under `source.` names.
    pub fn merge_source(&mut self, source: &str, other: MetricSnapshot) {
        for (name, value) in other.values {
            self.values.insert(format!("{source}.{name}"), value);
        }
    }
}

// ============================================================================
// SOURCES
// ============================================================================

/// Anything that can report metrics to the monitor.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Prefix used for this source's metrics.
    fn name(&self) -> &str;

    async fn collect(&self) -> LatchkeyResult<MetricSnapshot>;
}

#[async_trait]
impl MetricsSource for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn collect(&self) -> LatchkeyResult<MetricSnapshot> {
        let stats = self.stats()?;
        Ok(MetricSnapshot::new()
            .with("hits", stats.hits as f64)
            .with("misses", stats.misses as f64)
            .with("evictions", stats.evictions as f64)
            .with("expirations", stats.expirations as f64)
            .with("current_size", stats.current_size as f64)
            .with("current_items", stats.current_items as f64))
    }
}

#[async_trait]
impl MetricsSource for TwoTierCache {
    fn name(&self) -> &str {
        "cache"
    }

    async fn collect(&self) -> LatchkeyResult<MetricSnapshot> {
        let stats = self.stats();
        let total_lookups = stats.local_hits + stats.local_misses;
        let mut snapshot = MetricSnapshot::new()
            .with("local_hits", stats.local_hits as f64)
            .with("local_misses", stats.local_misses as f64)
            .with("remote_hits", stats.remote_hits as f64)
            .with("remote_misses", stats.remote_misses as f64)
            .with("sets", stats.sets as f64)
            .with("errors", stats.errors as f64);
        if total_lookups > 0 {
            snapshot.insert("hit_ratio", stats.hit_rate());
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl MetricsSource for CacheWarmer {
    fn name(&self) -> &str {
        "warmer"
    }

    async fn collect(&self) -> LatchkeyResult<MetricSnapshot> {
        let mut snapshot =
            MetricSnapshot::new().with("running", if self.is_running() { 1.0 } else { 0.0 });
        if let Some(report) = self.last_report() {
            snapshot.insert("last_total", report.total as f64);
            snapshot.insert("last_loaded", report.loaded as f64);
            snapshot.insert("last_failed", report.failed as f64);
            snapshot.insert("last_skipped", report.skipped as f64);
        }
        Ok(snapshot)
    }
}

/// Reachability and key count of the remote store.
pub struct RemoteProbe {
    remote: SharedRemote,
    pattern: String,
}

impl std::fmt::Debug for RemoteProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProbe")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl RemoteProbe {
    /// Probe counting keys that match `pattern`, e.g. `"school:*"`.
    pub fn new(remote: SharedRemote, pattern: impl Into<String>) -> Self {
        Self {
            remote,
            pattern: pattern.into(),
        }
    }

    /// Ping the store. Slower than `slow` is degraded; an error is unhealthy.
    pub async fn health(&self, slow: Duration) -> HealthCheck {
        let started = Instant::now();
        match self.remote.ping().await {
            Ok(()) => {
                let latency = started.elapsed();
                let check = if latency > slow {
                    HealthCheck::degraded("remote", format!("ping took {:?}", latency))
                } else {
                    HealthCheck::healthy("remote")
                };
                check.with_latency(latency).with_detail("pattern", &self.pattern)
            }
            Err(e) => HealthCheck::unhealthy("remote", e.to_string()),
        }
    }
}

#[async_trait]
impl MetricsSource for RemoteProbe {
    fn name(&self) -> &str {
        "remote"
    }

    async fn collect(&self) -> LatchkeyResult<MetricSnapshot> {
        let started = Instant::now();
        self.remote.ping().await?;
        let latency = started.elapsed();
        let keys = self.remote.keys(&self.pattern).await?;
        Ok(MetricSnapshot::new()
            .with("ping_ms", latency.as_secs_f64() * 1000.0)
            .with("key_count", keys.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_core::LatchkeyConfig;
    use latchkey_storage::InMemoryRemoteStore;
    use std::sync::Arc;

    #[test]
    fn test_hit_ratio_derivation() {
        let mut snapshot = MetricSnapshot::new()
            .with("hits", 3.0)
            .with("misses", 1.0)
            .with("remote_hits", 0.0)
            .with("remote_misses", 0.0)
            .with("local_hits", 5.0);
        snapshot.derive_hit_ratios();
        assert_eq!(snapshot.get("hit_ratio"), Some(0.75));
        // no traffic, no ratio
        assert_eq!(snapshot.get("remote_hit_ratio"), None);
        // no misses counterpart
        assert_eq!(snapshot.get("local_hit_ratio"), None);
    }

    #[test]
    fn test_merge_prefixes_source() {
        let mut all = MetricSnapshot::new();
        all.merge_source("local", MetricSnapshot::new().with("hits", 1.0));
        all.merge_source("cache", MetricSnapshot::new().with("hits", 2.0));
        assert_eq!(all.get("local.hits"), Some(1.0));
        assert_eq!(all.get("cache.hits"), Some(2.0));
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_local_store_source() {
        let store = LocalStore::unbounded();
        store.set("a", b"1".to_vec(), None).unwrap();
        store.get("a").unwrap();
        store.get("missing").unwrap();

        let snapshot = store.collect().await.unwrap();
        assert_eq!(snapshot.get("hits"), Some(1.0));
        assert_eq!(snapshot.get("misses"), Some(1.0));
        assert_eq!(snapshot.get("current_items"), Some(1.0));
    }

    #[tokio::test]
    async fn test_cache_and_probe_sources() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let cache = TwoTierCache::new(
            Arc::new(LocalStore::unbounded()),
            remote.clone(),
            &LatchkeyConfig::default().with_namespace("m"),
        );
        cache.set("k", b"v", None).await.unwrap();
        cache.get("k").await.unwrap();

        let snapshot = cache.collect().await.unwrap();
        assert_eq!(snapshot.get("sets"), Some(1.0));
        assert_eq!(snapshot.get("local_hits"), Some(1.0));
        assert_eq!(snapshot.get("hit_ratio"), Some(1.0));

        let probe = RemoteProbe::new(remote, "m:*");
        let snapshot = probe.collect().await.unwrap();
        assert_eq!(snapshot.get("key_count"), Some(1.0));
        assert!(snapshot.get("ping_ms").is_some());
        assert!(probe.health(Duration::from_secs(1)).await.is_healthy());
    }
}
