//! Batch cache pre-loader.
//!
//! Splits the requested keys into batches, skips keys the façade already
//! holds (unless forced), asks a [`BatchLoader`] for the rest and writes the
//! results back through the façade. Batches run with bounded concurrency and
//! a failing batch never aborts the others.

use crate::cache::TwoTierCache;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use latchkey_core::{CacheError, LatchkeyResult, LockError, WarmerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of values for keys being warmed.
#[async_trait]
pub trait BatchLoader: Send + Sync {
    /// Load values for `keys`. Keys absent from the result count as failed;
    /// extra keys are ignored.
    async fn load(&self, keys: &[String]) -> LatchkeyResult<HashMap<String, Vec<u8>>>;
}

#[async_trait]
impl<F, Fut> BatchLoader for F
where
    F: Fn(Vec<String>) -> Fut + Send + Sync,
    Fut: Future<Output = LatchkeyResult<HashMap<String, Vec<u8>>>> + Send,
{
    async fn load(&self, keys: &[String]) -> LatchkeyResult<HashMap<String, Vec<u8>>> {
        (self)(keys.to_vec()).await
    }
}

/// Outcome of a warm-up run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupReport {
    pub total: usize,
    pub loaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl WarmupReport {
    fn absorb(&mut self, batch: WarmupReport) {
        self.loaded += batch.loaded;
        self.failed += batch.failed;
        self.skipped += batch.skipped;
    }
}

/// Clears the in-progress flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CacheWarmer {
    cache: Arc<TwoTierCache>,
    config: WarmerConfig,
    running: AtomicBool,
    last_report: Mutex<Option<WarmupReport>>,
}

impl std::fmt::Debug for CacheWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWarmer")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CacheWarmer {
    pub fn new(cache: Arc<TwoTierCache>, config: WarmerConfig) -> Self {
        Self {
            cache,
            config,
            running: AtomicBool::new(false),
            last_report: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<TwoTierCache> {
        &self.cache
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Report of the most recent completed run.
    pub fn last_report(&self) -> Option<WarmupReport> {
        self.last_report.lock().ok().and_then(|guard| *guard)
    }

    /// Warm `keys` into the cache.
    ///
    /// Fails with [`LockError::WarmupInProgress`] if another run on this
    /// warmer has not finished.
    pub async fn warm_up<L>(
        &self,
        keys: &[String],
        loader: &L,
        ttl: Option<Duration>,
        force: bool,
    ) -> LatchkeyResult<WarmupReport>
    where
        L: BatchLoader + ?Sized,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LockError::WarmupInProgress.into());
        }
        let _guard = RunGuard(&self.running);

        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.concurrency.max(1);
        tracing::info!(
            total = keys.len(),
            batch_size,
            concurrency,
            force,
            "Cache warm-up started"
        );

        let batches = keys
            .chunks(batch_size)
            .map(|batch| self.warm_batch(batch, loader, ttl, force));
        let outcomes: Vec<WarmupReport> = stream::iter(batches)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = WarmupReport {
            total: keys.len(),
            ..WarmupReport::default()
        };
        for outcome in outcomes {
            report.absorb(outcome);
        }

        tracing::info!(
            total = report.total,
            loaded = report.loaded,
            failed = report.failed,
            skipped = report.skipped,
            "Cache warm-up finished"
        );
        let mut last = self.last_report.lock().map_err(|_| CacheError::LockPoisoned)?;
        *last = Some(report);
        Ok(report)
    }

    async fn warm_batch<L>(
        &self,
        batch: &[String],
        loader: &L,
        ttl: Option<Duration>,
        force: bool,
    ) -> WarmupReport
    where
        L: BatchLoader + ?Sized,
    {
        let mut outcome = WarmupReport::default();

        let mut pending = Vec::with_capacity(batch.len());
        for key in batch {
            if !force {
                match self.cache.exists(key).await {
                    Ok(true) => {
                        outcome.skipped += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Existence check failed during warm-up");
                    }
                }
            }
            pending.push(key.clone());
        }
        if pending.is_empty() {
            return outcome;
        }

        let mut values = match loader.load(&pending).await {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(keys = pending.len(), error = %e, "Warm-up batch failed to load");
                outcome.failed += pending.len();
                return outcome;
            }
        };

        for key in &pending {
            let Some(value) = values.remove(key) else {
                outcome.failed += 1;
                continue;
            };
            match self.cache.set(key, &value, ttl).await {
                Ok(()) => outcome.loaded += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Warm-up write failed");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}

// =============================================================================
// TESTS
// =============================================================================
