//! Pessimistic lock for long, contended critical sections.
//!
//! Same protocol as [`DistributedMutex`] under its own key family, plus the
//! administrative operations used for crash recovery and diagnostics.

use crate::mutex::DistributedMutex;
use crate::traits::DistributedLock;
use async_trait::async_trait;
use latchkey_core::{KeySpace, LatchkeyResult, LockConfig, Timestamp};
use latchkey_storage::SharedRemote;
use std::time::Duration;

#[derive(Debug)]
pub struct PessimisticLock {
    inner: DistributedMutex,
}

impl PessimisticLock {
    pub fn new(remote: SharedRemote, keys: &KeySpace, resource: &str, config: LockConfig) -> Self {
        Self {
            inner: DistributedMutex::with_key(remote, resource, keys.pessimistic(resource), config),
        }
    }

    pub fn key(&self) -> &str {
        self.inner.key()
    }

    /// Acquire with `timeout`, falling back to the configured timeout when
    /// none is given.
    pub async fn acquire_with_timeout(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        self.inner
            .acquire(timeout.or(self.inner.config().timeout))
            .await
    }

    /// Delete the lock record regardless of who holds it.
    pub async fn force_unlock(&self) -> LatchkeyResult<bool> {
        self.inner.force_unlock().await
    }

    /// How long this instance has held the lock, `None` when not held.
    pub fn hold_time(&self) -> Option<Duration> {
        self.inner.hold_time()
    }

    pub fn acquired_at(&self) -> Option<Timestamp> {
        self.inner.acquired_at()
    }

    pub fn hold_depth(&self) -> u32 {
        self.inner.hold_depth()
    }

    pub async fn extend(&self, ttl: Duration) -> LatchkeyResult<bool> {
        self.inner.extend(ttl).await
    }

    pub async fn ensure_held(&self) -> LatchkeyResult<()> {
        self.inner.ensure_held().await
    }
}

#[async_trait]
impl DistributedLock for PessimisticLock {
    fn resource(&self) -> &str {
        self.inner.resource()
    }

    async fn acquire(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        self.inner.acquire(timeout).await
    }

    async fn try_acquire(&self) -> LatchkeyResult<bool> {
        self.inner.try_acquire().await
    }

    async fn release(&self) -> LatchkeyResult<bool> {
        self.inner.release().await
    }

    async fn is_locked(&self) -> LatchkeyResult<bool> {
        self.inner.is_locked().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_storage::{InMemoryRemoteStore, RemoteStore};
    use std::sync::Arc;

    fn lock(remote: &Arc<InMemoryRemoteStore>) -> PessimisticLock {
        PessimisticLock::new(
            remote.clone(),
            &KeySpace::new("t"),
            "report",
            LockConfig {
                timeout: Some(Duration::from_millis(300)),
                retry_interval: Duration::from_millis(50),
                lease_time: Duration::from_secs(5),
                auto_renew: false,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_time_tracks_acquisition() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let l = lock(&remote);
        assert_eq!(l.hold_time(), None);
        l.acquire_with_timeout(None).await.unwrap();
        assert!(l.hold_time().is_some());
        assert!(remote.exists("t:pessimistic_lock:report").await.unwrap());
        l.release().await.unwrap();
        assert_eq!(l.hold_time(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeout_applies() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let holder = lock(&remote);
        let waiter = lock(&remote);
        holder.acquire(None).await.unwrap();
        let err = waiter.acquire_with_timeout(None).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_unlock_recovers_crashed_holder() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let crashed = lock(&remote);
        crashed.acquire(None).await.unwrap();
        std::mem::forget(crashed);

        let admin = lock(&remote);
        assert!(admin.force_unlock().await.unwrap());
        assert!(admin.try_acquire().await.unwrap());
    }
}
