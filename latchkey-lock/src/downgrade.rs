//! Reader/writer lock whose exclusive hold can be downgraded to shared.
//!
//! Exclusive state is a single owner record, shared state is an owner set.
//! A writer only gets in when both are empty, readers only join while no
//! exclusive record exists, and `downgrade` swaps the exclusive record for a
//! shared entry inside one atomic script so no writer can slip in between.
//!
//! With `auto_renew` both modes keep their lease: the exclusive record by
//! compare-and-expire, a reader by re-arming the shared set while its token
//! is still a member.

use crate::renewal::RenewalHandle;
use crate::retry::{retry_until, RetryPolicy};
use crate::traits::DistributedLock;
use async_trait::async_trait;
use latchkey_core::{
    CacheError, KeySpace, LatchkeyResult, LockConfig, LockError, LockMode, OwnerToken,
};
use latchkey_storage::{AtomicScript, SharedRemote};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct Held {
    token: OwnerToken,
    mode: LockMode,
    _renewal: Option<RenewalHandle>,
}

pub struct DowngradableLock {
    remote: SharedRemote,
    resource: String,
    exclusive_key: String,
    shared_key: String,
    config: LockConfig,
    held: Mutex<Option<Held>>,
}

impl std::fmt::Debug for DowngradableLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DowngradableLock")
            .field("resource", &self.resource)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl DowngradableLock {
    pub fn new(remote: SharedRemote, keys: &KeySpace, resource: &str, config: LockConfig) -> Self {
        Self {
            remote,
            resource: resource.to_string(),
            exclusive_key: keys.rw_exclusive(resource),
            shared_key: keys.rw_shared(resource),
            config,
            held: Mutex::new(None),
        }
    }

    fn state(&self) -> LatchkeyResult<MutexGuard<'_, Option<Held>>> {
        self.held.lock().map_err(|_| CacheError::LockPoisoned.into())
    }

    /// Mode this instance currently holds, `None` when unlocked.
    pub fn mode(&self) -> Option<LockMode> {
        self.state()
            .ok()
            .and_then(|held| held.as_ref().map(|h| h.mode))
    }

    fn already_held(&self) -> LatchkeyResult<()> {
        match self.mode() {
            Some(mode) => Err(LockError::InvalidState {
                resource: self.resource.clone(),
                reason: format!("already held in {mode} mode"),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn exclusive_script(&self, token: &OwnerToken) -> AtomicScript {
        AtomicScript::ExclusiveAcquire {
            exclusive_key: self.exclusive_key.clone(),
            shared_key: self.shared_key.clone(),
            token: token.clone(),
            ttl: self.config.lease_time,
        }
    }

    fn shared_script(&self, token: &OwnerToken) -> AtomicScript {
        AtomicScript::SharedAcquire {
            exclusive_key: self.exclusive_key.clone(),
            shared_key: self.shared_key.clone(),
            token: token.clone(),
            ttl: self.config.lease_time,
        }
    }

    async fn attempt(&self, script: &AtomicScript) -> LatchkeyResult<bool> {
        Ok(self.remote.run_script(script).await?.into_flag(script.name())?)
    }

    fn on_acquired(&self, token: OwnerToken, mode: LockMode) -> LatchkeyResult<()> {
        let remote = self.remote.clone();
        let lease = self.config.lease_time;
        let renewal = self.config.auto_renew.then(|| match mode {
            LockMode::Exclusive => {
                RenewalHandle::spawn(remote, self.exclusive_key.clone(), token.clone(), lease)
            }
            LockMode::Shared => RenewalHandle::spawn_membership(
                remote,
                self.shared_key.clone(),
                Vec::new(),
                token.clone(),
                lease,
            ),
        });
        *self.state()? = Some(Held {
            token,
            mode,
            _renewal: renewal,
        });
        tracing::debug!(resource = %self.resource, %mode, "Downgradable lock acquired");
        Ok(())
    }

    /// Wait for sole write access.
    pub async fn acquire_exclusive(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        self.already_held()?;
        let token = OwnerToken::generate();
        let script = self.exclusive_script(&token);
        let policy = RetryPolicy::Fixed(self.config.retry_interval);
        retry_until(&self.resource, timeout, &policy, || self.attempt(&script)).await?;
        self.on_acquired(token, LockMode::Exclusive)
    }

    /// Wait to join the readers.
    pub async fn acquire_shared(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        self.already_held()?;
        let token = OwnerToken::generate();
        let script = self.shared_script(&token);
        let policy = RetryPolicy::Fixed(self.config.retry_interval);
        retry_until(&self.resource, timeout, &policy, || self.attempt(&script)).await?;
        self.on_acquired(token, LockMode::Shared)
    }

    pub async fn try_acquire_shared(&self) -> LatchkeyResult<bool> {
        self.already_held()?;
        let token = OwnerToken::generate();
        if self.attempt(&self.shared_script(&token)).await? {
            self.on_acquired(token, LockMode::Shared)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Turn an exclusive hold into a shared one without ever releasing.
    ///
    /// Returns false if the exclusive lease was already lost; the instance is
    /// then left unlocked.
    pub async fn downgrade(&self) -> LatchkeyResult<bool> {
        let held = self.state()?.take();
        let held = match held {
            Some(h) if h.mode == LockMode::Exclusive => h,
            other => {
                let reason = match other.as_ref().map(|h| h.mode) {
                    Some(mode) => format!("cannot downgrade from {mode} mode"),
                    None => "cannot downgrade an unheld lock".to_string(),
                };
                *self.state()? = other;
                return Err(LockError::InvalidState {
                    resource: self.resource.clone(),
                    reason,
                }
                .into());
            }
        };
        let token = held.token.clone();
        drop(held);

        let script = AtomicScript::Downgrade {
            exclusive_key: self.exclusive_key.clone(),
            shared_key: self.shared_key.clone(),
            token: token.clone(),
            ttl: self.config.lease_time,
        };
        let downgraded = self.attempt(&script).await?;
        if downgraded {
            self.on_acquired(token, LockMode::Shared)?;
        } else {
            tracing::warn!(resource = %self.resource, "Exclusive lease lost before downgrade");
        }
        Ok(downgraded)
    }

    /// Number of current readers.
    pub async fn reader_count(&self) -> LatchkeyResult<u64> {
        self.remote.scard(&self.shared_key).await
    }
}

#[async_trait]
impl DistributedLock for DowngradableLock {
    fn resource(&self) -> &str {
        &self.resource
    }

    /// Exclusive acquisition.
    async fn acquire(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        self.acquire_exclusive(timeout).await
    }

    async fn try_acquire(&self) -> LatchkeyResult<bool> {
        self.already_held()?;
        let token = OwnerToken::generate();
        if self.attempt(&self.exclusive_script(&token)).await? {
            self.on_acquired(token, LockMode::Exclusive)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self) -> LatchkeyResult<bool> {
        let held = self.state()?.take();
        let Some(held) = held else {
            return Ok(false);
        };
        let mode = held.mode;
        let token = held.token.clone();
        drop(held);

        let script = match mode {
            LockMode::Exclusive => AtomicScript::CompareAndDelete {
                key: self.exclusive_key.clone(),
                token,
            },
            LockMode::Shared => AtomicScript::SharedRelease {
                shared_key: self.shared_key.clone(),
                token,
            },
        };
        let released = self.attempt(&script).await?;
        tracing::debug!(resource = %self.resource, %mode, released, "Downgradable lock released");
        Ok(released)
    }

    /// Held in either mode by anyone.
    async fn is_locked(&self) -> LatchkeyResult<bool> {
        if self.remote.exists(&self.exclusive_key).await? {
            return Ok(true);
        }
        Ok(self.remote.scard(&self.shared_key).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_storage::{InMemoryRemoteStore, RemoteStore};
    use std::sync::Arc;

    fn lock(remote: &Arc<InMemoryRemoteStore>) -> DowngradableLock {
        DowngradableLock::new(
            remote.clone(),
            &KeySpace::new("t"),
            "roster",
            LockConfig {
                timeout: None,
                retry_interval: Duration::from_millis(20),
                lease_time: Duration::from_secs(10),
                auto_renew: false,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_readers_share_writers_exclude() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let (r1, r2, w) = (lock(&remote), lock(&remote), lock(&remote));

        r1.acquire_shared(None).await.unwrap();
        r2.acquire_shared(None).await.unwrap();
        assert_eq!(r1.reader_count().await.unwrap(), 2);
        assert!(!w.try_acquire().await.unwrap());

        r1.release().await.unwrap();
        assert!(!w.try_acquire().await.unwrap());
        r2.release().await.unwrap();
        assert!(!remote.exists("t:rwlock:roster:shared").await.unwrap());
        assert!(w.try_acquire().await.unwrap());
        assert!(!r1.try_acquire_shared().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_downgrade_keeps_writers_out() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let (holder, writer, reader) = (lock(&remote), lock(&remote), lock(&remote));

        holder.acquire_exclusive(None).await.unwrap();
        assert!(holder.downgrade().await.unwrap());
        assert_eq!(holder.mode(), Some(LockMode::Shared));
        assert!(!remote.exists("t:rwlock:roster").await.unwrap());

        assert!(!writer.try_acquire().await.unwrap());
        assert!(reader.try_acquire_shared().await.unwrap());
        assert_eq!(holder.reader_count().await.unwrap(), 2);

        assert!(holder.release().await.unwrap());
        assert!(reader.release().await.unwrap());
        assert!(!holder.is_locked().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_downgrade_requires_exclusive() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let l = lock(&remote);
        assert!(l.downgrade().await.is_err());

        l.acquire_shared(None).await.unwrap();
        assert!(l.downgrade().await.is_err());
        assert_eq!(l.mode(), Some(LockMode::Shared));
    }

    #[tokio::test(start_paused = true)]
    async fn test_downgrade_after_lost_lease() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let l = lock(&remote);
        l.acquire_exclusive(None).await.unwrap();
        remote.delete(&["t:rwlock:roster".to_string()]).await.unwrap();

        assert!(!l.downgrade().await.unwrap());
        assert_eq!(l.mode(), None);
        assert!(!l.is_locked().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_reader_keeps_writers_out() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = LockConfig {
            auto_renew: true,
            ..lock(&remote).config
        };
        let keys = KeySpace::new("t");
        let reader = DowngradableLock::new(remote.clone(), &keys, "roster", config.clone());
        let writer = DowngradableLock::new(remote.clone(), &keys, "roster", config);

        reader.acquire_shared(None).await.unwrap();
        for _ in 0..25 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(!writer.try_acquire().await.unwrap());
        assert_eq!(reader.reader_count().await.unwrap(), 1);

        assert!(reader.release().await.unwrap());
        assert!(writer.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_downgraded_hold_is_renewed() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = LockConfig {
            auto_renew: true,
            ..lock(&remote).config
        };
        let keys = KeySpace::new("t");
        let holder = DowngradableLock::new(remote.clone(), &keys, "roster", config.clone());
        let writer = DowngradableLock::new(remote.clone(), &keys, "roster", config);

        holder.acquire_exclusive(None).await.unwrap();
        assert!(holder.downgrade().await.unwrap());
        for _ in 0..25 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(!writer.try_acquire().await.unwrap());
        assert!(holder.release().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_times_out_behind_reader() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let (reader, writer) = (lock(&remote), lock(&remote));
        reader.acquire_shared(None).await.unwrap();
        let err = writer
            .acquire_exclusive(Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
