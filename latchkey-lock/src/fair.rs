//! Fair (FIFO) lock.
//!
//! Waiters append their token to a queue list and are granted the lock only
//! when their token heads the queue and the lock record can be written; the
//! fair-acquire script checks both and pops the queue in one step.
//!
//! Every poll re-arms the queue expiry, so the queue outlives a holder that
//! keeps renewing its lease. A waiter whose token vanished from the queue is
//! appended again by its next poll.
//!
//! A waiter that times out removes itself from the queue before returning.
//! A waiter whose `acquire` future is dropped mid-wait schedules the same
//! removal from a drop guard, so abandoned tokens never block the queue.

use crate::renewal::RenewalHandle;
use crate::retry::Deadline;
use crate::traits::DistributedLock;
use async_trait::async_trait;
use latchkey_core::{CacheError, KeySpace, LatchkeyResult, LockConfig, OwnerToken};
use latchkey_storage::{AtomicScript, SharedRemote};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct Held {
    token: OwnerToken,
    _renewal: Option<RenewalHandle>,
}

/// Removes a waiter's token from the queue unless disarmed.
struct QueueGuard {
    remote: SharedRemote,
    queue_key: String,
    token: Option<OwnerToken>,
}

impl QueueGuard {
    fn disarm(&mut self) {
        self.token = None;
    }

    async fn leave(&mut self) -> LatchkeyResult<()> {
        if let Some(token) = self.token.take() {
            let script = AtomicScript::QueueRemove {
                queue_key: self.queue_key.clone(),
                token,
            };
            self.remote.run_script(&script).await?;
        }
        Ok(())
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(queue = %self.queue_key, "No runtime to remove abandoned waiter");
            return;
        };
        let remote = self.remote.clone();
        let script = AtomicScript::QueueRemove {
            queue_key: self.queue_key.clone(),
            token,
        };
        runtime.spawn(async move {
            if let Err(e) = remote.run_script(&script).await {
                tracing::warn!(error = %e, "Failed to remove abandoned waiter from queue");
            }
        });
    }
}

pub struct FairLock {
    remote: SharedRemote,
    resource: String,
    lock_key: String,
    queue_key: String,
    config: LockConfig,
    held: Mutex<Option<Held>>,
    // token of an in-flight acquire, for queue_position()
    waiting: Mutex<Option<OwnerToken>>,
}

impl std::fmt::Debug for FairLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairLock")
            .field("resource", &self.resource)
            .field("lock_key", &self.lock_key)
            .finish_non_exhaustive()
    }
}

impl FairLock {
    pub fn new(remote: SharedRemote, keys: &KeySpace, resource: &str, config: LockConfig) -> Self {
        Self {
            remote,
            resource: resource.to_string(),
            lock_key: keys.fair(resource),
            queue_key: keys.fair_queue(resource),
            config,
            held: Mutex::new(None),
            waiting: Mutex::new(None),
        }
    }

    fn state(&self) -> LatchkeyResult<MutexGuard<'_, Option<Held>>> {
        self.held.lock().map_err(|_| CacheError::LockPoisoned.into())
    }

    fn set_waiting(&self, token: Option<OwnerToken>) {
        if let Ok(mut waiting) = self.waiting.lock() {
            *waiting = token;
        }
    }

    pub fn is_held(&self) -> bool {
        self.state().map(|held| held.is_some()).unwrap_or(false)
    }

    /// Number of waiters currently queued.
    pub async fn queue_len(&self) -> LatchkeyResult<u64> {
        self.remote.llen(&self.queue_key).await
    }

    /// Zero-based queue position of this instance's in-flight acquire.
    pub async fn queue_position(&self) -> LatchkeyResult<Option<usize>> {
        let token = self.waiting.lock().ok().and_then(|w| w.clone());
        let Some(token) = token else {
            return Ok(None);
        };
        let queue = self.remote.lrange(&self.queue_key, 0, -1).await?;
        Ok(queue.iter().position(|t| t == token.as_str()))
    }

    /// Acquire using the configured timeout.
    pub async fn acquire_default(&self) -> LatchkeyResult<()> {
        self.acquire(self.config.timeout).await
    }

    async fn grant(&self, token: &OwnerToken) -> LatchkeyResult<bool> {
        let script = AtomicScript::FairAcquire {
            lock_key: self.lock_key.clone(),
            queue_key: self.queue_key.clone(),
            token: token.clone(),
            ttl: self.config.lease_time,
        };
        Ok(self.remote.run_script(&script).await?.into_flag(script.name())?)
    }

    fn on_acquired(&self, token: OwnerToken) -> LatchkeyResult<()> {
        let renewal = self.config.auto_renew.then(|| {
            RenewalHandle::spawn(
                self.remote.clone(),
                self.lock_key.clone(),
                token.clone(),
                self.config.lease_time,
            )
        });
        *self.state()? = Some(Held {
            token,
            _renewal: renewal,
        });
        tracing::debug!(resource = %self.resource, "Fair lock acquired");
        Ok(())
    }

    async fn wait_in_queue(
        &self,
        guard: &mut QueueGuard,
        token: &OwnerToken,
        deadline: Deadline,
    ) -> LatchkeyResult<()> {
        loop {
            if self.grant(token).await? {
                guard.disarm();
                return Ok(());
            }
            if deadline.is_expired() {
                guard.leave().await?;
                tracing::debug!(resource = %self.resource, "Fair lock wait timed out");
                return Err(deadline.timeout_error(&self.resource).into());
            }
            tokio::time::sleep(deadline.clamp(self.config.retry_interval)).await;
        }
    }

    pub async fn ensure_held(&self) -> LatchkeyResult<()> {
        let token = self.state()?.as_ref().map(|h| h.token.clone());
        let owned = match token {
            Some(token) => {
                self.remote.get(&self.lock_key).await?.as_deref() == Some(token.as_bytes())
            }
            None => false,
        };
        if owned {
            Ok(())
        } else {
            Err(latchkey_core::LockError::NotOwned {
                resource: self.resource.clone(),
            }
            .into())
        }
    }
}

#[async_trait]
impl DistributedLock for FairLock {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn acquire(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        let deadline = Deadline::start(timeout);
        let token = OwnerToken::generate();
        // armed before the first poll enqueues the token
        let mut guard = QueueGuard {
            remote: self.remote.clone(),
            queue_key: self.queue_key.clone(),
            token: Some(token.clone()),
        };

        self.set_waiting(Some(token.clone()));
        let waited = self.wait_in_queue(&mut guard, &token, deadline).await;
        self.set_waiting(None);
        waited?;
        self.on_acquired(token)
    }

    /// Succeeds only when no one is queued ahead and the lock is free.
    async fn try_acquire(&self) -> LatchkeyResult<bool> {
        self.acquire(Some(Duration::ZERO))
            .await
            .map(|_| true)
            .or_else(|e| if e.is_timeout() { Ok(false) } else { Err(e) })
    }

    async fn release(&self) -> LatchkeyResult<bool> {
        let held = self.state()?.take();
        let Some(held) = held else {
            return Ok(false);
        };
        let token = held.token.clone();
        drop(held);

        let script = AtomicScript::CompareAndDelete {
            key: self.lock_key.clone(),
            token,
        };
        let released = self.remote.run_script(&script).await?.into_flag(script.name())?;
        tracing::debug!(resource = %self.resource, released, "Fair lock released");
        Ok(released)
    }

    async fn is_locked(&self) -> LatchkeyResult<bool> {
        self.remote.exists(&self.lock_key).await
    }
}
