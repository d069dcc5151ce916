//! Mutual-exclusion lock.
//!
//! The lock record is a single key holding the owner token, written with
//! `SET NX PX lease`. Release and extension are compare-and-act scripts, so
//! a stale holder can never delete or extend somebody else's lease.
//!
//! Nested acquisition on the same instance is reentrant: a hold counter is
//! bumped and only the last release deletes the record.

use crate::renewal::RenewalHandle;
use crate::retry::{retry_until, RetryPolicy};
use crate::traits::DistributedLock;
use async_trait::async_trait;
use chrono::Utc;
use latchkey_core::{
    CacheError, KeySpace, LatchkeyResult, LockConfig, LockError, OwnerToken, Timestamp,
};
use latchkey_storage::{AtomicScript, SharedRemote};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct Held {
    token: OwnerToken,
    depth: u32,
    acquired_at: Timestamp,
    // dropping the handle stops renewal
    _renewal: Option<RenewalHandle>,
}

pub struct DistributedMutex {
    remote: SharedRemote,
    resource: String,
    key: String,
    config: LockConfig,
    held: Mutex<Option<Held>>,
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("resource", &self.resource)
            .field("key", &self.key)
            .field("depth", &self.hold_depth())
            .finish_non_exhaustive()
    }
}

impl DistributedMutex {
    /// Mutex on `resource`, stored under `keys.mutex(resource)`.
    pub fn new(remote: SharedRemote, keys: &KeySpace, resource: &str, config: LockConfig) -> Self {
        Self::with_key(remote, resource, keys.mutex(resource), config)
    }

    /// Mutex stored under an explicit, fully namespaced key.
    pub fn with_key(
        remote: SharedRemote,
        resource: &str,
        key: String,
        config: LockConfig,
    ) -> Self {
        Self {
            remote,
            resource: resource.to_string(),
            key,
            config,
            held: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn state(&self) -> LatchkeyResult<MutexGuard<'_, Option<Held>>> {
        self.held.lock().map_err(|_| CacheError::LockPoisoned.into())
    }

    /// Token of the current hold, if this instance holds the lock.
    pub fn token(&self) -> Option<OwnerToken> {
        self.state()
            .ok()
            .and_then(|held| held.as_ref().map(|h| h.token.clone()))
    }

    /// Reentrancy depth; zero when not held.
    pub fn hold_depth(&self) -> u32 {
        self.state()
            .ok()
            .and_then(|held| held.as_ref().map(|h| h.depth))
            .unwrap_or(0)
    }

    pub fn is_held(&self) -> bool {
        self.hold_depth() > 0
    }

    pub fn acquired_at(&self) -> Option<Timestamp> {
        self.state()
            .ok()
            .and_then(|held| held.as_ref().map(|h| h.acquired_at))
    }

    /// How long the current hold has lasted.
    pub fn hold_time(&self) -> Option<Duration> {
        self.acquired_at()
            .map(|at| (Utc::now() - at).to_std().unwrap_or_default())
    }

    /// Acquire using the configured timeout.
    pub async fn acquire_default(&self) -> LatchkeyResult<()> {
        self.acquire(self.config.timeout).await
    }

    /// Bump the hold counter if already held.
    fn reenter(&self) -> LatchkeyResult<bool> {
        let mut held = self.state()?;
        match held.as_mut() {
            Some(h) => {
                h.depth += 1;
                tracing::debug!(resource = %self.resource, depth = h.depth, "Lock re-entered");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attempt(&self, token: &OwnerToken) -> LatchkeyResult<bool> {
        self.remote
            .set_if_absent(&self.key, token.as_bytes(), Some(self.config.lease_time))
            .await
    }

    fn on_acquired(&self, token: OwnerToken) -> LatchkeyResult<()> {
        let renewal = self.config.auto_renew.then(|| {
            RenewalHandle::spawn(
                self.remote.clone(),
                self.key.clone(),
                token.clone(),
                self.config.lease_time,
            )
        });
        let mut held = self.state()?;
        *held = Some(Held {
            token,
            depth: 1,
            acquired_at: Utc::now(),
            _renewal: renewal,
        });
        tracing::debug!(resource = %self.resource, key = %self.key, "Lock acquired");
        Ok(())
    }

    /// Reset the lease to `ttl`. Returns false when this instance does not
    /// own the lock.
    pub async fn extend(&self, ttl: Duration) -> LatchkeyResult<bool> {
        let Some(token) = self.token() else {
            return Ok(false);
        };
        let script = AtomicScript::CompareAndExpire {
            key: self.key.clone(),
            token,
            ttl,
        };
        Ok(self.remote.run_script(&script).await?.into_flag(script.name())?)
    }

    /// Confirm against the remote store that the lease is still ours.
    pub async fn ensure_held(&self) -> LatchkeyResult<()> {
        let owned = match self.token() {
            Some(token) => self.remote.get(&self.key).await?.as_deref() == Some(token.as_bytes()),
            None => false,
        };
        if owned {
            Ok(())
        } else {
            Err(LockError::NotOwned {
                resource: self.resource.clone(),
            }
            .into())
        }
    }

    /// Delete the lock record regardless of owner.
    pub async fn force_unlock(&self) -> LatchkeyResult<bool> {
        let removed = self.remote.delete(std::slice::from_ref(&self.key)).await?;
        self.state()?.take();
        tracing::warn!(resource = %self.resource, removed, "Lock forcibly unlocked");
        Ok(removed > 0)
    }
}

#[async_trait]
impl DistributedLock for DistributedMutex {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn acquire(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        if self.reenter()? {
            return Ok(());
        }
        let token = OwnerToken::generate();
        let policy = RetryPolicy::Fixed(self.config.retry_interval);
        retry_until(&self.resource, timeout, &policy, || self.attempt(&token)).await?;
        self.on_acquired(token)
    }

    async fn try_acquire(&self) -> LatchkeyResult<bool> {
        if self.reenter()? {
            return Ok(true);
        }
        let token = OwnerToken::generate();
        if self.attempt(&token).await? {
            self.on_acquired(token)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self) -> LatchkeyResult<bool> {
        let held = {
            let mut state = self.state()?;
            let depth = match state.as_ref() {
                None => return Ok(false),
                Some(h) => h.depth,
            };
            if depth > 1 {
                if let Some(h) = state.as_mut() {
                    h.depth -= 1;
                }
                return Ok(true);
            }
            state.take()
        };
        let Some(held) = held else {
            return Ok(false);
        };
        let token = held.token.clone();
        // stop renewing before the record goes away
        drop(held);

        let script = AtomicScript::CompareAndDelete {
            key: self.key.clone(),
            token,
        };
        let released = self.remote.run_script(&script).await?.into_flag(script.name())?;
        if released {
            tracing::debug!(resource = %self.resource, "Lock released");
        } else {
            tracing::warn!(resource = %self.resource, "Lease had already expired at release");
        }
        Ok(released)
    }

    async fn is_locked(&self) -> LatchkeyResult<bool> {
        self.remote.exists(&self.key).await
    }
}
