//! Counting semaphore.
//!
//! The remote counter holds the number of free permits and is created lazily
//! at `count` by the first acquire. Holders are tracked in an owner set so a
//! release only returns a permit that was actually taken, and releasing
//! twice is harmless.
//!
//! With `auto_renew` a held permit re-arms the counter and owner set while
//! its token is still a member, so a long holder keeps its slot.

use crate::renewal::RenewalHandle;
use crate::retry::{retry_until, RetryPolicy};
use crate::traits::DistributedLock;
use async_trait::async_trait;
use latchkey_core::{CacheError, KeySpace, LatchkeyResult, OwnerToken, SemaphoreConfig};
use latchkey_storage::{AtomicScript, SharedRemote};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct Permit {
    token: OwnerToken,
    _renewal: Option<RenewalHandle>,
}

pub struct Semaphore {
    remote: SharedRemote,
    name: String,
    counter_key: String,
    owners_key: String,
    config: SemaphoreConfig,
    permit: Mutex<Option<Permit>>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("count", &self.config.count)
            .field("holding", &self.is_holding())
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(remote: SharedRemote, keys: &KeySpace, name: &str, config: SemaphoreConfig) -> Self {
        Self {
            remote,
            name: name.to_string(),
            counter_key: keys.semaphore(name),
            owners_key: keys.semaphore_owners(name),
            config,
            permit: Mutex::new(None),
        }
    }

    pub fn count(&self) -> u32 {
        self.config.count
    }

    fn state(&self) -> LatchkeyResult<MutexGuard<'_, Option<Permit>>> {
        self.permit.lock().map_err(|_| CacheError::LockPoisoned.into())
    }

    /// Whether this instance holds a permit.
    pub fn is_holding(&self) -> bool {
        self.state().map(|p| p.is_some()).unwrap_or(false)
    }

    async fn take(&self, token: &OwnerToken) -> LatchkeyResult<bool> {
        let script = AtomicScript::SemaphoreAcquire {
            counter_key: self.counter_key.clone(),
            owners_key: self.owners_key.clone(),
            token: token.clone(),
            count: self.config.count,
            ttl: self.config.lease_time,
        };
        Ok(self.remote.run_script(&script).await?.into_flag(script.name())?)
    }

    fn on_acquired(&self, token: OwnerToken) -> LatchkeyResult<()> {
        let renewal = self.config.auto_renew.then(|| {
            RenewalHandle::spawn_membership(
                self.remote.clone(),
                self.owners_key.clone(),
                vec![self.counter_key.clone()],
                token.clone(),
                self.config.lease_time,
            )
        });
        *self.state()? = Some(Permit {
            token,
            _renewal: renewal,
        });
        tracing::debug!(semaphore = %self.name, "Permit acquired");
        Ok(())
    }

    /// Acquire using the configured timeout.
    pub async fn acquire_default(&self) -> LatchkeyResult<()> {
        self.acquire(self.config.timeout).await
    }

    /// Free permits. An untouched semaphore reports `count`.
    pub async fn available(&self) -> LatchkeyResult<u32> {
        let Some(raw) = self.remote.get(&self.counter_key).await? else {
            return Ok(self.config.count);
        };
        let free = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(free.clamp(0, i64::from(self.config.count)) as u32)
    }

    /// Tokens currently holding a permit.
    pub async fn holders(&self) -> LatchkeyResult<Vec<String>> {
        let mut holders = self.remote.smembers(&self.owners_key).await?;
        holders.sort();
        Ok(holders)
    }
}

#[async_trait]
impl DistributedLock for Semaphore {
    fn resource(&self) -> &str {
        &self.name
    }

    /// Wait for a permit with exponential backoff between attempts. Holding
    /// one already is a no-op.
    async fn acquire(&self, timeout: Option<Duration>) -> LatchkeyResult<()> {
        if self.is_holding() {
            return Ok(());
        }
        let token = OwnerToken::generate();
        let policy = RetryPolicy::Exponential(self.config.backoff.clone());
        retry_until(&self.name, timeout, &policy, || self.take(&token)).await?;
        self.on_acquired(token)
    }

    async fn try_acquire(&self) -> LatchkeyResult<bool> {
        if self.is_holding() {
            return Ok(true);
        }
        let token = OwnerToken::generate();
        if self.take(&token).await? {
            self.on_acquired(token)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self) -> LatchkeyResult<bool> {
        let permit = self.state()?.take();
        let Some(permit) = permit else {
            return Ok(false);
        };
        let token = permit.token.clone();
        drop(permit);

        let script = AtomicScript::SemaphoreRelease {
            counter_key: self.counter_key.clone(),
            owners_key: self.owners_key.clone(),
            token,
            count: self.config.count,
        };
        let released = self.remote.run_script(&script).await?.into_flag(script.name())?;
        if released {
            tracing::debug!(semaphore = %self.name, "Permit released");
        } else {
            tracing::warn!(semaphore = %self.name, "Permit had already expired at release");
        }
        Ok(released)
    }

    /// True when no permit is free.
    async fn is_locked(&self) -> LatchkeyResult<bool> {
        Ok(self.available().await? == 0)
    }
}
