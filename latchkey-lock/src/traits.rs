//! The contract shared by the blocking lock primitives.

use async_trait::async_trait;
use latchkey_core::LatchkeyResult;
use std::future::Future;
use std::time::Duration;

/// A lock whose state lives in the remote store.
///
/// Releasing a lock the caller does not hold is a no-op returning `false`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Name of the protected resource.
    fn resource(&self) -> &str;

    /// Block until the lock is held or `timeout` elapses. `None` waits
    /// indefinitely.
    async fn acquire(&self, timeout: Option<Duration>) -> LatchkeyResult<()>;

    /// Single non-blocking attempt.
    async fn try_acquire(&self) -> LatchkeyResult<bool>;

    /// Release the lock. Returns whether anything was released.
    async fn release(&self) -> LatchkeyResult<bool>;

    /// Whether anyone currently holds the lock.
    async fn is_locked(&self) -> LatchkeyResult<bool>;
}

/// Run `f` while holding `lock`, releasing it afterwards whether `f`
/// succeeded or failed.
pub async fn with_lock<L, F, Fut, T>(lock: &L, timeout: Option<Duration>, f: F) -> LatchkeyResult<T>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = LatchkeyResult<T>>,
{
    lock.acquire(timeout).await?;
    let result = f().await;
    if let Err(e) = lock.release().await {
        tracing::warn!(resource = %lock.resource(), error = %e, "Release after critical section failed");
    }
    result
}
