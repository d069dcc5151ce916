//! Remote (shared) store abstraction.
//!
//! The remote store is the only state shared between processes and the
//! source of truth for cross-process coordination. Any backend offering
//! conditional writes with expiry, set and list primitives, and atomic
//! execution of the [`AtomicScript`] catalogue can stand behind this trait.
//!
//! Backend errors are converted into [`latchkey_core::RemoteError`] before
//! they leave an implementation.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;
pub mod script;

use crate::cache::{SetCondition, TtlStatus};
use async_trait::async_trait;
use latchkey_core::LatchkeyResult;
use std::sync::Arc;
use std::time::Duration;

pub use memory::InMemoryRemoteStore;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisRemoteStore;
pub use script::{AtomicScript, RowKey, ScriptReply};

/// Shared handle to a remote store.
pub type SharedRemote = Arc<dyn RemoteStore>;

/// Networked key-value store shared by all processes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    // ========================================================================
    // KEY/VALUE
    // ========================================================================

    async fn get(&self, key: &str) -> LatchkeyResult<Option<Vec<u8>>>;

    /// Read a value with its remaining lifetime.
    async fn get_with_ttl(&self, key: &str) -> LatchkeyResult<Option<(Vec<u8>, TtlStatus)>> {
        let Some(value) = self.get(key).await? else {
            return Ok(None);
        };
        let ttl = self.ttl(key).await?;
        Ok(Some((value, ttl)))
    }

    /// Write a value. `ttl = None` stores it without expiry.
    /// Returns false when the condition prevented the write.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> LatchkeyResult<bool>;

    /// `SET key value NX PX ttl`
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> LatchkeyResult<bool> {
        self.set(key, value, ttl, SetCondition::IfAbsent).await
    }

    /// `SET key value XX PX ttl`
    async fn set_if_present(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> LatchkeyResult<bool> {
        self.set(key, value, ttl, SetCondition::IfPresent).await
    }

    /// Delete keys. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> LatchkeyResult<u64>;

    async fn exists(&self, key: &str) -> LatchkeyResult<bool>;

    /// Set a new TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> LatchkeyResult<bool>;

    async fn ttl(&self, key: &str) -> LatchkeyResult<TtlStatus>;

    /// Keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> LatchkeyResult<Vec<String>>;

    /// Delete every key matching a glob pattern. Returns how many were removed.
    async fn delete_pattern(&self, pattern: &str) -> LatchkeyResult<u64> {
        let keys = self.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.delete(&keys).await
    }

    // ========================================================================
    // SETS
    // ========================================================================

    async fn sadd(&self, key: &str, member: &str) -> LatchkeyResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> LatchkeyResult<bool>;

    async fn smembers(&self, key: &str) -> LatchkeyResult<Vec<String>>;

    async fn scard(&self, key: &str) -> LatchkeyResult<u64>;

    async fn sismember(&self, key: &str, member: &str) -> LatchkeyResult<bool>;

    // ========================================================================
    // LISTS
    // ========================================================================

    /// Push to the head. Returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> LatchkeyResult<u64>;

    /// Push to the tail. Returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> LatchkeyResult<u64>;

    /// Element at `index`; negative indexes count from the tail.
    async fn lindex(&self, key: &str, index: i64) -> LatchkeyResult<Option<String>>;

    /// Remove occurrences of `value`: `count > 0` from the head, `count < 0`
    /// from the tail, `0` all of them. Returns how many were removed.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> LatchkeyResult<u64>;

    async fn llen(&self, key: &str) -> LatchkeyResult<u64>;

    /// Inclusive range with Redis index semantics.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> LatchkeyResult<Vec<String>>;

    // ========================================================================
    // ATOMIC SCRIPTS AND HEALTH
    // ========================================================================

    /// Execute one check-then-act transaction atomically.
    async fn run_script(&self, script: &AtomicScript) -> LatchkeyResult<ScriptReply>;

    async fn ping(&self) -> LatchkeyResult<()>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn get(&self, key: &str) -> LatchkeyResult<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn get_with_ttl(&self, key: &str) -> LatchkeyResult<Option<(Vec<u8>, TtlStatus)>> {
        (**self).get_with_ttl(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> LatchkeyResult<bool> {
        (**self).set(key, value, ttl, condition).await
    }

    async fn delete(&self, keys: &[String]) -> LatchkeyResult<u64> {
        (**self).delete(keys).await
    }

    async fn exists(&self, key: &str) -> LatchkeyResult<bool> {
        (**self).exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> LatchkeyResult<bool> {
        (**self).expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> LatchkeyResult<TtlStatus> {
        (**self).ttl(key).await
    }

    async fn keys(&self, pattern: &str) -> LatchkeyResult<Vec<String>> {
        (**self).keys(pattern).await
    }

    async fn delete_pattern(&self, pattern: &str) -> LatchkeyResult<u64> {
        (**self).delete_pattern(pattern).await
    }

    async fn sadd(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        (**self).sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        (**self).srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> LatchkeyResult<Vec<String>> {
        (**self).smembers(key).await
    }

    async fn scard(&self, key: &str) -> LatchkeyResult<u64> {
        (**self).scard(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> LatchkeyResult<bool> {
        (**self).sismember(key, member).await
    }

    async fn lpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        (**self).lpush(key, value).await
    }

    async fn rpush(&self, key: &str, value: &str) -> LatchkeyResult<u64> {
        (**self).rpush(key, value).await
    }

    async fn lindex(&self, key: &str, index: i64) -> LatchkeyResult<Option<String>> {
        (**self).lindex(key, index).await
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> LatchkeyResult<u64> {
        (**self).lrem(key, count, value).await
    }

    async fn llen(&self, key: &str) -> LatchkeyResult<u64> {
        (**self).llen(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> LatchkeyResult<Vec<String>> {
        (**self).lrange(key, start, stop).await
    }

    async fn run_script(&self, script: &AtomicScript) -> LatchkeyResult<ScriptReply> {
        (**self).run_script(script).await
    }

    async fn ping(&self) -> LatchkeyResult<()> {
        (**self).ping().await
    }
}
