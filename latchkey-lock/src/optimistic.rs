//! Optimistic concurrency over versioned values.
//!
//! Nothing blocks here. Each value has a companion version counter; a write
//! succeeds only against the version it was read at and bumps it by one.
//! Callers that lose the race get [`LockError::VersionConflict`] and re-read.
//!
//! Versions only ever grow. Deleting a value bumps its version and the
//! counter never expires, so a reader holding an old version can never
//! match again.

use latchkey_core::{KeySpace, LatchkeyResult, LockError};
use latchkey_storage::{AtomicScript, SharedRemote};
use std::future::Future;
use std::time::Duration;

/// A value read together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Option<Vec<u8>>,
    /// Zero for a key that was never written.
    pub version: i64,
}

#[derive(Clone)]
pub struct OptimisticLock {
    remote: SharedRemote,
    keys: KeySpace,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for OptimisticLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticLock")
            .field("namespace", &self.keys.namespace())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl OptimisticLock {
    pub fn new(remote: SharedRemote, keys: KeySpace) -> Self {
        Self {
            remote,
            keys,
            ttl: None,
        }
    }

    /// Expire the value after `ttl` from the last write. The version is
    /// kept.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub async fn get_with_version(&self, key: &str) -> LatchkeyResult<Versioned> {
        let script = AtomicScript::VersionedGet {
            key: self.keys.key(key),
            version_key: self.keys.version(key),
        };
        let (value, version) = self
            .remote
            .run_script(&script)
            .await?
            .into_versioned(script.name())?;
        Ok(Versioned { value, version })
    }

    pub async fn version(&self, key: &str) -> LatchkeyResult<i64> {
        Ok(self.get_with_version(key).await?.version)
    }

    /// Store `value` if the version is still `expected`. Returns the new
    /// version.
    pub async fn compare_and_set(
        &self,
        key: &str,
        value: &[u8],
        expected: i64,
    ) -> LatchkeyResult<i64> {
        let script = AtomicScript::CompareAndSetVersion {
            key: self.keys.key(key),
            version_key: self.keys.version(key),
            value: value.to_vec(),
            expected,
            ttl: self.ttl,
        };
        let version = self
            .remote
            .run_script(&script)
            .await?
            .into_int(script.name())?;
        if version < 0 {
            tracing::debug!(key, expected, "Version conflict");
            return Err(LockError::VersionConflict {
                key: key.to_string(),
                expected,
            }
            .into());
        }
        Ok(version)
    }

    /// Remove the value. The version still advances, so writers must re-read
    /// before recreating it.
    pub async fn delete(&self, key: &str) -> LatchkeyResult<bool> {
        let script = AtomicScript::DeleteVersioned {
            key: self.keys.key(key),
            version_key: self.keys.version(key),
        };
        let removed = self
            .remote
            .run_script(&script)
            .await?
            .into_int(script.name())?;
        Ok(removed > 0)
    }

    /// Read-modify-write loop. `f` maps the current value to the new one and
    /// is re-run after every conflict, up to `max_attempts` times in total.
    /// Returns the final version.
    pub async fn update_with_retry<F, Fut>(
        &self,
        key: &str,
        max_attempts: u32,
        mut f: F,
    ) -> LatchkeyResult<i64>
    where
        F: FnMut(Option<Vec<u8>>) -> Fut,
        Fut: Future<Output = LatchkeyResult<Vec<u8>>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let current = self.get_with_version(key).await?;
            let next = f(current.value).await?;
            match self.compare_and_set(key, &next, current.version).await {
                Ok(version) => return Ok(version),
                Err(e) if e.is_version_conflict() && attempt < max_attempts => {
                    tracing::debug!(key, attempt, "Retrying after version conflict");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_storage::{InMemoryRemoteStore, RemoteStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn lock() -> (OptimisticLock, Arc<InMemoryRemoteStore>) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        (OptimisticLock::new(remote.clone(), KeySpace::new("t")), remote)
    }

    #[tokio::test]
    async fn test_version_starts_at_zero_and_increments() {
        let (opt, _) = lock();
        let v = opt.get_with_version("student:7").await.unwrap();
        assert_eq!(v, Versioned { value: None, version: 0 });

        assert_eq!(opt.compare_and_set("student:7", b"a", 0).await.unwrap(), 1);
        assert_eq!(opt.compare_and_set("student:7", b"b", 1).await.unwrap(), 2);
        let v = opt.get_with_version("student:7").await.unwrap();
        assert_eq!(v.value.as_deref(), Some(&b"b"[..]));
        assert_eq!(v.version, 2);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let (opt, _) = lock();
        opt.compare_and_set("k", b"a", 0).await.unwrap();
        let err = opt.compare_and_set("k", b"b", 0).await.unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(opt.version("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_with_retry_rereads_after_conflict() {
        let (opt, _) = lock();
        opt.compare_and_set("counter", b"1", 0).await.unwrap();

        let calls = AtomicU32::new(0);
        let racer = opt.clone();
        let version = opt
            .update_with_retry("counter", 3, |current| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let racer = racer.clone();
                async move {
                    if n == 0 {
                        // another writer slips in between read and write
                        racer.compare_and_set("counter", b"5", 1).await?;
                    }
                    let value: u32 = current
                        .and_then(|v| String::from_utf8(v).ok())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    Ok((value + 1).to_string().into_bytes())
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(version, 3);
        let v = opt.get_with_version("counter").await.unwrap();
        assert_eq!(v.value.as_deref(), Some(&b"6"[..]));
    }

    #[tokio::test]
    async fn test_update_gives_up_after_max_attempts() {
        let (opt, _) = lock();
        let racer = opt.clone();
        let err = opt
            .update_with_retry("k", 2, |_| {
                let racer = racer.clone();
                async move {
                    let v = racer.version("k").await?;
                    racer.compare_and_set("k", b"x", v).await?;
                    Ok(b"mine".to_vec())
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn test_delete_advances_version() {
        let (opt, remote) = lock();
        opt.compare_and_set("k", b"a", 0).await.unwrap();
        assert!(opt.delete("k").await.unwrap());
        assert!(remote.exists("t:k:version").await.unwrap());

        let v = opt.get_with_version("k").await.unwrap();
        assert_eq!(v, Versioned { value: None, version: 2 });
        assert!(!opt.delete("k").await.unwrap());
        assert_eq!(opt.version("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_reader_conflicts_after_delete_and_recreate() {
        let (opt, _) = lock();
        assert_eq!(opt.compare_and_set("k", b"a", 0).await.unwrap(), 1);
        let stale = opt.get_with_version("k").await.unwrap();
        assert_eq!(stale.version, 1);

        opt.delete("k").await.unwrap();
        assert!(opt.compare_and_set("k", b"b", 0).await.unwrap_err().is_version_conflict());
        let fresh = opt.version("k").await.unwrap();
        assert_eq!(opt.compare_and_set("k", b"b", fresh).await.unwrap(), 3);

        let err = opt
            .compare_and_set("k", b"stale", stale.version)
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
        let v = opt.get_with_version("k").await.unwrap();
        assert_eq!(v.value.as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_value_but_keeps_version() {
        let (opt, remote) = lock();
        let opt = opt.with_ttl(Duration::from_secs(5));
        opt.compare_and_set("k", b"a", 0).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let v = opt.get_with_version("k").await.unwrap();
        assert_eq!(v, Versioned { value: None, version: 1 });
        assert!(opt.compare_and_set("k", b"b", 0).await.unwrap_err().is_version_conflict());
        assert_eq!(opt.compare_and_set("k", b"b", 1).await.unwrap(), 2);
        assert!(remote.exists("t:k").await.unwrap());
    }
}
