//! Factory for every coordination primitive.
//!
//! A `Coordinator` is built once from the process configuration and the
//! shared remote store, then hands out locks that all agree on the key
//! namespace and lock settings.

use crate::downgrade::DowngradableLock;
use crate::fair::FairLock;
use crate::mutex::DistributedMutex;
use crate::optimistic::OptimisticLock;
use crate::pessimistic::PessimisticLock;
use crate::row::RowLock;
use crate::semaphore::Semaphore;
use crate::table::TableLock;
use latchkey_core::{KeySpace, LatchkeyConfig, LockConfig, SemaphoreConfig};
use latchkey_storage::SharedRemote;

#[derive(Clone)]
pub struct Coordinator {
    remote: SharedRemote,
    keys: KeySpace,
    lock: LockConfig,
    semaphore: SemaphoreConfig,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("keys", &self.keys)
            .field("lock", &self.lock)
            .field("semaphore", &self.semaphore)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(remote: SharedRemote, config: &LatchkeyConfig) -> Self {
        Self {
            remote,
            keys: KeySpace::new(config.namespace.clone()),
            lock: config.lock.clone(),
            semaphore: config.semaphore.clone(),
        }
    }

    /// Override the lock settings used by primitives built afterwards.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn remote(&self) -> &SharedRemote {
        &self.remote
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn mutex(&self, resource: &str) -> DistributedMutex {
        DistributedMutex::new(self.remote.clone(), &self.keys, resource, self.lock.clone())
    }

    pub fn fair(&self, resource: &str) -> FairLock {
        FairLock::new(self.remote.clone(), &self.keys, resource, self.lock.clone())
    }

    pub fn downgradable(&self, resource: &str) -> DowngradableLock {
        DowngradableLock::new(self.remote.clone(), &self.keys, resource, self.lock.clone())
    }

    pub fn pessimistic(&self, resource: &str) -> PessimisticLock {
        PessimisticLock::new(self.remote.clone(), &self.keys, resource, self.lock.clone())
    }

    pub fn optimistic(&self) -> OptimisticLock {
        OptimisticLock::new(self.remote.clone(), self.keys.clone())
    }

    pub fn rows(&self) -> RowLock {
        RowLock::new(self.remote.clone(), self.keys.clone(), &self.lock)
    }

    pub fn table(&self) -> TableLock {
        TableLock::new(self.remote.clone(), self.keys.clone(), &self.lock)
    }

    /// Semaphore with the configured permit count.
    pub fn semaphore(&self, name: &str) -> Semaphore {
        Semaphore::new(self.remote.clone(), &self.keys, name, self.semaphore.clone())
    }

    /// Semaphore with an explicit permit count.
    pub fn semaphore_with_count(&self, name: &str, count: u32) -> Semaphore {
        let config = SemaphoreConfig {
            count,
            ..self.semaphore.clone()
        };
        Semaphore::new(self.remote.clone(), &self.keys, name, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{with_lock, DistributedLock};
    use latchkey_core::LatchkeyError;
    use latchkey_storage::{InMemoryRemoteStore, RemoteStore};
    use std::sync::Arc;

    fn coordinator() -> (Coordinator, Arc<InMemoryRemoteStore>) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = LatchkeyConfig {
            namespace: "school".to_string(),
            ..LatchkeyConfig::default()
        };
        (Coordinator::new(remote.clone(), &config), remote)
    }

    #[tokio::test]
    async fn test_primitives_share_namespace() {
        let (coord, remote) = coordinator();
        let mutex = coord.mutex("report");
        assert!(mutex.try_acquire().await.unwrap());
        assert!(remote.exists("school:lock:report").await.unwrap());

        let rows = coord.rows();
        rows.lock_rows("grades", &["1"]).await.unwrap();
        assert!(remote.exists("school:row_lock:grades:1").await.unwrap());

        let sem = coord.semaphore_with_count("exports", 3);
        assert_eq!(sem.count(), 3);
        assert!(sem.try_acquire().await.unwrap());
        assert_eq!(sem.available().await.unwrap(), 2);
        mutex.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let (coord, _) = coordinator();
        let lock = coord.pessimistic("import");

        let result: Result<(), LatchkeyError> = with_lock(&lock, None, || async {
            Err(latchkey_core::LockError::InvalidState {
                resource: "import".into(),
                reason: "bad row".into(),
            }
            .into())
        })
        .await;
        assert!(result.is_err());
        assert!(!lock.is_locked().await.unwrap());

        let value = with_lock(&lock, None, || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!lock.is_locked().await.unwrap());
    }
}
