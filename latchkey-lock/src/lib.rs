//! Latchkey Lock - Distributed Coordination Primitives
//!
//! Every primitive keeps its state in a [`latchkey_storage::RemoteStore`] and
//! expresses each check-then-act step as one atomic script, so any number of
//! processes sharing the store coordinate correctly.
//!
//! - [`DistributedMutex`]: exclusive, reentrant, with lease renewal
//! - [`FairLock`]: exclusive with FIFO granting among waiters
//! - [`DowngradableLock`]: reader/writer lock with atomic downgrade
//! - [`PessimisticLock`]: mutex with administrative overrides
//! - [`OptimisticLock`]: versioned compare-and-set
//! - [`RowLock`] / [`TableLock`]: all-or-nothing row batches and table modes
//! - [`Semaphore`]: bounded permits with backoff
//!
//! Use [`Coordinator`] to build them from one configuration.

pub mod coordinator;
pub mod downgrade;
pub mod fair;
pub mod mutex;
pub mod optimistic;
pub mod pessimistic;
pub mod renewal;
pub mod retry;
pub mod row;
pub mod semaphore;
pub mod table;
pub mod traits;

pub use coordinator::Coordinator;
pub use downgrade::DowngradableLock;
pub use fair::FairLock;
pub use mutex::DistributedMutex;
pub use optimistic::{OptimisticLock, Versioned};
pub use pessimistic::PessimisticLock;
pub use renewal::{renewal_period, RenewalHandle};
pub use retry::{retry_until, Deadline, RetryPolicy};
pub use row::RowLock;
pub use semaphore::Semaphore;
pub use table::TableLock;
pub use traits::{with_lock, DistributedLock};
