//! Latchkey Storage - cache tiers and the remote store abstraction
//!
//! - [`cache::LocalStore`]: bounded in-process LRU+TTL store
//! - [`remote::RemoteStore`]: shared store contract, with an in-memory
//!   implementation and a Redis one behind the `redis-backend` feature
//! - [`cache::TwoTierCache`]: read-through/write-through façade over both
//! - [`warmer::CacheWarmer`]: batch pre-loader driving the façade

pub mod cache;
pub mod remote;
pub mod warmer;

pub use cache::{
    CacheEntry, CacheStats, EvictionListener, EvictionReason, KeyPattern, LocalStore,
    SetCondition, TierStats, TtlStatus, TwoTierCache, ValueSerializer,
};
#[cfg(feature = "redis-backend")]
pub use remote::RedisRemoteStore;
pub use remote::{
    AtomicScript, InMemoryRemoteStore, RemoteStore, RowKey, ScriptReply, SharedRemote,
};
pub use warmer::{BatchLoader, CacheWarmer, WarmupReport};
