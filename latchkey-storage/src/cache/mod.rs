//! Cache layer: an in-process LRU+TTL store and the two-tier façade that
//! composes it with a [`RemoteStore`](crate::remote::RemoteStore).
//!
//! Reads consult the local tier first and backfill it on remote hits; writes
//! go to the remote tier first because it is the source of truth shared by
//! every process. A failed remote write fails the whole operation so that no
//! process ever holds a value the others cannot see.
//!
//! # Example
//!
//! ```ignore
//! let cache = TwoTierCache::new(local, remote, &config);
//! cache.set("student:42", &bytes, Some(Duration::from_secs(60))).await?;
//! let hit = cache.get("student:42").await?;
//! ```

pub mod local;
pub mod pattern;
pub mod serializer;
pub mod traits;
pub mod two_tier;

pub use local::{entry_size, CacheEntry, EvictionListener, LocalStore};
pub use pattern::KeyPattern;
pub use serializer::ValueSerializer;
pub use traits::{CacheStats, EvictionReason, SetCondition, TtlStatus};
pub use two_tier::{TierStats, TwoTierCache};
