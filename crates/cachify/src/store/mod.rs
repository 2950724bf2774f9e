//! Cache storage tiers.
//!
//! Both tiers implement the same byte-value [`CacheStore`] contract; L1 vs.
//! L2 is decided at composition time, not by type. [`MemoryStore`] is the
//! in-process tier, [`DistributedStore`] the Redis-backed one.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::DistributedStore;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use cachify_core::Result;

/// Byte-value KV store with per-entry TTL.
///
/// Implementations apply TTL independently; no atomicity across keys is
/// assumed. `sliding` asks the store to push the expiry forward on every
/// hit; stores that cannot honor it may ignore it.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        sliding: Option<Duration>,
    ) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Number of entries, for stores that can count them cheaply.
    fn entry_count(&self) -> Option<usize> {
        None
    }

    /// Whether the store can currently serve requests (for health checks).
    async fn is_available(&self) -> bool {
        true
    }
}
