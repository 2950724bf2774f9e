//! Redis-backed distributed store (L2).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use cachify_core::{CacheError, Result};

use super::CacheStore;

/// Remote KV store over a Redis connection pool.
///
/// TTLs are written with millisecond precision (`PSETEX` semantics); Redis
/// applies them as absolute expiry, so `get` returns absent once expired.
/// Sliding expiration is not supported by this tier and is ignored.
pub struct DistributedStore {
    pool: Pool,
}

impl DistributedStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a store from a Redis URL with the given pool size.
    pub fn from_url(url: &str, pool_size: usize) -> Result<Self> {
        let config = deadpool_redis::Config::from_url(url);
        let pool = config
            .builder()
            .map_err(|e| CacheError::store(format!("invalid Redis config: {e}")))?
            .max_size(pool_size)
            .runtime(deadpool_redis::Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::store(format!("failed to build Redis pool: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Whether a connection can currently be obtained (for health checks).
    pub async fn is_available(&self) -> bool {
        self.pool.get().await.is_ok()
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::store(format!("failed to get Redis connection: {e}")))
    }
}

#[async_trait]
impl CacheStore for DistributedStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection().await?;
        let data: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::store(format!("Redis GET failed: {e}")))?;
        Ok(data.map(Bytes::from))
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        _sliding: Option<Duration>,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                // Floor at 1ms so a sub-millisecond TTL doesn't turn into "no expiry".
                let ttl_ms = ttl.as_millis().max(1) as u64;
                conn.pset_ex::<_, _, ()>(key, value.as_ref(), ttl_ms)
                    .await
                    .map_err(|e| CacheError::store(format!("Redis PSETEX failed: {e}")))?;
            }
            None => {
                conn.set::<_, _, ()>(key, value.as_ref())
                    .await
                    .map_err(|e| CacheError::store(format!("Redis SET failed: {e}")))?;
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::store(format!("Redis DEL failed: {e}")))?;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        DistributedStore::is_available(self).await
    }
}
