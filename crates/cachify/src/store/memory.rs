//! In-process memory store (L1).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use time::OffsetDateTime;

use cachify_core::{Clock, Result, SharedClock, SystemClock};

use super::CacheStore;

#[derive(Clone, Debug)]
struct StoredEntry {
    data: Bytes,
    expires_at: Option<OffsetDateTime>,
    sliding: Option<Duration>,
}

impl StoredEntry {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// In-memory KV store backed by a concurrent map.
///
/// Expiry is checked on read against the injected clock; expired entries are
/// dropped lazily on access. Entries with a sliding window get their expiry
/// pushed forward on every hit.
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live (possibly expired, not yet collected) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove every entry whose TTL has passed.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = self.clock.now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            if let Some(window) = entry.sliding {
                entry.expires_at = Some(now + window);
            }
            return Ok(Some(entry.data.clone()));
        }

        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        sliding: Option<Duration>,
    ) -> Result<()> {
        let now = self.clock.now();
        let expires_at = ttl.map(|ttl| now + ttl);
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                data: value,
                expires_at,
                sliding,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn entry_count(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}
