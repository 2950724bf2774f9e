//! Bucketed LRU index over request fingerprints.
//!
//! Entries are bucketed by the four 16-bit bands of their signature (LSH):
//! two signatures agreeing on any band land in a shared bucket and become
//! lookup candidates for each other. Recency and capacity are tracked by an
//! LRU list; every entry appears in exactly four buckets and once in the
//! LRU order.
//!
//! A single coarse lock is adequate: operations touch four buckets and one
//! LRU node.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use time::OffsetDateTime;

use super::simhash::bands;

/// One indexed request.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub cache_key: String,
    pub signature: u64,
    pub token_count: usize,
    pub hash_prefix: u64,
    pub cached_at: OffsetDateTime,
    pub embedding: Option<Vec<f32>>,
}

struct IndexInner {
    entries: LruCache<String, IndexEntry>,
    /// (band position, band value) -> cache keys.
    buckets: HashMap<(u8, u16), HashSet<String>>,
}

impl IndexInner {
    fn unbucket(&mut self, cache_key: &str, signature: u64) {
        for (position, band) in bands(signature).into_iter().enumerate() {
            let slot = (position as u8, band);
            if let Some(keys) = self.buckets.get_mut(&slot) {
                keys.remove(cache_key);
                if keys.is_empty() {
                    self.buckets.remove(&slot);
                }
            }
        }
    }

    fn bucket(&mut self, cache_key: &str, signature: u64) {
        for (position, band) in bands(signature).into_iter().enumerate() {
            self.buckets
                .entry((position as u8, band))
                .or_default()
                .insert(cache_key.to_string());
        }
    }
}

/// Fixed-capacity in-memory similarity index.
pub struct SimilarityIndex {
    inner: Mutex<IndexInner>,
}

impl SimilarityIndex {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(IndexInner {
                entries: LruCache::new(capacity),
                buckets: HashMap::new(),
            }),
        }
    }

    /// Insert or refresh an entry, moving it to the front of the LRU and
    /// evicting the tail when over capacity.
    pub fn add_or_update(&self, entry: IndexEntry) {
        let mut inner = self.inner.lock().expect("similarity index poisoned");

        if let Some(old) = inner.entries.peek(&entry.cache_key) {
            let old_signature = old.signature;
            inner.unbucket(&entry.cache_key, old_signature);
        }
        inner.bucket(&entry.cache_key, entry.signature);

        if let Some((evicted_key, evicted)) = inner.entries.push(entry.cache_key.clone(), entry) {
            // push returns the replaced value on a same-key update (already
            // unbucketed above) or the LRU tail on overflow.
            if !inner.entries.contains(&evicted_key) {
                let signature = evicted.signature;
                inner.unbucket(&evicted_key, signature);
            }
        }
    }

    /// Candidates sharing at least one band with `signature`, up to `max`.
    pub fn candidates(&self, signature: u64, max: usize) -> Vec<IndexEntry> {
        let inner = self.inner.lock().expect("similarity index poisoned");

        let mut keys: HashSet<String> = HashSet::new();
        for (position, band) in bands(signature).into_iter().enumerate() {
            if let Some(bucket) = inner.buckets.get(&(position as u8, band)) {
                keys.extend(bucket.iter().cloned());
            }
        }

        let mut out = Vec::with_capacity(keys.len().min(max));
        for key in keys {
            if out.len() >= max {
                break;
            }
            // peek: candidate scanning must not perturb recency.
            if let Some(entry) = inner.entries.peek(&key) {
                out.push(entry.clone());
            }
        }
        out
    }

    /// Remove an entry from its buckets and the LRU.
    pub fn remove(&self, cache_key: &str) {
        let mut inner = self.inner.lock().expect("similarity index poisoned");
        if let Some(entry) = inner.entries.pop(cache_key) {
            inner.unbucket(cache_key, entry.signature);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("similarity index poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-empty buckets (test observability).
    pub fn bucket_count(&self) -> usize {
        self.inner.lock().expect("similarity index poisoned").buckets.len()
    }
}
