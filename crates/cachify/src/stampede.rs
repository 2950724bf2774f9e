//! Per-key mutual exclusion for factory execution.
//!
//! Concurrent callers that miss on the same key serialize through one
//! asynchronous lock per key, so at most one of them spawns the refresh
//! task. Lock entries are removed from the map as soon as nobody waits on
//! them, keeping the map bounded by the number of keys currently under
//! contention.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide map of per-key async locks.
///
/// Acquisition order per key is FIFO (tokio's `Mutex` queues waiters
/// fairly). A caller cancelled while waiting leaves the queue without ever
/// holding the lock.
#[derive(Clone, Default)]
pub struct StampedeGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl StampedeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind earlier callers.
    pub async fn acquire(&self, key: &str) -> KeySlot {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let permit = lock.lock_owned().await;
        KeySlot {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            _permit: permit,
        }
    }

    /// Number of keys currently tracked (contended or just released).
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive hold on one key's lock. Dropping it releases the lock and
/// removes the map entry when no other caller holds or awaits it.
pub struct KeySlot {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        // Two strong refs mean the map entry plus our own permit: no other
        // holder, no waiter. Waiters cloned the Arc before locking, so their
        // presence keeps the count above two and the entry alive. Removing
        // before the permit itself drops keeps latecomers from locking a map
        // entry that is about to vanish.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_exclusive_per_key() {
        let guard = StampedeGuard::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _slot = guard.acquire("k").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let guard = StampedeGuard::new();
        let _a = guard.acquire("a").await;
        // Would deadlock if "b" shared "a"'s lock.
        let _b = guard.acquire("b").await;
        assert_eq!(guard.len(), 2);
    }

    #[tokio::test]
    async fn test_entry_removed_when_no_waiters() {
        let guard = StampedeGuard::new();
        {
            let _slot = guard.acquire("k").await;
            assert_eq!(guard.len(), 1);
        }
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn test_entry_survives_while_contended() {
        let guard = StampedeGuard::new();
        let slot = guard.acquire("k").await;

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _slot = guard.acquire("k").await;
            })
        };
        // Let the waiter enqueue.
        tokio::time::sleep(Duration::from_millis(5)).await;

        drop(slot);
        waiter.await.unwrap();
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_slot() {
        let guard = StampedeGuard::new();
        let slot = guard.acquire("k").await;

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _slot = guard.acquire("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(slot);
        assert!(guard.is_empty());
    }
}
