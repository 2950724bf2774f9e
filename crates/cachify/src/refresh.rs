//! In-flight refresh task registry.
//!
//! At most one refresh task exists per key at any time. The task's outcome
//! is broadcast over a watch channel so every caller that joined the task
//! observes the same result. The registry entry is removed when the task
//! completes (or is dropped), never before.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;

use cachify_core::CacheError;

/// Shared result of one factory execution.
pub type RefreshOutcome = Result<Bytes, Arc<CacheError>>;

/// Registry of in-flight refresh tasks keyed by cache key.
#[derive(Clone, Default)]
pub struct RefreshRegistry {
    tasks: Arc<DashMap<String, RefreshHandle>>,
}

impl RefreshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight task for `key`, if any.
    pub fn get(&self, key: &str) -> Option<RefreshHandle> {
        self.tasks.get(key).map(|handle| handle.clone())
    }

    /// Register a new task for `key` and return the completion slot plus a
    /// joinable handle.
    ///
    /// The caller must hold the key's stampede lock, which makes it the
    /// single writer of this map entry.
    pub fn begin(&self, key: &str) -> (RefreshCompletion, RefreshHandle) {
        let (tx, rx) = watch::channel(None);
        let handle = RefreshHandle { rx };
        self.tasks.insert(key.to_string(), handle.clone());
        let completion = RefreshCompletion {
            key: key.to_string(),
            tasks: Arc::clone(&self.tasks),
            tx: Some(tx),
        };
        (completion, handle)
    }

    /// Whether a refresh task for `key` is currently in flight.
    pub fn in_flight(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Awaitable view of a refresh task shared by all its callers.
#[derive(Clone)]
pub struct RefreshHandle {
    rx: watch::Receiver<Option<RefreshOutcome>>,
}

impl RefreshHandle {
    /// Wait for the task's outcome.
    pub async fn outcome(mut self) -> RefreshOutcome {
        loop {
            if let Some(outcome) = self.rx.borrow().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // Completion slot dropped without a result: the task died.
                return Err(Arc::new(CacheError::store(
                    "refresh task ended without a result",
                )));
            }
        }
    }
}

/// Write side of one refresh task. Completes exactly once; dropping it
/// unregisters the task either way.
pub struct RefreshCompletion {
    key: String,
    tasks: Arc<DashMap<String, RefreshHandle>>,
    tx: Option<watch::Sender<Option<RefreshOutcome>>>,
}

impl RefreshCompletion {
    /// Publish the outcome to every waiter and unregister the task.
    pub fn complete(mut self, outcome: RefreshOutcome) {
        if let Some(tx) = self.tx.take() {
            // Unregister first so a caller woken by the send that then misses
            // in the cache starts a fresh task instead of re-joining this one.
            self.tasks.remove(&self.key);
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for RefreshCompletion {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.tasks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_task_per_key() {
        let registry = RefreshRegistry::new();
        assert!(registry.get("k").is_none());

        let (_completion, _handle) = registry.begin("k");
        assert!(registry.in_flight("k"));
        assert!(registry.get("k").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_all_joiners_see_same_outcome() {
        let registry = RefreshRegistry::new();
        let (completion, handle) = registry.begin("k");

        let joined = registry.get("k").unwrap();
        let waiter_a = tokio::spawn(handle.outcome());
        let waiter_b = tokio::spawn(joined.outcome());

        completion.complete(Ok(Bytes::from_static(b"value")));

        assert_eq!(waiter_a.await.unwrap().unwrap(), Bytes::from_static(b"value"));
        assert_eq!(waiter_b.await.unwrap().unwrap(), Bytes::from_static(b"value"));
    }

    #[tokio::test]
    async fn test_completion_unregisters_task() {
        let registry = RefreshRegistry::new();
        let (completion, _handle) = registry.begin("k");

        completion.complete(Ok(Bytes::new()));
        assert!(!registry.in_flight("k"));
    }

    #[tokio::test]
    async fn test_outcome_available_after_completion() {
        let registry = RefreshRegistry::new();
        let (completion, handle) = registry.begin("k");

        completion.complete(Ok(Bytes::from_static(b"late")));

        // Joining after completion still observes the result.
        assert_eq!(handle.outcome().await.unwrap(), Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_error_outcome_is_shared() {
        let registry = RefreshRegistry::new();
        let (completion, handle) = registry.begin("k");

        completion.complete(Err(Arc::new(CacheError::store("boom"))));

        let err = handle.outcome().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_dropped_completion_unblocks_waiters() {
        let registry = RefreshRegistry::new();
        let (completion, handle) = registry.begin("k");

        drop(completion);

        let err = handle.outcome().await.unwrap_err();
        assert!(err.to_string().contains("without a result"));
        assert!(!registry.in_flight("k"));
    }
}
