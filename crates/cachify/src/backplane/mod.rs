//! Cross-instance cache invalidation over a pub/sub backplane.
//!
//! One [`Backplane`] per process publishes invalidations for every local
//! `set`/`remove` and evicts L1 entries when peers publish theirs. Delivery
//! is best-effort: publish failures are logged and never fail the primary
//! cache operation.
//!
//! ## Example Flow
//!
//! ```text
//! Instance 1: cache.set("user:1", ...)
//!   |
//! channel: {"v":1,"src":"i1","key":"user:1"}
//!   |
//! Instance 2: handler removes "user:1" + "user:1:meta" from L1
//! Instance 3: handler removes "user:1" + "user:1:meta" from L1
//! ```
//!
//! Messages whose `src` matches the local instance id are always ignored;
//! that check is the only defense against the transport echoing a message
//! back to its publisher.

mod message;
mod transport;

pub use message::{Invalidation, InvalidationItem, InvalidationMessage, WIRE_VERSION};
pub use transport::{BackplaneTransport, LocalTransport, RedisTransport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use cachify_core::{CacheError, Result};

use crate::config::BackplaneConfig;
use crate::metrics;

/// Delay before re-subscribing after the pub/sub connection drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Callback invoked for each received invalidation.
pub type InvalidationHandler =
    Arc<dyn Fn(Invalidation) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct BackplaneInner {
    transport: Arc<dyn BackplaneTransport>,
    channel: String,
    instance_id: String,
    batch_size: usize,
    batch_window: Duration,
    pending: Mutex<Vec<Invalidation>>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    flush_gate: tokio::sync::Mutex<()>,
    handlers: RwLock<Vec<InvalidationHandler>>,
    dispatch_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Publisher and subscriber sides of the invalidation channel. Cheap to
/// clone; clones share the queue, handlers, and subscription.
#[derive(Clone)]
pub struct Backplane {
    inner: Arc<BackplaneInner>,
}

impl Backplane {
    /// Build a backplane over the given transport.
    ///
    /// The instance id comes from the config or a fresh UUID.
    pub fn new(transport: Arc<dyn BackplaneTransport>, config: &BackplaneConfig) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BackplaneInner {
                transport,
                channel: config.channel_name.clone(),
                instance_id,
                batch_size: config.batch_size,
                batch_window: config.batch_window,
                pending: Mutex::new(Vec::new()),
                flush_timer: Mutex::new(None),
                flush_gate: tokio::sync::Mutex::new(()),
                handlers: RwLock::new(Vec::new()),
                dispatch_started: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// This process's publisher identity.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Publish a key invalidation.
    pub async fn publish_key(&self, key: impl Into<String>) -> Result<()> {
        self.publish(Invalidation::Key(key.into())).await
    }

    /// Publish a tag invalidation.
    pub async fn publish_tag(&self, tag: impl Into<String>) -> Result<()> {
        self.publish(Invalidation::Tag(tag.into())).await
    }

    /// Publish one invalidation, batched or immediate per configuration.
    pub async fn publish(&self, invalidation: Invalidation) -> Result<()> {
        if self.inner.batch_size == 0 {
            let message = InvalidationMessage::single(&self.inner.instance_id, &invalidation);
            self.send(message, 1).await
        } else {
            self.enqueue(invalidation).await
        }
    }

    async fn enqueue(&self, invalidation: Invalidation) -> Result<()> {
        let flush_now = {
            let mut pending = self.inner.pending.lock().expect("backplane queue poisoned");
            pending.push(invalidation);
            pending.len() >= self.inner.batch_size
        };

        if flush_now {
            self.flush().await
        } else {
            self.schedule_flush();
            Ok(())
        }
    }

    /// Start the single-shot flush timer if none is running.
    fn schedule_flush(&self) {
        let mut timer = self
            .inner
            .flush_timer
            .lock()
            .expect("backplane timer poisoned");
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let backplane = self.clone();
        let window = self.inner.batch_window;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Dispose our own handle first so flush() never aborts the task
            // that is running it.
            backplane
                .inner
                .flush_timer
                .lock()
                .expect("backplane timer poisoned")
                .take();
            if let Err(e) = backplane.flush().await {
                tracing::warn!(error = %e, "backplane batch flush failed");
            }
        }));
    }

    /// Drain the queue into one batched message.
    ///
    /// Serialized by a non-reentrant gate so overlapping triggers (size
    /// threshold, timer, shutdown) cannot interleave sends.
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.inner.flush_gate.lock().await;

        let drained = {
            let mut pending = self.inner.pending.lock().expect("backplane queue poisoned");
            std::mem::take(&mut *pending)
        };
        {
            let mut timer = self
                .inner
                .flush_timer
                .lock()
                .expect("backplane timer poisoned");
            if let Some(timer) = timer.take() {
                timer.abort();
            }
        }

        if drained.is_empty() {
            return Ok(());
        }

        let count = drained.len();
        let message = InvalidationMessage::batch(&self.inner.instance_id, &drained);
        self.send(message, count).await
    }

    async fn send(&self, message: InvalidationMessage, items: usize) -> Result<()> {
        let payload = message.encode()?;
        self.inner
            .transport
            .publish(&self.inner.channel, payload)
            .await?;
        metrics::record_backplane_published(items);
        tracing::debug!(channel = %self.inner.channel, items, "backplane message published");
        Ok(())
    }

    /// Register an invalidation handler.
    ///
    /// The channel subscription is created lazily when the first handler
    /// attaches.
    pub fn register_handler(&self, handler: InvalidationHandler) {
        self.inner
            .handlers
            .write()
            .expect("backplane handlers poisoned")
            .push(handler);

        if !self.inner.dispatch_started.swap(true, Ordering::SeqCst) {
            self.spawn_dispatch();
        }
    }

    fn spawn_dispatch(&self) {
        let backplane = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match backplane
                    .inner
                    .transport
                    .subscribe(&backplane.inner.channel)
                    .await
                {
                    Ok(mut stream) => {
                        tracing::info!(channel = %backplane.inner.channel, "backplane subscribed");
                        loop {
                            tokio::select! {
                                received = stream.next() => match received {
                                    Some(payload) => backplane.dispatch(&payload).await,
                                    None => break,
                                },
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        return;
                                    }
                                }
                            }
                        }
                        tracing::warn!(channel = %backplane.inner.channel, "backplane subscription closed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "backplane subscription failed");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Parse one received payload and deliver it to every handler.
    async fn dispatch(&self, payload: &str) {
        let message = match InvalidationMessage::parse(payload) {
            Ok(message) => message,
            Err(CacheError::WireVersion(version)) => {
                metrics::record_backplane_dropped("version");
                tracing::debug!(version, "dropped backplane message with foreign wire version");
                return;
            }
            Err(e) => {
                metrics::record_backplane_dropped("malformed");
                tracing::warn!(error = %e, "dropped malformed backplane message");
                return;
            }
        };

        if message.src == self.inner.instance_id {
            tracing::trace!("ignoring own backplane message");
            return;
        }
        metrics::record_backplane_received();

        let handlers: Vec<InvalidationHandler> = self
            .inner
            .handlers
            .read()
            .expect("backplane handlers poisoned")
            .clone();

        for invalidation in message.invalidations() {
            if let Invalidation::Tag(tag) = &invalidation {
                metrics::record_backplane_tag_event();
                tracing::debug!(tag = %tag, src = %message.src, "tag invalidation received");
            }
            for handler in &handlers {
                if let Err(e) = handler(invalidation.clone()).await {
                    tracing::warn!(error = %e, "backplane handler failed");
                }
            }
        }
    }

    /// Stop the dispatch loop and drain any batched items once.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "backplane shutdown flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(batch_size: usize) -> BackplaneConfig {
        BackplaneConfig {
            enabled: true,
            instance_id: Some("node-a".to_string()),
            batch_size,
            batch_window: Duration::from_millis(20),
            ..BackplaneConfig::default()
        }
    }

    fn collector(backplane: &Backplane) -> Arc<std::sync::Mutex<Vec<Invalidation>>> {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        backplane.register_handler(Arc::new(move |inv| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(inv);
                Ok(())
            })
        }));
        seen
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_peer_receives_key_invalidation() {
        let transport = LocalTransport::new();
        let a = Backplane::new(Arc::new(transport.clone()), &config(0));
        let b = Backplane::new(
            Arc::new(transport),
            &BackplaneConfig {
                instance_id: Some("node-b".to_string()),
                ..config(0)
            },
        );
        let seen = collector(&b);
        settle().await;

        a.publish_key("user:1").await.unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Invalidation::Key("user:1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_own_messages_are_suppressed() {
        let transport = LocalTransport::new();
        let a = Backplane::new(Arc::new(transport), &config(0));
        let seen = collector(&a);
        settle().await;

        a.publish_key("user:1").await.unwrap();
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_flushes_on_size() {
        let transport = LocalTransport::new();
        let a = Backplane::new(Arc::new(transport.clone()), &config(2));
        let b = Backplane::new(
            Arc::new(transport),
            &BackplaneConfig {
                instance_id: Some("node-b".to_string()),
                ..config(0)
            },
        );
        let seen = collector(&b);
        settle().await;

        a.publish_key("k1").await.unwrap();
        a.publish_key("k2").await.unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_flushes_on_window() {
        let transport = LocalTransport::new();
        let a = Backplane::new(Arc::new(transport.clone()), &config(100));
        let b = Backplane::new(
            Arc::new(transport),
            &BackplaneConfig {
                instance_id: Some("node-b".to_string()),
                ..config(0)
            },
        );
        let seen = collector(&b);
        settle().await;

        a.publish_key("k1").await.unwrap();
        // Below the size threshold: only the window timer can flush.
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Invalidation::Key("k1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending() {
        let transport = LocalTransport::new();
        let a = Backplane::new(
            Arc::new(transport.clone()),
            &BackplaneConfig {
                batch_window: Duration::from_secs(3600),
                ..config(100)
            },
        );
        let b = Backplane::new(
            Arc::new(transport),
            &BackplaneConfig {
                instance_id: Some("node-b".to_string()),
                ..config(0)
            },
        );
        let seen = collector(&b);
        settle().await;

        a.publish_key("k1").await.unwrap();
        a.shutdown().await;
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_halt_delivery() {
        let transport = LocalTransport::new();
        let a = Backplane::new(Arc::new(transport.clone()), &config(0));
        let b = Backplane::new(
            Arc::new(transport),
            &BackplaneConfig {
                instance_id: Some("node-b".to_string()),
                ..config(0)
            },
        );
        b.register_handler(Arc::new(|_| {
            Box::pin(async { Err(CacheError::store("handler exploded")) })
        }));
        let seen = collector(&b);
        settle().await;

        a.publish_key("k1").await.unwrap();
        settle().await;

        // The failing handler ran first; the collector still got the event.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tag_invalidations_are_delivered() {
        let transport = LocalTransport::new();
        let a = Backplane::new(Arc::new(transport.clone()), &config(0));
        let b = Backplane::new(
            Arc::new(transport),
            &BackplaneConfig {
                instance_id: Some("node-b".to_string()),
                ..config(0)
            },
        );
        let seen = collector(&b);
        settle().await;

        a.publish_tag("users").await.unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Invalidation::Tag("users".to_string())]
        );
    }
}
