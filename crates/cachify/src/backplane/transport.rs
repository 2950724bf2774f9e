//! Pub/sub transports for the backplane.
//!
//! Delivery is best-effort, at-most-once, unordered. [`RedisTransport`] is
//! the production channel; [`LocalTransport`] is an in-process loopback for
//! tests and single-process wiring.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use futures_util::stream::{self, BoxStream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::broadcast;

use cachify_core::{CacheError, Result};

/// A best-effort pub/sub channel.
///
/// `subscribe` yields a stream of raw payloads that ends when the underlying
/// connection is lost; the subscriber side re-subscribes as needed.
#[async_trait]
pub trait BackplaneTransport: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

/// Redis pub/sub transport.
///
/// Publishing goes through the shared pool; each subscription opens a
/// dedicated connection, as pub/sub connections cannot multiplex commands.
pub struct RedisTransport {
    pool: Pool,
    url: String,
}

impl RedisTransport {
    pub fn new(pool: Pool, url: impl Into<String>) -> Self {
        Self {
            pool,
            url: url.into(),
        }
    }
}

#[async_trait]
impl BackplaneTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::backplane(format!("failed to get Redis connection: {e}")))?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| CacheError::backplane(format!("Redis PUBLISH failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| CacheError::backplane(format!("failed to create Redis client: {e}")))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::backplane(format!("failed to open pub/sub: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CacheError::backplane(format!("failed to subscribe: {e}")))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}

/// In-process loopback transport over tokio broadcast channels.
///
/// Clones share the channel table, so two cache instances wired to clones
/// of one `LocalTransport` see each other's messages.
#[derive(Clone, Default)]
pub struct LocalTransport {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

/// Buffered messages per channel before slow receivers start lagging.
const LOCAL_CHANNEL_CAPACITY: usize = 256;

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl BackplaneTransport for LocalTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // No receivers is fine: best-effort delivery.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self.sender(channel).subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    // Dropped messages are acceptable; keep reading.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_transport_delivers_to_subscriber() {
        let transport = LocalTransport::new();
        let mut stream = transport.subscribe("ch").await.unwrap();

        transport.publish("ch", "hello".to_string()).await.unwrap();
        assert_eq!(stream.next().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_local_transport_clones_share_channels() {
        let transport = LocalTransport::new();
        let peer = transport.clone();
        let mut stream = peer.subscribe("ch").await.unwrap();

        transport.publish("ch", "x".to_string()).await.unwrap();
        assert_eq!(stream.next().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_local_transport_channels_are_isolated() {
        let transport = LocalTransport::new();
        let mut a = transport.subscribe("a").await.unwrap();

        transport.publish("b", "for-b".to_string()).await.unwrap();
        transport.publish("a", "for-a".to_string()).await.unwrap();
        assert_eq!(a.next().await.unwrap(), "for-a");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let transport = LocalTransport::new();
        transport.publish("ch", "void".to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let transport = LocalTransport::new();
        let mut a = transport.subscribe("ch").await.unwrap();
        let mut b = transport.subscribe("ch").await.unwrap();

        transport.publish("ch", "fanout".to_string()).await.unwrap();
        assert_eq!(a.next().await.unwrap(), "fanout");
        assert_eq!(b.next().await.unwrap(), "fanout");
    }
}
