//! In-memory pub/sub backend using tokio::sync::broadcast
//!
//! Single-process only. Publishers and the listener must share the same
//! `MemoryPubSub` (clone it; clones share one bus).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::pubsub::PubSub;

/// Default buffer size for the bus
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// In-memory pub/sub
///
/// All streams share one broadcast bus; the listener filters by its current
/// subscriptions. Lagging listeners lose payloads, which is acceptable for
/// best-effort delivery.
#[derive(Clone)]
pub struct MemoryPubSub {
    bus: broadcast::Sender<(String, Vec<u8>)>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (bus, _) = broadcast::channel(buffer_size);
        Self {
            bus,
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn is_subscribed(&self, stream: &str) -> bool {
        self.subscriptions.read().await.contains(stream)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()> {
        // Err only means nobody is listening; fire and forget
        if self.bus.send((stream.to_string(), payload.to_vec())).is_err() {
            debug!(stream, "no listener for publish");
        }
        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> anyhow::Result<()> {
        self.subscriptions.write().await.insert(stream.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, stream: &str) -> anyhow::Result<()> {
        self.subscriptions.write().await.remove(stream);
        Ok(())
    }

    async fn listen<F>(&self, callback: F) -> anyhow::Result<()>
    where
        F: Fn(String, Vec<u8>) + Send + Sync + 'static,
    {
        let mut rx = self.bus.subscribe();

        loop {
            match rx.recv().await {
                Ok((stream, payload)) => {
                    if self.subscriptions.read().await.contains(&stream) {
                        callback(stream, payload);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "pub/sub listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let pubsub = MemoryPubSub::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        pubsub.subscribe("new_message").await.unwrap();

        let listener = pubsub.clone();
        let sink = received.clone();
        let handle = tokio::spawn(async move {
            let _ = listener
                .listen(move |stream, payload| {
                    sink.lock().unwrap().push((stream, payload));
                })
                .await;
        });

        // Give listener time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        pubsub.publish("new_message", b"hello").await.unwrap();
        pubsub.publish("other", b"ignored").await.unwrap();
        pubsub.publish("new_message", b"world").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = received.lock().unwrap().clone();
        assert_eq!(
            received,
            vec![
                ("new_message".to_string(), b"hello".to_vec()),
                ("new_message".to_string(), b"world".to_vec()),
            ]
        );

        handle.abort();
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let pubsub = MemoryPubSub::new();

        pubsub.subscribe("new_message").await.unwrap();
        assert!(pubsub.is_subscribed("new_message").await);

        pubsub.unsubscribe("new_message").await.unwrap();
        assert!(!pubsub.is_subscribed("new_message").await);
    }

    #[tokio::test]
    async fn test_publish_without_listener() {
        let pubsub = MemoryPubSub::default();
        assert!(pubsub.publish("new_message", b"x").await.is_ok());
    }
}
