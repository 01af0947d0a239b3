//! Pub/Sub backend abstraction
//!
//! Carries persisted messages from the persistence collaborator (possibly in
//! another process) to this node's message router.
//!
//! # Features
//!
//! Exactly one backend must be enabled at compile time:
//!
//! - `memory` - In-process broadcast. Nothing outside the process can publish
//!   to it, so the binary starts no listener; it is a hook for embedders that
//!   share one `MemoryPubSub` with their own persistence code, and for tests
//! - `postgres` - PostgreSQL LISTEN/NOTIFY, published to by the collaborator

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresPubSub;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryPubSub;

use async_trait::async_trait;
use tracing::warn;

use crate::events::ChatMessage;
use crate::router::MessageRouter;

/// Pub/Sub backend trait
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload to a stream
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()>;

    /// Start receiving payloads published to `stream`
    async fn subscribe(&self, stream: &str) -> anyhow::Result<()>;

    /// Stop receiving payloads published to `stream`
    async fn unsubscribe(&self, stream: &str) -> anyhow::Result<()>;

    /// Run the listener loop, invoking `callback(stream, payload)` for each
    /// payload on a subscribed stream. Spawn this as a background task.
    async fn listen<F>(&self, callback: F) -> anyhow::Result<()>
    where
        F: Fn(String, Vec<u8>) + Send + Sync + 'static;
}

/// Decode a delivery payload and hand it to the router.
///
/// Malformed payloads are logged and skipped.
pub fn dispatch_delivery(router: &MessageRouter, stream: &str, payload: &[u8]) {
    match serde_json::from_slice::<ChatMessage>(payload) {
        Ok(message) => {
            router.deliver(message);
        }
        Err(e) => {
            warn!(stream, error = %e, "skipping malformed delivery payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::events::ServerEvent;
    use crate::hub::Hub;
    use crate::presence::PresenceBroadcaster;
    use crate::registry::ConnectionRegistry;
    use crate::session::Session;

    fn online_receiver() -> (MessageRouter, mpsc::Receiver<ServerEvent>) {
        let presence = PresenceBroadcaster::new();
        let registry = Arc::new(ConnectionRegistry::new(presence.clone()));
        let hub = Arc::new(Hub::new(presence));
        let (tx, rx) = mpsc::channel(8);
        let conn_id = hub.next_conn_id();
        hub.add_session(Session::new(conn_id, Some("u1".to_string()), tx));
        registry.register("u1", conn_id);
        (MessageRouter::new(registry, hub), rx)
    }

    fn new_messages(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::NewMessage(message) = event {
                messages.push(message);
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_dispatch_valid_payload() {
        let (router, mut rx) = online_receiver();
        dispatch_delivery(
            &router,
            "new_message",
            br#"{"senderId":"u2","receiverId":"u1","message":"hi"}"#,
        );

        let messages = new_messages(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, "u2");
    }

    #[tokio::test]
    async fn test_dispatch_malformed_payload_is_skipped() {
        let (router, mut rx) = online_receiver();
        dispatch_delivery(&router, "new_message", b"not json");
        dispatch_delivery(&router, "new_message", br#"{"receiverId":"u1"}"#);

        assert!(new_messages(&mut rx).is_empty());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_memory_ingest_reaches_receiver() {
        let (router, mut rx) = online_receiver();
        let pubsub = MemoryPubSub::new();
        pubsub.subscribe("new_message").await.unwrap();

        let listener = pubsub.clone();
        let handle = tokio::spawn(async move {
            let _ = listener
                .listen(move |stream, payload| dispatch_delivery(&router, &stream, &payload))
                .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        pubsub
            .publish("new_message", br#"{"senderId":"u2","receiverId":"u1"}"#)
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(ServerEvent::NewMessage(message)) = rx.recv().await {
                    return message;
                }
            }
        })
        .await
        .expect("message not delivered");
        assert_eq!(message.receiver_id, "u1");

        handle.abort();
    }
}
