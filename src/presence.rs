//! Presence broadcasting
//!
//! Publishes the full set of online user ids on a single presence topic.
//! Every live connection subscribes to the topic; the registry publishes to it
//! after each successful mutation. There is no delta encoding, so a subscriber
//! that lags simply picks up a later snapshot.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

/// Presence topic capacity
const PRESENCE_CAPACITY: usize = 64;

/// A complete, sorted snapshot of online user ids
pub type OnlineUsers = Arc<Vec<String>>;

/// Presence topic handle. Cloning yields another publisher to the same topic.
#[derive(Debug, Clone)]
pub struct PresenceBroadcaster {
    tx: broadcast::Sender<OnlineUsers>,
}

impl PresenceBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(PRESENCE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a snapshot to every subscriber. Returns the number of receivers.
    pub fn publish(&self, users: OnlineUsers) -> usize {
        let count = users.len();
        match self.tx.send(users) {
            Ok(receivers) => {
                debug!(online = count, receivers, "presence broadcast sent");
                receivers
            }
            Err(_) => {
                debug!(online = count, "no receivers for presence broadcast");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OnlineUsers> {
        self.tx.subscribe()
    }
}

impl Default for PresenceBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
