//! Client subscription adapter
//!
//! The client-side counterpart of the presence and delivery events:
//! [`ClientState`] folds events into local UI state, and [`Subscriber`] holds
//! a live connection and yields decoded events.

use std::collections::{HashMap, HashSet};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::events::{self, ChatMessage, ServerEvent};

/// Local view of presence and incoming messages
#[derive(Debug, Default)]
pub struct ClientState {
    user_id: String,
    online: HashSet<String>,
    selected: Option<String>,
    conversation: Vec<ChatMessage>,
    unread: HashMap<String, usize>,
}

impl ClientState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Fold one server event into local state.
    pub fn apply(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::OnlineUsersChanged(users) => {
                // Each snapshot replaces the set; never merged
                self.online = users.into_iter().collect();
            }
            ServerEvent::NewMessage(message) => {
                if message.receiver_id != self.user_id {
                    debug!(receiver_id = %message.receiver_id, "ignoring message for another user");
                    return;
                }
                if self.selected.as_deref() == Some(message.sender_id.as_str()) {
                    self.conversation.push(message);
                } else {
                    *self.unread.entry(message.sender_id).or_default() += 1;
                }
            }
            ServerEvent::Ping(_) => {}
        }
    }

    /// Open the conversation with `peer`, clearing its unread count.
    ///
    /// The conversation buffer starts empty; history comes from the REST
    /// collaborator.
    pub fn select(&mut self, peer: impl Into<String>) {
        let peer = peer.into();
        self.unread.remove(&peer);
        self.conversation.clear();
        self.selected = Some(peer);
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    pub fn online_users(&self) -> &HashSet<String> {
        &self.online
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn conversation(&self) -> &[ChatMessage] {
        &self.conversation
    }

    pub fn unread_from(&self, sender_id: &str) -> usize {
        self.unread.get(sender_id).copied().unwrap_or(0)
    }
}

/// A live subscription to the event stream
pub struct Subscriber {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Subscriber {
    /// Connect to `base` (e.g. `ws://127.0.0.1:3000`) as `user_id`.
    pub async fn connect(base: &str, user_id: Option<&str>) -> anyhow::Result<Self> {
        let url = match user_id {
            Some(user_id) => format!("{}/ws?userId={}", base.trim_end_matches('/'), user_id),
            None => format!("{}/ws", base.trim_end_matches('/')),
        };
        Self::connect_url(&url).await
    }

    /// Connect to a full handshake URL, query string included.
    pub async fn connect_url(url: &str) -> anyhow::Result<Self> {
        let (stream, _) = connect_async(url).await?;
        Ok(Self { stream })
    }

    /// Next decoded server event, or `None` once the server closes.
    pub async fn next_event(&mut self) -> anyhow::Result<Option<ServerEvent>> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(events::decode(text.as_str())?)),
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Close the connection, firing the server-side teardown.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.stream.close(None).await?;
        // Drain until the server acknowledges
        while let Some(frame) = self.stream.next().await {
            if frame.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Drop the transport without a close handshake.
    pub fn abort(self) {
        drop(self.stream);
    }

    /// Send a raw text frame (the server ignores these)
    pub async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(ids: &[&str]) -> ServerEvent {
        ServerEvent::OnlineUsersChanged(ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_snapshot_replaces_online_set() {
        let mut state = ClientState::new("u1");
        state.apply(online(&["u1", "u2"]));
        assert!(state.is_online("u2"));

        state.apply(online(&["u1"]));
        assert!(!state.is_online("u2"));
        assert_eq!(state.online_users().len(), 1);
    }

    #[test]
    fn test_message_from_selected_peer_joins_conversation() {
        let mut state = ClientState::new("u1");
        state.select("u2");

        let message = ChatMessage::new("u2", "u1").with_field("message", "hey");
        state.apply(ServerEvent::NewMessage(message.clone()));

        assert_eq!(state.conversation(), &[message]);
        assert_eq!(state.unread_from("u2"), 0);
    }

    #[test]
    fn test_message_from_other_peer_is_unread() {
        let mut state = ClientState::new("u1");
        state.select("u2");

        state.apply(ServerEvent::NewMessage(ChatMessage::new("u3", "u1")));
        state.apply(ServerEvent::NewMessage(ChatMessage::new("u3", "u1")));

        assert!(state.conversation().is_empty());
        assert_eq!(state.unread_from("u3"), 2);

        state.select("u3");
        assert_eq!(state.unread_from("u3"), 0);
        assert_eq!(state.selected(), Some("u3"));
    }

    #[test]
    fn test_message_for_someone_else_ignored() {
        let mut state = ClientState::new("u1");
        state.apply(ServerEvent::NewMessage(ChatMessage::new("u3", "u9")));
        assert_eq!(state.unread_from("u3"), 0);
    }

    #[test]
    fn test_ping_changes_nothing() {
        let mut state = ClientState::new("u1");
        state.apply(online(&["u1"]));
        state.apply(ServerEvent::Ping(1));
        assert!(state.is_online("u1"));
    }
}
