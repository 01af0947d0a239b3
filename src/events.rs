//! Wire events
//!
//! Every server-to-client frame is a JSON text frame tagged by event name:
//!
//! - `online-users-changed`: full snapshot of online user ids
//! - `new-message`: a persisted message, sent only to the receiver
//! - `ping`: heartbeat carrying unix seconds
//!
//! Clients are not required to send anything.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message that the persistence layer has already stored.
///
/// Only the routing fields are interpreted; everything else the collaborator
/// persisted is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(sender_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            fields: Map::new(),
        }
    }

    /// Attach a persisted field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Server-to-client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    OnlineUsersChanged(Vec<String>),
    NewMessage(ChatMessage),
    Ping(i64),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::OnlineUsersChanged(_) => "online-users-changed",
            ServerEvent::NewMessage(_) => "new-message",
            ServerEvent::Ping(_) => "ping",
        }
    }
}

/// Encode a server event as a JSON text frame
pub fn encode(event: &ServerEvent) -> Result<String, EventError> {
    serde_json::to_string(event).map_err(EventError::Encode)
}

/// Decode a server event from a JSON text frame
pub fn decode(data: &str) -> Result<ServerEvent, EventError> {
    serde_json::from_str(data).map_err(EventError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_online_users() {
        let event = ServerEvent::OnlineUsersChanged(vec!["u1".to_string(), "u2".to_string()]);
        let encoded = encode(&event).unwrap();
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["event"], "online-users-changed");
        assert_eq!(json["data"], serde_json::json!(["u1", "u2"]));
    }

    #[test]
    fn test_encode_new_message_keeps_persisted_fields() {
        let message = ChatMessage::new("u2", "u1")
            .with_field("_id", "6650a1")
            .with_field("message", "hello");
        let encoded = encode(&ServerEvent::NewMessage(message)).unwrap();
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["event"], "new-message");
        assert_eq!(json["data"]["senderId"], "u2");
        assert_eq!(json["data"]["receiverId"], "u1");
        assert_eq!(json["data"]["_id"], "6650a1");
        assert_eq!(json["data"]["message"], "hello");
    }

    #[test]
    fn test_encode_ping() {
        let encoded = encode(&ServerEvent::Ping(1234567890)).unwrap();
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["event"], "ping");
        assert_eq!(json["data"], 1234567890);
    }

    #[test]
    fn test_decode_message_from_collaborator() {
        let raw = r#"{"event":"new-message","data":{"senderId":"a","receiverId":"b","createdAt":"2024-05-24T10:00:00Z"}}"#;
        match decode(raw).unwrap() {
            ServerEvent::NewMessage(message) => {
                assert_eq!(message.sender_id, "a");
                assert_eq!(message.receiver_id, "b");
                assert_eq!(message.fields["createdAt"], "2024-05-24T10:00:00Z");
            }
            other => panic!("expected NewMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_receiver_fails() {
        let raw = r#"{"event":"new-message","data":{"senderId":"a"}}"#;
        assert!(matches!(decode(raw), Err(EventError::Decode(_))));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ServerEvent::Ping(0).name(), "ping");
        assert_eq!(
            ServerEvent::OnlineUsersChanged(Vec::new()).name(),
            "online-users-changed"
        );
    }
}
