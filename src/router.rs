//! Live message delivery
//!
//! Pushes an already-persisted message to the receiver's current connection.
//! Delivery is best effort: an offline receiver is routine and silent, and the
//! receiver catches up later from stored history.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{ChatMessage, ServerEvent};
use crate::hub::Hub;
use crate::registry::ConnectionRegistry;
use crate::session::ConnId;

/// What happened to a delivery attempt. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued on the receiver's current connection
    Delivered(ConnId),
    /// Receiver has no registered connection
    Offline,
    /// Receiver is registered but its connection could not take the event
    Dropped(ConnId),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}

#[derive(Debug, Clone)]
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    hub: Arc<Hub>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, hub: Arc<Hub>) -> Self {
        Self { registry, hub }
    }

    /// Deliver `message` from `message.sender_id` to `message.receiver_id`.
    ///
    /// The event goes to the receiver's registered connection only, never to
    /// any other session. Never fails.
    pub fn deliver(&self, message: ChatMessage) -> DeliveryOutcome {
        let Some(conn_id) = self.registry.lookup(&message.receiver_id) else {
            debug!(
                sender_id = %message.sender_id,
                receiver_id = %message.receiver_id,
                "receiver offline, skipping live delivery"
            );
            return DeliveryOutcome::Offline;
        };

        let sender_id = message.sender_id.clone();
        let receiver_id = message.receiver_id.clone();
        match self.hub.send(conn_id, ServerEvent::NewMessage(message)) {
            Ok(()) => {
                debug!(%sender_id, %receiver_id, conn_id = %conn_id, "message delivered");
                DeliveryOutcome::Delivered(conn_id)
            }
            Err(e) => {
                warn!(%sender_id, %receiver_id, error = %e, "live delivery dropped");
                DeliveryOutcome::Dropped(conn_id)
            }
        }
    }
}
