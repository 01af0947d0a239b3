//! WebSocket session management
//!
//! A session represents a single live connection. A user may reconnect at any
//! time; the new connection gets a fresh [`ConnId`] and is indistinguishable
//! from a brand-new client.

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::events::ServerEvent;
use crate::registry::ConnectionRegistry;

/// Process-unique connection identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live session record
#[derive(Debug)]
pub struct Session {
    pub conn_id: ConnId,
    /// Identity from the handshake, if it carried one
    pub user_id: Option<String>,
    /// Outbound queue drained by the connection's writer
    pub tx: mpsc::Sender<ServerEvent>,
}

impl Session {
    pub fn new(conn_id: ConnId, user_id: Option<String>, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            conn_id,
            user_id,
            tx,
        }
    }
}

/// Registry-facing lifecycle state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected { user_id: String },
}

/// Drives a connection through `Disconnected -> Connected -> Disconnected`.
///
/// The only registry mutations a connection ever performs go through here, so
/// teardown is always the guarded, connection-matched variant.
#[derive(Debug)]
pub struct Lifecycle {
    conn_id: ConnId,
    state: ConnectionState,
}

impl Lifecycle {
    pub fn new(conn_id: ConnId) -> Self {
        Self {
            conn_id,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Handshake transition. Returns true if the connection became `Connected`.
    pub fn open(&mut self, registry: &ConnectionRegistry, user_id: Option<&str>) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        let Some(user_id) = user_id else {
            debug!(conn_id = %self.conn_id, "anonymous handshake, not registered");
            return false;
        };
        if !registry.register(user_id, self.conn_id) {
            return false;
        }

        self.state = ConnectionState::Connected {
            user_id: user_id.to_string(),
        };
        true
    }

    /// Teardown transition on transport close or error.
    ///
    /// Returns true if this connection's registry entry was removed; false when
    /// it was never connected or a newer connection already replaced it.
    pub fn close(&mut self, registry: &ConnectionRegistry) -> bool {
        match std::mem::replace(&mut self.state, ConnectionState::Disconnected) {
            ConnectionState::Connected { user_id } => registry.unregister(&user_id, self.conn_id),
            ConnectionState::Disconnected => false,
        }
    }
}
