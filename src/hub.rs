//! Connection Hub
//!
//! Owns every live session's outbound queue. Topics (presence, heartbeat) use
//! tokio::sync::broadcast for O(1) fan-out; each session runs one forwarding
//! task that copies topic events into its queue. Point-to-point sends go
//! straight into the target session's queue.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::events::ServerEvent;
use crate::presence::PresenceBroadcaster;
use crate::session::{ConnId, Session};

/// Ping broadcast capacity
const PING_CAPACITY: usize = 16;

pub struct Hub {
    /// All sessions by connection ID
    sessions: DashMap<ConnId, Session>,

    /// Topic forwarding task per session
    forwarders: DashMap<ConnId, AbortHandle>,

    /// Presence topic (all sessions receive snapshots)
    presence: PresenceBroadcaster,

    /// Ping broadcast sender (all sessions receive pings)
    ping_tx: broadcast::Sender<i64>,

    next_id: AtomicU64,
}

impl Hub {
    pub fn new(presence: PresenceBroadcaster) -> Self {
        let (ping_tx, _) = broadcast::channel(PING_CAPACITY);

        Self {
            sessions: DashMap::new(),
            forwarders: DashMap::new(),
            presence,
            ping_tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection ID
    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a session and subscribe it to every topic.
    ///
    /// Subscription happens before this returns, so any presence change made
    /// afterwards reaches the new session.
    pub fn add_session(&self, session: Session) {
        let conn_id = session.conn_id;
        debug!(conn_id = %conn_id, user_id = ?session.user_id, "session added");

        let handle = self.spawn_forwarder(conn_id, session.tx.clone());
        self.forwarders.insert(conn_id, handle);
        self.sessions.insert(conn_id, session);
    }

    fn spawn_forwarder(&self, conn_id: ConnId, tx: mpsc::Sender<ServerEvent>) -> AbortHandle {
        let mut presence_rx = self.presence.subscribe();
        let mut ping_rx = self.ping_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    users = presence_rx.recv() => match users {
                        Ok(users) => ServerEvent::OnlineUsersChanged(users.to_vec()),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Snapshots are total; the next one supersedes what was skipped
                            warn!(conn_id = %conn_id, lagged = n, "presence receiver lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    timestamp = ping_rx.recv() => match timestamp {
                        Ok(timestamp) => ServerEvent::Ping(timestamp),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(conn_id = %conn_id, lagged = n, "ping receiver lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        handle.abort_handle()
    }

    /// Remove a session, stopping its forwarding task
    pub fn remove_session(&self, conn_id: ConnId) -> Option<Session> {
        if let Some((_, handle)) = self.forwarders.remove(&conn_id) {
            handle.abort();
        }

        let removed = self.sessions.remove(&conn_id).map(|(_, session)| session);
        if removed.is_some() {
            debug!(conn_id = %conn_id, "session removed");
        }
        removed
    }

    /// Queue an event for one connection without waiting
    pub fn send(&self, conn_id: ConnId, event: ServerEvent) -> Result<(), SendError> {
        let session = self
            .sessions
            .get(&conn_id)
            .ok_or(SendError::UnknownConnection(conn_id))?;

        session.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull(conn_id),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(conn_id),
        })
    }

    /// Broadcast ping to all sessions
    pub fn broadcast_ping(&self, timestamp: i64) {
        match self.ping_tx.send(timestamp) {
            Ok(n) => {
                debug!(receivers = n, "ping broadcast sent");
            }
            Err(_) => {
                debug!("no receivers for ping");
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("sessions", &self.sessions.len())
            .field("forwarders", &self.forwarders.len())
            .finish()
    }
}

/// Point-to-point send failures
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no session for connection {0}")]
    UnknownConnection(ConnId),
    #[error("outbound queue full for connection {0}")]
    QueueFull(ConnId),
    #[error("connection {0} is closed")]
    Closed(ConnId),
}
