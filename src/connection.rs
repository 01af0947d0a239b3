//! Per-connection actor
//!
//! Splits the WebSocket into halves:
//! - Writer task: owns the sink, drains the session's outbound queue
//! - Reader loop: watches for close or error; clients send nothing we act on
//!
//! When either side ends, the connection tears down through the guarded
//! lifecycle transition.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{self, ServerEvent};
use crate::server::AppState;
use crate::session::{ConnId, Lifecycle, Session};

/// Run a connection until the transport closes.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: Option<String>) {
    let conn_id = state.hub.next_conn_id();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerEvent>(state.config.outbound_capacity);

    // Subscribe to topics before registering so this client sees its own arrival
    state
        .hub
        .add_session(Session::new(conn_id, user_id.clone(), tx.clone()));
    let mut writer = tokio::spawn(writer_task(ws_sender, rx));

    let mut lifecycle = Lifecycle::new(conn_id);
    if !lifecycle.open(&state.registry, user_id.as_deref()) {
        // Not registered, so no broadcast went out; hand this client the current set
        queue_initial_snapshot(&state, conn_id);
    }
    drop(tx);

    info!(conn_id = %conn_id, user_id = ?user_id, "connection opened");

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn_id = %conn_id, reason = ?frame, "client initiated close");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    debug!(
                        conn_id = %conn_id,
                        "ignoring client frame: {}",
                        text.chars().take(100).collect::<String>()
                    );
                }
                // Ping/pong are answered by the transport; binary is unused
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, error = %e, "websocket receive error");
                    break;
                }
                None => {
                    debug!(conn_id = %conn_id, "websocket stream ended");
                    break;
                }
            },
            _ = &mut writer => {
                debug!(conn_id = %conn_id, "writer stopped");
                break;
            }
        }
    }

    let removed = lifecycle.close(&state.registry);
    state.hub.remove_session(conn_id);
    writer.abort();

    info!(
        conn_id = %conn_id,
        user_id = ?user_id,
        unregistered = removed,
        "connection closed"
    );
}

/// Queue the current online set for `conn_id` while the registry is locked.
///
/// The session is already subscribed to the presence topic, so any broadcast
/// newer than this snapshot is queued after it.
fn queue_initial_snapshot(state: &AppState, conn_id: ConnId) {
    let queued = state.registry.with_online_users(|users| {
        state
            .hub
            .send(conn_id, ServerEvent::OnlineUsersChanged(users))
    });
    if let Err(e) = queued {
        debug!(conn_id = %conn_id, error = %e, "could not queue initial snapshot");
    }
}

/// Forward queued events to the WebSocket sink until either side closes.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let frame = match events::encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = event.name(), error = %e, "dropping unencodable event");
                continue;
            }
        };

        if ws_sender.send(Message::Text(frame.into())).await.is_err() {
            // Connection is broken
            break;
        }
    }

    let _ = ws_sender.close().await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::client::ClientState;
    use crate::config::Config;

    fn fold(state: &mut ClientState, rx: &mut mpsc::Receiver<ServerEvent>) {
        while let Ok(event) = rx.try_recv() {
            state.apply(event);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_snapshot_never_overrides_newer_presence() {
        for round in 0..50u64 {
            let state = AppState::new(Config::default());
            let (tx, mut rx) = mpsc::channel(64);
            let anon = state.hub.next_conn_id();
            state.hub.add_session(Session::new(anon, None, tx));

            let registry = Arc::clone(&state.registry);
            let joiner = std::thread::spawn(move || {
                registry.register("u1", ConnId(1_000 + round));
            });
            queue_initial_snapshot(&state, anon);
            joiner.join().unwrap();

            // Let the forwarder drain the presence topic
            tokio::time::sleep(Duration::from_millis(20)).await;

            let mut client = ClientState::new("");
            fold(&mut client, &mut rx);
            assert!(client.is_online("u1"), "stale presence in round {}", round);
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_after_register() {
        let state = AppState::new(Config::default());
        let (tx, mut rx) = mpsc::channel(8);
        let anon = state.hub.next_conn_id();
        state.hub.add_session(Session::new(anon, None, tx));

        state.registry.register("u1", ConnId(99));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue_initial_snapshot(&state, anon);

        let mut client = ClientState::new("");
        fold(&mut client, &mut rx);
        assert!(client.is_online("u1"));
        assert_eq!(client.online_users().len(), 1);
    }
}
