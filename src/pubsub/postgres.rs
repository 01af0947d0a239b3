//! PostgreSQL pub/sub backend using LISTEN/NOTIFY
//!
//! The persistence collaborator already owns the database, so after storing a
//! message it can notify this node in the same transaction:
//!
//! ```sql
//! SELECT pg_notify('new_message', encode(convert_to($1, 'UTF8'), 'base64'));
//! ```
//!
//! Payloads are base64 so arbitrary JSON survives NOTIFY's text channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::sync::{RwLock, mpsc};
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tracing::{error, info, warn};

use crate::pubsub::PubSub;

/// Delay before reconnecting a failed listener
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Keepalive interval while idle
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct PostgresPubSub {
    connection_string: String,
    subscriptions: Arc<RwLock<Vec<String>>>,
}

impl PostgresPubSub {
    /// Connect once to verify the database is reachable
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("failed to connect to PostgreSQL")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "connection error during init");
            }
        });

        client.execute("SELECT 1", &[]).await?;

        Ok(Self {
            connection_string: database_url.to_string(),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Channel names must be valid identifiers
    fn sanitize_channel(stream: &str) -> String {
        let sanitized: String = stream
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect();

        if sanitized
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(true)
        {
            format!("ch_{}", sanitized)
        } else {
            sanitized
        }
    }

    async fn run_listener<F>(
        connection_string: &str,
        subscriptions: &Arc<RwLock<Vec<String>>>,
        callback: Arc<F>,
    ) -> anyhow::Result<()>
    where
        F: Fn(String, Vec<u8>) + Send + Sync + 'static,
    {
        let (client, mut connection) = tokio_postgres::connect(connection_string, NoTls).await?;

        // Queries only progress while the connection is polled; the driver
        // owns it and forwards notifications until it fails
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            loop {
                match std::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        if notify_tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "listener connection error");
                        break;
                    }
                    None => break,
                }
            }
        });

        let result = Self::listen_loop(&client, subscriptions, &mut notify_rx, callback).await;
        driver.abort();
        result
    }

    async fn listen_loop<F>(
        client: &tokio_postgres::Client,
        subscriptions: &Arc<RwLock<Vec<String>>>,
        notify_rx: &mut mpsc::UnboundedReceiver<Notification>,
        callback: Arc<F>,
    ) -> anyhow::Result<()>
    where
        F: Fn(String, Vec<u8>) + Send + Sync + 'static,
    {
        let mut current: Vec<String> = Vec::new();

        loop {
            // Reconcile LISTENs with the subscription set
            {
                let wanted = subscriptions.read().await;
                for channel in wanted.iter() {
                    if !current.contains(channel) {
                        client.batch_execute(&format!("LISTEN {}", channel)).await?;
                        current.push(channel.clone());
                        info!(channel, "listening");
                    }
                }
                let stale: Vec<String> = current
                    .iter()
                    .filter(|c| !wanted.contains(c))
                    .cloned()
                    .collect();
                for channel in stale {
                    client.batch_execute(&format!("UNLISTEN {}", channel)).await?;
                    current.retain(|c| c != &channel);
                    info!(channel, "stopped listening");
                }
            }

            tokio::select! {
                notification = notify_rx.recv() => {
                    let Some(notification) = notification else {
                        anyhow::bail!("connection closed");
                    };
                    match STANDARD.decode(notification.payload()) {
                        Ok(payload) => callback(notification.channel().to_string(), payload),
                        Err(e) => warn!(
                            channel = notification.channel(),
                            error = %e,
                            "notification payload is not base64"
                        ),
                    }
                }
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                    client
                        .execute("SELECT 1", &[])
                        .await
                        .context("keepalive failed")?;
                }
            }
        }
    }
}

#[async_trait]
impl PubSub for PostgresPubSub {
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()> {
        let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "publish connection error");
            }
        });

        let channel = Self::sanitize_channel(stream);
        let encoded = STANDARD.encode(payload);

        client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &encoded])
            .await?;

        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> anyhow::Result<()> {
        let channel = Self::sanitize_channel(stream);

        let mut subs = self.subscriptions.write().await;
        if !subs.contains(&channel) {
            subs.push(channel);
        }

        Ok(())
    }

    async fn unsubscribe(&self, stream: &str) -> anyhow::Result<()> {
        let channel = Self::sanitize_channel(stream);
        self.subscriptions.write().await.retain(|s| s != &channel);
        Ok(())
    }

    async fn listen<F>(&self, callback: F) -> anyhow::Result<()>
    where
        F: Fn(String, Vec<u8>) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);

        loop {
            if let Err(e) =
                Self::run_listener(&self.connection_string, &self.subscriptions, callback.clone())
                    .await
            {
                error!(error = %e, "listener error, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
