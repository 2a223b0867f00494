//! Live-update connections keyed by correlation id.
//!
//! Each attached connection gets a forwarder task that drains its
//! correlation topic into the connection's outbound channel. The first frame
//! is always a synthetic `connected`; after the terminal event the forwarder
//! sends a Close frame and detaches the connection. A correlation the bus
//! knows nothing about is checked against the store, so a subscriber that
//! arrives long after the end still gets its terminal event.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::Message;
use hireflow_events::{LiveUpdate, Subscription};
use hireflow_worker::FlowCoordinator;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Channel sender half for pushing frames to one connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// One attached subscriber.
pub struct Connection {
    pub correlation_id: String,
    sender: WsSender,
    forwarder: JoinHandle<()>,
}

pub struct Broadcaster {
    coordinator: Arc<FlowCoordinator>,
    connections: RwLock<HashMap<String, Connection>>,
}

impl Broadcaster {
    pub fn new(coordinator: Arc<FlowCoordinator>) -> Self {
        Self {
            coordinator,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `sender` to the events of `correlation_id`.
    ///
    /// Subscribes before returning, so every event published after this call
    /// is delivered. If the correlation already ended, the connection gets
    /// `connected`, the terminal event (remembered by the bus, or rebuilt
    /// from the store), then Close.
    pub async fn attach(self: &Arc<Self>, correlation_id: &str, sender: WsSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let subscription = self.coordinator.bus().subscribe(correlation_id);

        if !send_json(&sender, &LiveUpdate::connected(correlation_id)) {
            tracing::debug!(conn_id = %conn_id, "Connection closed before attach");
            return conn_id;
        }

        // Hold the write lock across the spawn so the forwarder cannot detach
        // before the connection is registered.
        let mut connections = self.connections.write().await;
        let forwarder = tokio::spawn(Arc::clone(self).forward(
            conn_id.clone(),
            subscription,
            sender.clone(),
        ));
        connections.insert(
            conn_id.clone(),
            Connection {
                correlation_id: correlation_id.to_string(),
                sender,
                forwarder,
            },
        );
        drop(connections);

        tracing::info!(conn_id = %conn_id, correlation_id, "Live subscriber attached");
        conn_id
    }

    /// Remove a connection and stop its forwarder. Returns whether it was
    /// still attached.
    pub async fn detach(&self, conn_id: &str) -> bool {
        match self.remove(conn_id).await {
            Some(conn) => {
                conn.forwarder.abort();
                true
            }
            None => false,
        }
    }

    async fn remove(&self, conn_id: &str) -> Option<Connection> {
        let removed = self.connections.write().await.remove(conn_id);
        if let Some(conn) = &removed {
            tracing::info!(
                conn_id,
                correlation_id = %conn.correlation_id,
                "Live subscriber detached",
            );
        }
        removed
    }

    async fn forward(
        self: Arc<Self>,
        conn_id: String,
        mut subscription: Subscription,
        sender: WsSender,
    ) {
        if subscription.is_fresh() {
            if let Err(e) = self.coordinator.reconcile(subscription.correlation_id()).await {
                tracing::warn!(
                    conn_id = %conn_id,
                    correlation_id = subscription.correlation_id(),
                    error = %e,
                    "Could not check stored state for a new subscriber",
                );
            }
        }
        while let Some(event) = subscription.recv().await {
            if !send_json(&sender, &LiveUpdate::from(&event)) {
                tracing::debug!(conn_id = %conn_id, "Write failed, detaching");
                self.remove(&conn_id).await;
                return;
            }
            if event.terminal {
                break;
            }
        }
        // Terminal event delivered, or the topic closed under a lagging
        // subscriber.
        let _ = sender.send(Message::Close(None));
        self.remove(&conn_id).await;
    }

    /// Send a Ping frame to every connection; detach any whose transport is
    /// gone.
    pub async fn ping_all(&self) {
        let dead: Vec<String> = {
            let conns = self.connections.read().await;
            conns
                .iter()
                .filter(|(_, conn)| conn.sender.send(Message::Ping(Bytes::new())).is_err())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for conn_id in dead {
            self.detach(&conn_id).await;
        }
    }

    /// Return the current number of attached connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of connections attached to `correlation_id`.
    pub async fn subscriber_count(&self, correlation_id: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.correlation_id == correlation_id)
            .count()
    }

    /// Send a Close frame to every connection, then clear the map.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for (_, conn) in conns.drain() {
            conn.forwarder.abort();
            let _ = conn.sender.send(Message::Close(None));
        }
        tracing::info!(count, "Closed all live connections");
    }
}

/// Serialize `update` onto the connection. Returns `false` once the
/// transport is gone.
fn send_json(sender: &WsSender, update: &LiveUpdate) -> bool {
    match serde_json::to_string(update) {
        Ok(text) => sender.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize live update");
            true
        }
    }
}
