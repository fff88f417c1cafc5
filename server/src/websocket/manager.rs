//! WebSocket connection manager.
//!
//! Tracks active poke connections per space and owns the bounded channel
//! each connection's writer drains.

use std::sync::Arc;

use dashmap::DashMap;
use replisync_engine::SpaceId;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::Sender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Space the connection is subscribed to
    pub space_id: SpaceId,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connections by space for efficient lookup.
    by_space: DashMap<SpaceId, Vec<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, space_id: SpaceId, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.by_space
            .entry(space_id.clone())
            .or_default()
            .push(conn_id.clone());

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                space_id,
                sender,
            },
        );

        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection. Its sender is dropped.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_space.get_mut(&conn.space_id) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_space.remove(&conn.space_id);
                }
            }

            tracing::info!(
                conn_id = %conn_id,
                space_id = %conn.space_id,
                "WebSocket connection unregistered"
            );
        }
    }

    /// Queue a message for a specific connection.
    ///
    /// Returns false when the connection is gone or its buffer is full; a
    /// full buffer drops the message.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        let Some(conn) = self.connections.get(conn_id) else {
            return false;
        };
        match conn.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    conn_id = %conn_id,
                    space_id = %conn.space_id,
                    "Connection buffer full, message dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections subscribed to a space.
    pub fn space_connection_count(&self, space_id: &str) -> usize {
        self.by_space.get(space_id).map_or(0, |ids| ids.len())
    }
}
