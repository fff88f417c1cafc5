//! WebSocket handler for the per-space poke channel.
//!
//! Forwards every poke of the space to the socket and answers pull, push
//! and ping messages sent over it.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ServerMessage};
use crate::AppState;

use super::{handle_pull, handle_push, PullQuery, PushBody};

/// Handle an established poke connection for `space_id`.
///
/// This function:
/// 1. Registers the connection and subscribes it to the space's pokes
/// 2. Spawns tasks forwarding pokes and outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Unsubscribes and cleans up on disconnect
pub async fn handle_poke_connection(socket: WebSocket, state: AppState, space_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.poke_buffer);
    let conn_id = state.conn_manager.register(space_id.clone(), tx);
    let (subscriber_id, mut pokes) = state.server.subscribe(&space_id);

    tracing::info!(
        conn_id = %conn_id,
        space_id = %space_id,
        "WebSocket client connected"
    );

    // Forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    // A dropped poke surfaces on the client as a gap and triggers a pull.
    let manager = Arc::clone(&state.conn_manager);
    let poke_conn_id = conn_id.clone();
    let poke_task = tokio::spawn(async move {
        while let Some(poke) = pokes.recv().await {
            manager.send_to(&poke_conn_id, ServerMessage::Poke { poke });
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &state, &space_id).await;
                state.conn_manager.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    state.server.unsubscribe(&space_id, subscriber_id);
    state.conn_manager.unregister(&conn_id);
    poke_task.abort();
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        space_id = %space_id,
        active_connections = state.conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return a server response.
pub(crate) async fn process_message(text: &str, state: &AppState, space_id: &str) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Pull {
            after_mutation_id,
            request_id,
        } => {
            let query = PullQuery { after_mutation_id };
            match handle_pull(&state.server, space_id, query).await {
                Ok(response) => ServerMessage::PullResponse {
                    last_mutation_id: response.last_mutation_id,
                    patches: response.patches,
                    request_id,
                },
                Err(e) => ServerMessage::error(e.to_string(), request_id),
            }
        }

        ClientMessage::Push {
            mutations,
            request_id,
        } => match handle_push(&state.server, space_id, PushBody { mutations }).await {
            Ok(response) => ServerMessage::PushResponse {
                last_mutation_id: response.last_mutation_id,
                request_id,
            },
            Err(e) => ServerMessage::error(e.to_string(), request_id),
        },

        ClientMessage::Ping => ServerMessage::Pong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use replisync_engine::Patch;
    use serde_json::json;

    fn push_text(local_id: u64, key: &str) -> String {
        json!({
            "type": "push",
            "request_id": format!("push-{local_id}"),
            "mutations": [{
                "id": local_id,
                "name": "put",
                "args": null,
                "operations": [{"op": "set", "key": key, "value": local_id}]
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_ping() {
        let state = AppState::new(Config::default());
        let response = process_message(r#"{"type":"ping"}"#, &state, "s").await;
        assert!(matches!(response, ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_invalid_message() {
        let state = AppState::new(Config::default());
        let response = process_message("not json", &state, "s").await;
        match response {
            ServerMessage::Error { message, request_id } => {
                assert!(message.starts_with("Invalid message format"));
                assert!(request_id.is_none());
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_then_pull_and_poke() {
        let state = AppState::new(Config::default());
        let (_, mut pokes) = state.server.subscribe("s");

        let response = process_message(&push_text(9, "k"), &state, "s").await;
        match response {
            ServerMessage::PushResponse {
                last_mutation_id,
                request_id,
            } => {
                assert_eq!(last_mutation_id, 1);
                assert_eq!(request_id.as_deref(), Some("push-9"));
            }
            other => panic!("Expected PushResponse, got {other:?}"),
        }

        let poke = pokes.recv().await.unwrap();
        assert_eq!(poke.local_mutation_ids, vec![9]);

        let pull = r#"{"type":"pull","after_mutation_id":0}"#;
        match process_message(pull, &state, "s").await {
            ServerMessage::PullResponse {
                last_mutation_id,
                patches,
                ..
            } => {
                assert_eq!(last_mutation_id, 1);
                assert_eq!(patches, vec![Patch::set("k", json!(9), 1)]);
            }
            other => panic!("Expected PullResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_push_reports_error() {
        let state = AppState::new(Config::default());
        let text = json!({
            "type": "push",
            "request_id": "dup",
            "mutations": [
                {"id": 1, "name": "put", "args": null, "operations": []},
                {"id": 1, "name": "put", "args": null, "operations": []}
            ]
        })
        .to_string();

        match process_message(&text, &state, "s").await {
            ServerMessage::Error { request_id, .. } => {
                assert_eq!(request_id.as_deref(), Some("dup"));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
        assert_eq!(state.server.last_mutation_id("s").await, 0);
    }
}
