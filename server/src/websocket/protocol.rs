//! WebSocket message protocol definitions.
//!
//! Envelopes are JSON with a snake_case `type` tag and snake_case fields.
//! Engine payloads nested inside them keep their camelCase wire format.

use replisync_engine::{Mutation, MutationId, Patch, PokeResult};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request every patch after a mutation id.
    Pull {
        #[serde(default)]
        after_mutation_id: MutationId,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Push mutations to the server.
    Push {
        mutations: Vec<Mutation>,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Response to a pull request.
    PullResponse {
        last_mutation_id: MutationId,
        patches: Vec<Patch>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to a push request.
    PushResponse {
        last_mutation_id: MutationId,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// A batch of mutations was applied to the space.
    Poke { poke: PokeResult },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }
}
