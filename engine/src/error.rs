//! Error types for the replisync engine.

use crate::MutationId;
use thiserror::Error;

/// All possible errors from the replisync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Mutation errors
    #[error("mutator not found: {0}")]
    MutatorNotFound(String),

    #[error("mutator '{name}' failed: {message}")]
    Mutator { name: String, message: String },

    // Reconciliation errors
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("out of order poke: expected mutation {expected}, got {got}")]
    OutOfOrderPoke { expected: MutationId, got: MutationId },

    // Subscription errors
    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Data errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("client is closed")]
    Closed,
}

impl Error {
    /// Create a mutator failure from any displayable error.
    pub fn mutator(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Mutator {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Create a transport failure from any displayable error.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Error::Transport(message.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
