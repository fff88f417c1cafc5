//! Wire shapes exchanged with the server collaborator.
//!
//! All messages are JSON with camelCase field names. Operations and patches
//! are tagged by an `op` field (`"set"` or `"del"`). A delete is always an
//! explicit `del`, so a `set` carrying `null` stores a real JSON null.

use crate::{Key, LocalMutationId, MutationId, SpaceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single buffered write produced by a write transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Store `value` under `key`.
    Set { key: Key, value: Value },
    /// Remove `key`.
    Del { key: Key },
}

impl Operation {
    /// Create a set operation.
    pub fn set(key: impl Into<Key>, value: Value) -> Self {
        Operation::Set {
            key: key.into(),
            value,
        }
    }

    /// Create a delete operation.
    pub fn del(key: impl Into<Key>) -> Self {
        Operation::Del { key: key.into() }
    }

    /// Get the key this operation targets.
    pub fn key(&self) -> &Key {
        match self {
            Operation::Set { key, .. } => key,
            Operation::Del { key } => key,
        }
    }

    /// Stamp this operation with a server mutation id.
    pub fn into_patch(self, mutation_id: MutationId) -> Patch {
        match self {
            Operation::Set { key, value } => Patch::Set {
                key,
                value,
                mutation_id,
            },
            Operation::Del { key } => Patch::Del { key, mutation_id },
        }
    }
}

/// A server-confirmed change to one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    Set {
        key: Key,
        value: Value,
        #[serde(rename = "mutationId")]
        mutation_id: MutationId,
    },
    Del {
        key: Key,
        #[serde(rename = "mutationId")]
        mutation_id: MutationId,
    },
}

impl Patch {
    /// Create a set patch.
    pub fn set(key: impl Into<Key>, value: Value, mutation_id: MutationId) -> Self {
        Patch::Set {
            key: key.into(),
            value,
            mutation_id,
        }
    }

    /// Create a delete patch.
    pub fn del(key: impl Into<Key>, mutation_id: MutationId) -> Self {
        Patch::Del {
            key: key.into(),
            mutation_id,
        }
    }

    /// Get the key this patch targets.
    pub fn key(&self) -> &Key {
        match self {
            Patch::Set { key, .. } => key,
            Patch::Del { key, .. } => key,
        }
    }

    /// Get the server mutation id that produced this patch.
    pub fn mutation_id(&self) -> MutationId {
        match self {
            Patch::Set { mutation_id, .. } => *mutation_id,
            Patch::Del { mutation_id, .. } => *mutation_id,
        }
    }
}

/// A locally executed mutator invocation, as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Client-local random id
    pub id: LocalMutationId,
    /// Registered mutator name
    pub name: String,
    /// Arguments the mutator was invoked with
    pub args: Value,
    /// Writes the mutator produced locally, in order
    pub operations: Vec<Operation>,
}

/// Server notification that a contiguous batch of mutations was applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeResult {
    /// Server mutation ids covered by this poke
    pub mutation_ids: Vec<MutationId>,
    /// Local ids of the client mutations the server applied
    pub local_mutation_ids: Vec<LocalMutationId>,
    /// Resulting patches
    pub patches: Vec<Patch>,
}

impl PokeResult {
    /// Smallest and largest mutation id in the poke, if any.
    pub fn mutation_range(&self) -> Option<(MutationId, MutationId)> {
        let min = self.mutation_ids.iter().copied().min()?;
        let max = self.mutation_ids.iter().copied().max()?;
        Some((min, max))
    }
}

/// Request for every patch after a mutation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub space_id: SpaceId,
    pub after_mutation_id: MutationId,
}

/// Patches newer than the requested cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub last_mutation_id: MutationId,
    pub patches: Vec<Patch>,
}

/// Locally buffered mutations submitted for server ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub space_id: SpaceId,
    pub mutations: Vec<Mutation>,
}

/// Acknowledgement of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub last_mutation_id: MutationId,
}
