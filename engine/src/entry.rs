//! Entry types held by the key-value store.

use crate::{Key, LocalMutationId, Mutation, MutationId, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Confirmed state of a key in the base layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// The stored JSON value
    pub value: Value,
    /// Server mutation that last wrote this key
    pub mutation_id: MutationId,
}

impl Entry {
    /// Create a new entry.
    pub fn new(value: Value, mutation_id: MutationId) -> Self {
        Self { value, mutation_id }
    }
}

/// The effect a pending mutation has on one key.
///
/// `Delete` is a tombstone. It shadows older layers and is distinct from a
/// stored `Value::Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum KvUpdate {
    Set(Value),
    Delete,
}

impl KvUpdate {
    /// The value this update leaves visible, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            KvUpdate::Set(value) => Some(value),
            KvUpdate::Delete => None,
        }
    }

    /// Check if this update is a tombstone.
    pub fn is_delete(&self) -> bool {
        matches!(self, KvUpdate::Delete)
    }
}

/// Push status of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Applied locally, not yet sent
    Waiting,
    /// Part of an in-flight push
    Pending,
    /// Acknowledged by the server, waiting for its patches
    Pushed,
}

/// A locally applied mutation kept as an overlay until confirmed or rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// The mutation as it will be sent to the server
    pub mutation: Mutation,
    /// Where this mutation is in the push lifecycle
    pub status: MutationStatus,
    /// Last-write-wins projection of `mutation.operations`
    pub kv_updates: BTreeMap<Key, KvUpdate>,
}

impl PendingMutation {
    /// Create a waiting mutation, flattening its operations.
    pub fn new(mutation: Mutation) -> Self {
        let kv_updates = flatten_operations(&mutation.operations);
        Self {
            mutation,
            status: MutationStatus::Waiting,
            kv_updates,
        }
    }

    /// Local id of the wrapped mutation.
    pub fn id(&self) -> LocalMutationId {
        self.mutation.id
    }

    /// Check if this mutation has not been handed to a push yet.
    pub fn is_waiting(&self) -> bool {
        self.status == MutationStatus::Waiting
    }
}

/// Flatten operations into one update per key. The last operation on a key wins.
pub fn flatten_operations(operations: &[Operation]) -> BTreeMap<Key, KvUpdate> {
    let mut updates = BTreeMap::new();
    for op in operations {
        match op {
            Operation::Set { key, value } => {
                updates.insert(key.clone(), KvUpdate::Set(value.clone()));
            }
            Operation::Del { key } => {
                updates.insert(key.clone(), KvUpdate::Delete);
            }
        }
    }
    updates
}
