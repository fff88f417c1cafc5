//! Debug dump of a client's local state.

use crate::{
    entry::{MutationStatus, PendingMutation},
    error::Result,
    ClientId, LocalMutationId, MutationId, SpaceId,
};
use serde::{Deserialize, Serialize};

/// Point-in-time summary of a replica, for logging and inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    pub client_id: ClientId,
    pub space_id: SpaceId,
    /// Highest server mutation id applied
    pub latest_mutation_id: MutationId,
    /// Keys in the confirmed layer
    pub base_keys: usize,
    /// Keys visible through pending overlays
    pub visible_keys: usize,
    pub subscriptions: usize,
    /// Pending mutations, oldest first
    pub pending: Vec<PendingSummary>,
}

impl DebugState {
    /// Count of mutations not yet handed to a push.
    pub fn waiting_count(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| p.status == MutationStatus::Waiting)
            .count()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One pending mutation in a [`DebugState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub id: LocalMutationId,
    pub name: String,
    pub status: MutationStatus,
    pub keys: Vec<String>,
}

impl From<&PendingMutation> for PendingSummary {
    fn from(pending: &PendingMutation) -> Self {
        Self {
            id: pending.id(),
            name: pending.mutation.name.clone(),
            status: pending.status,
            keys: pending.kv_updates.keys().cloned().collect(),
        }
    }
}
