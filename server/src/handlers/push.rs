//! Push handler - orders client mutations into a space.

use crate::error::Result;
use replisync_engine::{MemoryServer, Mutation, PushRequest, PushResponse};
use serde::Deserialize;

use super::validate_space_id;

/// Body of a push; the space comes from the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    /// Mutations in local execution order
    pub mutations: Vec<Mutation>,
}

/// Process a push request from a client.
///
/// Subscribers of the space are poked by the space store once the batch is
/// applied, including the connection of the pushing client.
pub async fn handle_push(
    server: &MemoryServer,
    space_id: &str,
    body: PushBody,
) -> Result<PushResponse> {
    validate_space_id(space_id)?;

    let count = body.mutations.len();
    let response = server
        .push(PushRequest {
            space_id: space_id.to_string(),
            mutations: body.mutations,
        })
        .await?;

    tracing::debug!(
        space_id = %space_id,
        mutations = count,
        last_mutation_id = response.last_mutation_id,
        "Push accepted"
    );

    Ok(response)
}
