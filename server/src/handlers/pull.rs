//! Pull handler - serves patches to clients behind on a space.

use crate::error::Result;
use replisync_engine::{MemoryServer, MutationId, PullRequest, PullResponse};
use serde::Deserialize;

use super::validate_space_id;

/// Query parameters for pull sync.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Client cursor; patches at or below it are omitted
    #[serde(default)]
    pub after_mutation_id: MutationId,
}

/// Process a pull request from a client.
pub async fn handle_pull(
    server: &MemoryServer,
    space_id: &str,
    query: PullQuery,
) -> Result<PullResponse> {
    validate_space_id(space_id)?;

    let request = PullRequest {
        space_id: space_id.to_string(),
        after_mutation_id: query.after_mutation_id,
    };
    Ok(server.pull(&request).await)
}
