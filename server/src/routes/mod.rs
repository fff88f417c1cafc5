//! HTTP route definitions.
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/health` | liveness and open poke connections |
//! | GET | `/pull/{space_id}?afterMutationId=` | patches after a cursor |
//! | POST | `/push/{space_id}` | order mutations into a space |
//! | GET | `/poke/{space_id}` | WebSocket poke channel |

mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// Every route of the sync server, awaiting state.
pub fn create_routes() -> Router<AppState> {
    Router::new().merge(health::routes()).merge(sync::routes())
}
