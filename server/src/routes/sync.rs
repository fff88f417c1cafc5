//! Sync endpoint routes.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use replisync_engine::{PullResponse, PushResponse};

use crate::error::Result;
use crate::handlers::{
    handle_poke_connection, handle_pull, handle_push, validate_space_id, PullQuery, PushBody,
};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pull/{space_id}", get(pull_handler))
        .route("/push/{space_id}", post(push_handler))
        .route("/poke/{space_id}", get(poke_handler))
}

/// GET /pull/{space_id} - Patches after the client's cursor.
async fn pull_handler(
    State(state): State<AppState>,
    Path(space_id): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state.server, &space_id, query).await?;
    Ok(Json(response))
}

/// POST /push/{space_id} - Order mutations into the space.
async fn push_handler(
    State(state): State<AppState>,
    Path(space_id): Path<String>,
    Json(body): Json<PushBody>,
) -> Result<Json<PushResponse>> {
    let response = handle_push(&state.server, &space_id, body).await?;
    Ok(Json(response))
}

/// GET /poke/{space_id} - Upgrade to the space's poke channel.
async fn poke_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(space_id): Path<String>,
) -> Result<Response> {
    validate_space_id(&space_id)?;
    Ok(ws.on_upgrade(move |socket| handle_poke_connection(socket, state, space_id)))
}
