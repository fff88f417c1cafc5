//! Replisync Server - reference sync server for replisync spaces.
//!
//! Serves pull and push over HTTP and pokes over one WebSocket per space,
//! backed by the in-memory space store from `replisync-engine`. Every push
//! is ordered into the space's mutation sequence and poked to every
//! connection subscribed to that space.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod websocket;

use crate::config::Config;
use crate::websocket::ConnectionManager;
use axum::Router;
use replisync_engine::MemoryServer;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<MemoryServer>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    /// Fresh state with empty spaces and no connections.
    pub fn new(config: Config) -> Self {
        Self {
            server: Arc::new(MemoryServer::new()),
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
