//! Real-time direct-chat backend: presence tracking, typing relay, and live
//! message push over WebSocket, with Postgres persistence behind a narrow
//! store interface. The binary entry point is in main.rs.

pub mod config;
pub mod events;
pub mod handlers;
pub mod models;
pub mod realtime;
pub mod registry;
pub mod schema;
pub mod serde_i64_string;
pub mod store;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use realtime::RealtimeService;
use store::ChatStore;

/// Shared application state passed to all handlers via the axum State
/// extractor. The realtime service and the store are built once at process
/// start and injected here; nothing is lazily initialized.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub realtime: Arc<RealtimeService>,
    pub jwt_secret: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/socket", get(handlers::ws::ws_handler))
        .route(
            "/api/messages",
            post(handlers::messages::submit_message).get(handlers::messages::fetch_messages),
        )
        .route("/api/messages/mark-seen", post(handlers::messages::mark_seen))
        .route(
            "/api/users",
            get(handlers::users::list_users)
                .post(handlers::users::register_user)
                .put(handlers::users::login_user)
                .patch(handlers::users::reset_password),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
