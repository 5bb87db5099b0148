use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::timeout::TimeoutLayer;

use crate::handlers;
use crate::store::Store;
use crate::worker::Manager;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub store: Arc<dyn Store>,
    /// Base directory for uploaded attachments.
    pub file_base: PathBuf,
    /// TTL applied to new uploads.
    pub file_ttl: Duration,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, request_timeout_seconds: u64) -> Router {
    // SSE streaming route - no request timeout (the turn deadline applies).
    let streaming_routes = Router::new()
        .route(
            "/sessions/{session_id}/stream",
            post(handlers::v1::stream_session),
        )
        .with_state(state.clone());

    // Regular API routes - with request timeout.
    let api_routes = Router::new()
        .route("/sessions", post(handlers::v1::init_session))
        .route(
            "/sessions/{session_id}",
            delete(handlers::v1::delete_session),
        )
        .route(
            "/sessions/{session_id}/files",
            post(handlers::v1::upload_file).delete(handlers::v1::invalidate_files),
        )
        .route("/files/usage", get(handlers::v1::storage_usage))
        .route("/users/{user_id}/reset", post(handlers::v1::reset_user))
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(request_timeout_seconds)));

    let api_v1 = Router::new().merge(streaming_routes).merge(api_routes);

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/version", get(handlers::version))
        .nest("/api/v1", api_v1)
}
