//! HTTP handlers.

pub mod problem_details;
pub mod v1;

use axum::http::StatusCode;

/// GET /livez
pub async fn livez() -> StatusCode {
    StatusCode::OK
}

/// GET /version
pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
