//! Error responses and worker-error classification.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::worker::WorkerError;

/// The user-facing admission-control message.
pub const BUSY_MESSAGE: &str = "server is busy, please retry";

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub fn not_found(message: impl Into<String>) -> Response {
    error_response(StatusCode::NOT_FOUND, message)
}

pub fn bad_request(message: impl Into<String>) -> Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn internal_error(message: impl Into<String>) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// Map a worker error to a transport status and user-facing message.
pub fn classify(err: &WorkerError) -> (StatusCode, String) {
    match err {
        WorkerError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        WorkerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, err.to_string()),
        WorkerError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        WorkerError::DispatcherBusy => (StatusCode::TOO_MANY_REQUESTS, BUSY_MESSAGE.to_string()),
        WorkerError::Cancelled
        | WorkerError::Resource(_)
        | WorkerError::Provider(_)
        | WorkerError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub fn from_worker_error(err: &WorkerError) -> Response {
    let (status, message) = classify(err);
    error_response(status, message)
}
