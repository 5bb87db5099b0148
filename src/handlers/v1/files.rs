//! Attachment upload and storage-quota handlers.

use axum::Json;
use axum::extract::{Path as PathExtract, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{Duration as ChronoDuration, Utc};
use tracing::warn;

use crate::api::{StorageUsageResponse, UploadFileRequest, UploadFileResponse};
use crate::handlers::problem_details;
use crate::server::AppState;

use super::sessions::UserQuery;

/// Per-user cap on live upload bytes.
const MAX_TEMP_STORAGE_BYTES: i64 = 50 * 1024 * 1024;

/// POST /api/v1/sessions/{session_id}/files
pub async fn upload_file(
    State(state): State<AppState>,
    PathExtract(session_id): PathExtract<i64>,
    Json(req): Json<UploadFileRequest>,
) -> Response {
    if req.file_name.is_empty() || req.file_name.contains(['/', '\\']) {
        return problem_details::bad_request("invalid file name");
    }
    if req.content.is_empty() {
        return problem_details::bad_request("file content required");
    }

    let used = match state.store.temp_storage_usage(req.user_id).await {
        Ok(used) => used,
        Err(err) => return problem_details::from_worker_error(&err.into()),
    };
    let size = req.content.len() as i64;
    if used + size > MAX_TEMP_STORAGE_BYTES {
        return problem_details::bad_request("temp storage quota exceeded");
    }

    let stored_name = format!("{}_{}_{}", req.user_id, session_id, req.file_name);
    if let Err(e) = tokio::fs::create_dir_all(&state.file_base).await {
        warn!(error = %e, "failed to create file base directory");
        return problem_details::internal_error("file storage unavailable");
    }
    if let Err(e) = tokio::fs::write(state.file_base.join(&stored_name), &req.content).await {
        warn!(error = %e, "failed to store upload");
        return problem_details::internal_error("file storage unavailable");
    }

    let expires_at = Utc::now() + ChronoDuration::from_std(state.file_ttl).unwrap_or_default();
    let file_id = match state
        .store
        .record_temp_file(
            req.user_id,
            session_id,
            &req.file_name,
            &stored_name,
            "text/plain",
            size,
            expires_at,
        )
        .await
    {
        Ok(id) => id,
        Err(err) => return problem_details::from_worker_error(&err.into()),
    };

    // The attachment list changed; every replica re-reads on next use.
    state
        .manager
        .invalidate_temp_files(req.user_id, session_id)
        .await;

    (StatusCode::OK, Json(UploadFileResponse { file_id })).into_response()
}

/// GET /api/v1/files/usage
pub async fn storage_usage(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Response {
    match state.store.temp_storage_usage(query.user_id).await {
        Ok(used_bytes) => {
            (StatusCode::OK, Json(StorageUsageResponse { used_bytes })).into_response()
        }
        Err(err) => problem_details::from_worker_error(&err.into()),
    }
}
