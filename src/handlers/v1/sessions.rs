//! Session HTTP handlers and the SSE streaming protocol.
//!
//! A stream response emits, in order: one `ack` event carrying the
//! persisted user message, zero or more `stream` events carrying the
//! cumulative assistant text, and a terminal `done` or `error` event.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path as PathExtract, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{
    AckPayload, DonePayload, ErrorPayload, InitSessionRequest, SessionResponse,
    StreamChatRequest, StreamPayload, sse,
};
use crate::handlers::problem_details;
use crate::models::{Message, Role};
use crate::server::AppState;
use crate::store::NewMessage;
use crate::worker::{ChunkFn, ChunkSendError, SessionRequest, StreamRequest, WorkerError};

#[derive(Deserialize)]
pub struct UserQuery {
    pub user_id: i64,
}

/// POST /api/v1/sessions
pub async fn init_session(
    State(state): State<AppState>,
    Json(req): Json<InitSessionRequest>,
) -> Response {
    let session_req = SessionRequest {
        user_id: req.user_id,
        session_id: req.session_id,
        provider: req.provider,
        model: req.model,
        token: req.token,
        cancel: CancellationToken::new(),
    };
    match state.manager.init_session(session_req).await {
        Ok(session) => (StatusCode::OK, Json(SessionResponse::from(&session))).into_response(),
        Err(err) => problem_details::from_worker_error(&err),
    }
}

/// POST /api/v1/sessions/{session_id}/stream
pub async fn stream_session(
    State(state): State<AppState>,
    PathExtract(session_id): PathExtract<i64>,
    Json(req): Json<StreamChatRequest>,
) -> Response {
    if session_id <= 0 {
        return problem_details::bad_request("session id required");
    }
    if req.content.trim().is_empty() {
        return problem_details::bad_request("message content required");
    }

    let cancel = CancellationToken::new();
    let session_req = SessionRequest {
        user_id: req.user_id,
        session_id,
        provider: req.provider,
        model: req.model,
        token: req.token,
        cancel: cancel.clone(),
    };

    // Prime the session before persisting anything for this turn.
    if let Err(err) = state.manager.init_session(session_req.clone()).await {
        return problem_details::from_worker_error(&err);
    }

    // The user message is persisted up front to power the ack event; the
    // worker only appends it to the in-memory history.
    let user_message = match state
        .store
        .add_message(NewMessage {
            user_id: req.user_id,
            session_id,
            role: Role::User,
            content: req.content.clone(),
        })
        .await
    {
        Ok(msg) => msg,
        Err(err) => return problem_details::from_worker_error(&err.into()),
    };

    let (tx, rx) = mpsc::channel::<Event>(16);

    let chunk_tx = tx.clone();
    let chunk_fn: ChunkFn = Arc::new(move |content: String| {
        let tx = chunk_tx.clone();
        Box::pin(async move {
            tx.send(stream_event(content)).await.map_err(|_| ChunkSendError)
        })
    });

    let stream_req = StreamRequest {
        session: session_req,
        message: user_message.clone(),
        file_ids: req.file_ids,
        chunk_fn,
    };

    tokio::spawn(drive_stream(state, stream_req, user_message, tx, cancel));

    Sse::new(ReceiverStream::new(rx).map(Ok::<Event, Infallible>))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Run one turn and feed the SSE channel.
async fn drive_stream(
    state: AppState,
    req: StreamRequest,
    user_message: Message,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let session_id = user_message.session_id;

    let ack = json_event(
        sse::ACK,
        &AckPayload {
            message: (&user_message).into(),
        },
    );
    if tx.send(ack).await.is_err() {
        cancel.cancel();
        return;
    }

    // A closed channel means the client went away; cancel the turn
    // promptly instead of waiting for the next chunk delivery to fail.
    let result = tokio::select! {
        result = state.manager.stream(req) => result,
        _ = tx.closed() => {
            cancel.cancel();
            debug!(session_id, "client disconnected mid-turn");
            return;
        }
    };

    match result {
        Ok(outcome) => {
            let ai_message = match state
                .store
                .add_message(NewMessage {
                    user_id: outcome.message.user_id,
                    session_id,
                    role: Role::Assistant,
                    content: outcome.message.content.clone(),
                })
                .await
            {
                Ok(msg) => msg,
                Err(err) => {
                    let worker_err: WorkerError = err.into();
                    let (_, message) = problem_details::classify(&worker_err);
                    let _ = tx.send(json_event(sse::ERROR, &ErrorPayload { message })).await;
                    return;
                }
            };

            let done = json_event(
                sse::DONE,
                &DonePayload {
                    user_message: (&user_message).into(),
                    ai_message: (&ai_message).into(),
                    title: outcome.title,
                },
            );
            let _ = tx.send(done).await;
        }
        Err(err) => {
            // A cancellation caused by the client going away has no one
            // left to tell.
            if matches!(err, WorkerError::Cancelled) && tx.is_closed() {
                debug!(session_id, "stream cancelled by client disconnect");
                return;
            }
            let (_, message) = problem_details::classify(&err);
            let _ = tx.send(json_event(sse::ERROR, &ErrorPayload { message })).await;
        }
    }
}

fn stream_event(content: String) -> Event {
    json_event(sse::STREAM, &StreamPayload { content })
}

fn json_event(name: &'static str, payload: &impl serde::Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|_| Event::default().event(name).data("{}"))
}

/// DELETE /api/v1/sessions/{session_id}
pub async fn delete_session(
    State(state): State<AppState>,
    PathExtract(session_id): PathExtract<i64>,
    Query(query): Query<UserQuery>,
) -> Response {
    if let Err(err) = state.store.delete_session(query.user_id, session_id).await {
        return problem_details::from_worker_error(&err.into());
    }
    state.manager.purge(query.user_id, session_id).await;
    StatusCode::NO_CONTENT.into_response()
}

/// DELETE /api/v1/sessions/{session_id}/files
pub async fn invalidate_files(
    State(state): State<AppState>,
    PathExtract(session_id): PathExtract<i64>,
    Query(query): Query<UserQuery>,
) -> Response {
    state
        .manager
        .invalidate_temp_files(query.user_id, session_id)
        .await;
    StatusCode::NO_CONTENT.into_response()
}

/// POST /api/v1/users/{user_id}/reset
pub async fn reset_user(
    State(state): State<AppState>,
    PathExtract(user_id): PathExtract<i64>,
) -> Response {
    state.manager.reset_user(user_id).await;
    StatusCode::NO_CONTENT.into_response()
}
