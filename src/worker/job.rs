//! Job types flowing from the manager through the dispatcher to workers.

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::error::WorkerError;
use crate::models::{Message, Session};

/// Identifies one session-bound operation for one user.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: i64,
    /// Positive for an existing session, `0` to create a new one. Negative
    /// pending ids are assigned internally and never accepted on the wire.
    pub session_id: i64,
    pub provider: String,
    pub model: String,
    pub token: String,
    /// Cancellation context; provider and store calls observe it.
    pub cancel: CancellationToken,
}

/// The chunk receiver went away; the stream aborts.
#[derive(Debug, Error)]
#[error("chunk receiver closed")]
pub struct ChunkSendError;

/// Caller-supplied sink for incremental output.
///
/// Invoked once per token batch with the cumulative assistant text. The
/// future resolves when the chunk is delivered, which is what throttles the
/// provider when the caller is slow.
pub type ChunkFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), ChunkSendError>> + Send + Sync>;

/// One streaming turn: the incoming user message plus the chunk sink.
#[derive(Clone)]
pub struct StreamRequest {
    pub session: SessionRequest,
    pub message: Message,
    /// Attachments referenced by this turn.
    pub file_ids: Vec<i64>,
    pub chunk_fn: ChunkFn,
}

/// What a completed streaming turn hands back to the caller.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub message: Message,
    /// Set only when this turn generated a fresh session title.
    pub title: Option<String>,
}

/// A unit of work handed to a worker. Consumed exactly once.
pub(crate) enum Job {
    Init {
        req: SessionRequest,
        reply: oneshot::Sender<Result<Session, WorkerError>>,
    },
    Stream {
        req: StreamRequest,
        reply: oneshot::Sender<Result<StreamOutcome, WorkerError>>,
    },
    /// Internal retirement signal; sent by the pool, never queued.
    Stop,
}

impl Job {
    pub(crate) fn user_id(&self) -> i64 {
        match self {
            Job::Init { req, .. } => req.user_id,
            Job::Stream { req, .. } => req.session.user_id,
            Job::Stop => 0,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Job::Init { .. } => "init",
            Job::Stream { .. } => "stream",
            Job::Stop => "stop",
        }
    }
}
