//! Error taxonomy for the worker core.

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// Errors surfaced by manager operations.
///
/// Executors catch nothing: the first failure travels through the job reply
/// channel unchanged and the HTTP layer classifies it into a transport code.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Missing or invalid identifiers, empty content, negative ids on the wire.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Unknown session, message, or file, or a user-mismatched id.
    #[error("not found: {0}")]
    NotFound(String),

    /// User mismatch or missing token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Provider factory failure or missing credentials.
    #[error("provider resources unavailable: {0}")]
    Resource(String),

    /// Chat, title, or summary call failure.
    #[error("provider call failed: {0}")]
    Provider(String),

    /// Admission deadline exceeded.
    #[error("dispatcher is busy")]
    DispatcherBusy,

    /// Caller context cancelled or per-turn deadline expired.
    #[error("cancelled")]
    Cancelled,

    /// Underlying store failure not classifiable above.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl WorkerError {
    pub(crate) fn resource(err: LlmError) -> Self {
        WorkerError::Resource(err.to_string())
    }

    pub(crate) fn provider(err: LlmError) -> Self {
        WorkerError::Provider(err.to_string())
    }
}

impl From<StoreError> for WorkerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => WorkerError::NotFound(what),
            StoreError::Unavailable(why) => WorkerError::Persistence(why),
        }
    }
}
