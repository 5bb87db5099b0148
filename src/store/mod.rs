//! Persistence collaborator consumed by the worker core.
//!
//! The worker never talks to a database directly; everything goes through
//! the [`Store`] trait so the SQL layer stays swappable. [`MemoryStore`]
//! is the reference implementation used by the server wiring and tests.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Message, Role, Session, TempFile};

/// Errors surfaced by the persistence layer.
///
/// `NotFound` is a distinguishable sentinel: callers rely on it to tell a
/// missing or foreign-owned row apart from an infrastructure failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row does not exist, or exists under a different user.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying store failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A message about to be persisted (the store assigns id and timestamp).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
}

/// Persistence operations the worker core depends on.
///
/// Ownership is enforced here: every session- or file-scoped read takes the
/// caller's user id and answers `NotFound` on a mismatch.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, user_id: i64, title: &str) -> Result<Session, StoreError>;

    async fn get_session_with_messages(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<(Session, Vec<Message>), StoreError>;

    async fn update_session_title(
        &self,
        user_id: i64,
        session_id: i64,
        title: &str,
    ) -> Result<(), StoreError>;

    async fn add_message(&self, msg: NewMessage) -> Result<Message, StoreError>;

    async fn delete_session(&self, user_id: i64, session_id: i64) -> Result<(), StoreError>;

    /// List a session's attachments, excluding expired ones.
    async fn list_session_temp_files(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<Vec<TempFile>, StoreError>;

    /// Fetch specific attachments by id. Any unknown, expired, or
    /// foreign-owned id fails the whole call with `NotFound`.
    async fn get_temp_files_by_ids(
        &self,
        user_id: i64,
        session_id: i64,
        ids: &[i64],
    ) -> Result<Vec<TempFile>, StoreError>;

    async fn update_temp_file_summary(
        &self,
        file_id: i64,
        summary: &str,
        message_id: i64,
    ) -> Result<(), StoreError>;

    /// Record an uploaded file and return its id.
    #[allow(clippy::too_many_arguments)]
    async fn record_temp_file(
        &self,
        user_id: i64,
        session_id: i64,
        file_name: &str,
        stored_path: &str,
        mime_type: &str,
        size: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Total bytes of live (unexpired) uploads for a user.
    async fn temp_storage_usage(&self, user_id: i64) -> Result<i64, StoreError>;
}
