//! In-memory reference store.
//!
//! Backs the test suite and the standalone server. Ids are monotonic per
//! table, message timestamps never decrease within a session, and all
//! ownership checks mirror what the SQL layer enforces.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Message, Session, TempFile};

use super::{NewMessage, Store, StoreError};

#[derive(Default)]
struct Tables {
    next_session_id: i64,
    next_message_id: i64,
    next_file_id: i64,
    sessions: HashMap<i64, Session>,
    messages: HashMap<i64, Vec<Message>>,
    files: HashMap<i64, TempFile>,
}

/// Thread-safe in-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted messages in a session, for test assertions.
    pub fn message_count(&self, session_id: i64) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.messages.get(&session_id).map_or(0, Vec::len)
    }

    /// Number of persisted sessions, for test assertions.
    pub fn session_count(&self) -> usize {
        self.tables.lock().unwrap().sessions.len()
    }
}

fn owned_session<'a>(
    tables: &'a Tables,
    user_id: i64,
    session_id: i64,
) -> Result<&'a Session, StoreError> {
    match tables.sessions.get(&session_id) {
        Some(session) if session.user_id == user_id => Ok(session),
        _ => Err(StoreError::NotFound(format!("session {session_id}"))),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, user_id: i64, title: &str) -> Result<Session, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        tables.next_session_id += 1;
        let now = Utc::now();
        let session = Session {
            id: tables.next_session_id,
            user_id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session_with_messages(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<(Session, Vec<Message>), StoreError> {
        let tables = self.tables.lock().unwrap();
        let session = owned_session(&tables, user_id, session_id)?.clone();
        let messages = tables.messages.get(&session_id).cloned().unwrap_or_default();
        Ok((session, messages))
    }

    async fn update_session_title(
        &self,
        user_id: i64,
        session_id: i64,
        title: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        owned_session(&tables, user_id, session_id)?;
        if let Some(session) = tables.sessions.get_mut(&session_id) {
            session.title = title.to_string();
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn add_message(&self, msg: NewMessage) -> Result<Message, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        owned_session(&tables, msg.user_id, msg.session_id)?;
        tables.next_message_id += 1;
        let id = tables.next_message_id;

        // Keep created_at non-decreasing within the session even if the
        // wall clock steps backwards between appends.
        let mut created_at = Utc::now();
        if let Some(last) = tables
            .messages
            .get(&msg.session_id)
            .and_then(|m| m.last())
            && last.created_at > created_at
        {
            created_at = last.created_at;
        }

        let message = Message {
            id,
            user_id: msg.user_id,
            session_id: msg.session_id,
            role: msg.role,
            content: msg.content,
            created_at,
        };
        tables
            .messages
            .entry(msg.session_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn delete_session(&self, user_id: i64, session_id: i64) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        owned_session(&tables, user_id, session_id)?;
        tables.sessions.remove(&session_id);
        tables.messages.remove(&session_id);
        tables.files.retain(|_, f| f.session_id != session_id);
        Ok(())
    }

    async fn list_session_temp_files(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Result<Vec<TempFile>, StoreError> {
        let now = Utc::now();
        let tables = self.tables.lock().unwrap();
        owned_session(&tables, user_id, session_id)?;
        let mut files: Vec<TempFile> = tables
            .files
            .values()
            .filter(|f| f.session_id == session_id && f.user_id == user_id && !f.expired(now))
            .cloned()
            .collect();
        files.sort_by_key(|f| f.id);
        Ok(files)
    }

    async fn get_temp_files_by_ids(
        &self,
        user_id: i64,
        session_id: i64,
        ids: &[i64],
    ) -> Result<Vec<TempFile>, StoreError> {
        let now = Utc::now();
        let tables = self.tables.lock().unwrap();
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            match tables.files.get(id) {
                Some(f)
                    if f.user_id == user_id && f.session_id == session_id && !f.expired(now) =>
                {
                    files.push(f.clone());
                }
                _ => return Err(StoreError::NotFound(format!("temp file {id}"))),
            }
        }
        Ok(files)
    }

    async fn update_temp_file_summary(
        &self,
        file_id: i64,
        summary: &str,
        message_id: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let file = tables
            .files
            .get_mut(&file_id)
            .ok_or_else(|| StoreError::NotFound(format!("temp file {file_id}")))?;
        file.summary = summary.to_string();
        file.summary_message_id = message_id;
        Ok(())
    }

    async fn record_temp_file(
        &self,
        user_id: i64,
        session_id: i64,
        file_name: &str,
        stored_path: &str,
        mime_type: &str,
        size: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        owned_session(&tables, user_id, session_id)?;
        tables.next_file_id += 1;
        let id = tables.next_file_id;
        tables.files.insert(
            id,
            TempFile {
                id,
                user_id,
                session_id,
                file_name: file_name.to_string(),
                stored_path: stored_path.to_string(),
                mime_type: mime_type.to_string(),
                size,
                status: "ready".to_string(),
                summary: String::new(),
                summary_message_id: 0,
                created_at: Utc::now(),
                expires_at,
            },
        );
        Ok(id)
    }

    async fn temp_storage_usage(&self, user_id: i64) -> Result<i64, StoreError> {
        let now = Utc::now();
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .files
            .values()
            .filter(|f| f.user_id == user_id && !f.expired(now))
            .map(|f| f.size)
            .sum())
    }
}
