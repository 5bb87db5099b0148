//! Domain types shared by the store, the worker core, and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ordered, titled conversation belonging to one user.
///
/// Sessions persisted by the store always carry a positive id. While an
/// `init` job is in flight for a brand-new session the manager tracks it
/// under a negative pending id; that id never leaves the worker core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message within a session's history.
///
/// Messages are append-only: once persisted they are never mutated, and
/// within one session `created_at` is non-decreasing in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub user_id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build an unpersisted message (id 0) with the current timestamp.
    #[must_use]
    pub fn unsaved(user_id: i64, session_id: i64, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id,
            session_id,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// A user-uploaded temporary document referenced by id in stream requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempFile {
    pub id: i64,
    pub user_id: i64,
    pub session_id: i64,
    pub file_name: String,
    pub stored_path: String,
    pub mime_type: String,
    pub size: i64,
    pub status: String,
    pub summary: String,
    pub summary_message_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TempFile {
    /// Whether the file's TTL has elapsed.
    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn role_serialization() {
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(
            serde_json::from_str::<Role>("\"assistant\"").unwrap(),
            Role::Assistant
        );
    }

    #[test]
    fn unsaved_message_has_no_id() {
        let msg = Message::unsaved(1, 2, Role::User, "hello");
        assert_eq!(msg.id, 0);
        assert_eq!(msg.user_id, 1);
        assert_eq!(msg.session_id, 2);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn temp_file_expiry() {
        let now = Utc::now();
        let mut file = TempFile {
            id: 1,
            user_id: 1,
            session_id: 1,
            file_name: "notes.txt".to_string(),
            stored_path: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            size: 12,
            status: "ready".to_string(),
            summary: String::new(),
            summary_message_id: 0,
            created_at: now,
            expires_at: now + Duration::hours(1),
        };
        assert!(!file.expired(now));
        file.expires_at = now - Duration::seconds(1);
        assert!(file.expired(now));
    }
}
