//! Shared API types used by the HTTP handlers.
//!
//! These types define the wire contract of the streaming protocol; changes
//! here affect clients, so the event names and payload shapes are kept in
//! one place.

use serde::{Deserialize, Serialize};

use crate::models::{Message, Session};

// ============================================================================
// SSE Event Names
// ============================================================================

/// SSE event type names used in streaming responses.
pub mod sse {
    /// Carries the persisted user message, before the turn starts.
    pub const ACK: &str = "ack";
    /// Carries the cumulative assistant text.
    pub const STREAM: &str = "stream";
    /// Terminal event with both persisted messages and an optional title.
    pub const DONE: &str = "done";
    /// Terminal event carrying an error message.
    pub const ERROR: &str = "error";
}

// ============================================================================
// Session Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InitSessionRequest {
    pub user_id: i64,
    /// `0` (or absent) creates a new session.
    #[serde(default)]
    pub session_id: i64,
    pub provider: String,
    pub model: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id,
            title: session.title.clone(),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

// ============================================================================
// Streaming Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamChatRequest {
    pub user_id: i64,
    pub provider: String,
    pub model: String,
    pub token: String,
    pub content: String,
    #[serde(default)]
    pub file_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    pub id: i64,
    pub user_id: i64,
    pub session_id: i64,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

impl From<&Message> for MessagePayload {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            user_id: msg.user_id,
            session_id: msg.session_id,
            role: msg.role.to_string(),
            content: msg.content.clone(),
            created_at: msg.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AckPayload {
    pub message: MessagePayload,
}

#[derive(Debug, Serialize)]
pub struct StreamPayload {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct DonePayload {
    pub user_message: MessagePayload,
    pub ai_message: MessagePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

// ============================================================================
// File Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UploadFileRequest {
    pub user_id: i64,
    pub file_name: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct UploadFileResponse {
    pub file_id: i64,
}

#[derive(Debug, Serialize)]
pub struct StorageUsageResponse {
    pub used_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_payload_omits_absent_title() {
        let msg = MessagePayload {
            id: 1,
            user_id: 1,
            session_id: 1,
            role: "user".to_string(),
            content: "hi".to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
        };
        let payload = DonePayload {
            user_message: msg.clone(),
            ai_message: msg,
            title: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("title"));
    }

    #[test]
    fn init_request_defaults_session_id_to_zero() {
        let req: InitSessionRequest = serde_json::from_str(
            r#"{"user_id":1,"provider":"openai","model":"gpt-4o","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(req.session_id, 0);
    }
}
