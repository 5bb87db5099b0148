//! Common wire types for chat completions.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use super::error::LlmError;
use crate::models::{Message, Role};

/// A chat completion request (OpenAI-compatible shape).
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// A role/content pair as providers expect it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Convert a stored conversation history into wire messages.
#[must_use]
pub fn to_wire(history: &[Message]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|m| ChatMessage::new(m.role, m.content.clone()))
        .collect()
}

/// Events emitted during a streaming chat completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A batch of content tokens from the assistant.
    Token(String),
    /// The provider closed the stream.
    Done,
}

/// A boxed stream of streaming events.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn chat_request_serialization() {
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![
                ChatMessage::new(Role::System, "You are a helpful assistant."),
                ChatMessage::new(Role::User, "Hello!"),
            ],
            temperature: Some(0.7),
            max_tokens: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"model\":\"gpt-4o\""));
        assert!(json.contains("\"role\":\"system\""));
        assert!(json.contains("\"temperature\":0.7"));
        assert!(!json.contains("max_tokens"));
    }

    #[test]
    fn to_wire_keeps_order_and_roles() {
        let history = vec![
            Message {
                id: 1,
                user_id: 1,
                session_id: 1,
                role: Role::System,
                content: "summary".to_string(),
                created_at: Utc::now(),
            },
            Message {
                id: 2,
                user_id: 1,
                session_id: 1,
                role: Role::User,
                content: "hi".to_string(),
                created_at: Utc::now(),
            },
        ];
        let wire = to_wire(&history);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, Role::System);
        assert_eq!(wire[1].content, "hi");
    }
}
