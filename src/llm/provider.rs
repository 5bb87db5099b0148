//! Capability traits implemented by provider clients.

use async_trait::async_trait;

use super::error::LlmError;
use super::types::{ChatMessage, ChatStream};
use crate::models::{Message, Role};

/// Streaming chat completion over a conversation history.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Open a token stream for the given history. Dropping the returned
    /// stream closes the provider connection.
    async fn stream(&self, history: &[Message]) -> Result<ChatStream, LlmError>;
}

/// Auxiliary completions: conversation titles and file summaries.
#[async_trait]
pub trait TitleModel: Send + Sync {
    /// Generate a short title for the conversation. May return an empty
    /// string, which callers treat as "keep the previous title".
    async fn generate_title(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// Summarize a document passed as user-role messages.
    async fn summarize_file(&self, messages: &[Message]) -> Result<String, LlmError>;
}

const TITLE_SYSTEM_PROMPT: &str = "You are a conversation title generator. \
    Based on the dialogue between the user and the AI, generate a concise and accurate \
    title for the conversation. The title should be within 10 characters and summarize \
    the main topic of the conversation. Output only the title; do not include any \
    additional content.";

const SUMMARY_SYSTEM_PROMPT: &str = "You are a helpful assistant that summarizes user \
    provided documents. Produce a concise summary highlighting the key points and \
    important details. Limit the summary to 6 sentences.";

fn transcript(messages: &[Message]) -> String {
    let mut text = String::new();
    for msg in messages {
        match msg.role {
            Role::User => {
                text.push_str(&format!("User: {}\n", msg.content));
            }
            Role::Assistant => {
                text.push_str(&format!("Assistant: {}\n", msg.content));
            }
            Role::System => {}
        }
    }
    text
}

/// Build the title-generation prompt from conversation messages.
#[must_use]
pub(super) fn title_prompt(messages: &[Message]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new(Role::System, TITLE_SYSTEM_PROMPT),
        ChatMessage::new(
            Role::User,
            format!(
                "Please generate a clean title using following conversation messages:\n\n{}",
                transcript(messages)
            ),
        ),
    ]
}

/// Build the file-summary prompt from document content messages.
#[must_use]
pub(super) fn summary_prompt(messages: &[Message]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new(Role::System, SUMMARY_SYSTEM_PROMPT),
        ChatMessage::new(
            Role::User,
            format!("Document Content:\n{}\n", transcript(messages)),
        ),
    ]
}
