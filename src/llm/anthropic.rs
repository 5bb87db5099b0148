//! Anthropic chat client using the native messages API.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;

use super::error::LlmError;
use super::provider::{ChatModel, TitleModel, summary_prompt, title_prompt};
use super::sse::SseEventStream;
use super::types::{ChatMessage, ChatStream, StreamEvent, to_wire};
use crate::models::{Message, Role};

const DEFAULT_MAX_TOKENS: u32 = 3000;

pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_version: String,
    model: String,
}

impl AnthropicClient {
    pub const DEFAULT_API_VERSION: &'static str = "2023-06-01";

    #[must_use]
    pub fn new(client: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            api_version: Self::DEFAULT_API_VERSION.to_string(),
            model,
        }
    }

    async fn send(&self, request: &Request) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }
        Ok(response)
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
        let request = to_request(&self.model, &messages, None);
        let response = self.send(&request).await?;
        let body: Response = response.json().await?;
        Ok(body
            .content
            .into_iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait]
impl ChatModel for AnthropicClient {
    async fn stream(&self, history: &[Message]) -> Result<ChatStream, LlmError> {
        let request = to_request(&self.model, &to_wire(history), Some(true));
        let response = self.send(&request).await?;
        let events = SseEventStream::new(response.bytes_stream());
        Ok(Box::pin(StreamAdapter {
            inner: events,
            done: false,
        }))
    }
}

#[async_trait]
impl TitleModel for AnthropicClient {
    async fn generate_title(&self, messages: &[Message]) -> Result<String, LlmError> {
        let title = self.complete(title_prompt(messages)).await?;
        Ok(title.trim().to_string())
    }

    async fn summarize_file(&self, messages: &[Message]) -> Result<String, LlmError> {
        let summary = self.complete(summary_prompt(messages)).await?;
        Ok(summary.trim().to_string())
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(serde::Serialize)]
struct Request {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(serde::Serialize)]
struct RequestMessage {
    role: String,
    content: String,
}

#[derive(serde::Deserialize)]
struct Response {
    content: Vec<Content>,
}

#[derive(serde::Deserialize)]
struct Content {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

/// Anthropic folds system prompts into a top-level field and only accepts
/// user/assistant roles in the messages array.
fn to_request(model: &str, messages: &[ChatMessage], stream: Option<bool>) -> Request {
    let mut system: Option<String> = None;
    let mut wire = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => match system {
                Some(ref mut s) => {
                    s.push('\n');
                    s.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User => wire.push(RequestMessage {
                role: "user".to_string(),
                content: msg.content.clone(),
            }),
            Role::Assistant => wire.push(RequestMessage {
                role: "assistant".to_string(),
                content: msg.content.clone(),
            }),
        }
    }

    Request {
        model: model.to_string(),
        max_tokens: DEFAULT_MAX_TOKENS,
        system,
        messages: wire,
        stream,
    }
}

// ============================================================================
// Streaming
// ============================================================================

struct StreamAdapter<S> {
    inner: SseEventStream<S>,
    done: bool,
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<StreamEvent, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if event.data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AnthropicStreamEvent>(&event.data) {
                        Ok(AnthropicStreamEvent::ContentBlockDelta { delta }) => {
                            if let Some(text) = delta.text
                                && !text.is_empty()
                            {
                                return Poll::Ready(Some(Ok(StreamEvent::Token(text))));
                            }
                        }
                        Ok(AnthropicStreamEvent::MessageStop) => {
                            self.done = true;
                            return Poll::Ready(Some(Ok(StreamEvent::Done)));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(
                                data = %event.data,
                                error = %e,
                                "failed to parse Anthropic stream event"
                            );
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(Some(Ok(StreamEvent::Done)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    ContentBlockDelta {
        delta: Delta,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(serde::Deserialize)]
struct Delta {
    text: Option<String>,
}
