//! OpenAI-compatible chat client.
//!
//! Serves both the `openai` provider and `gemini` through its
//! OpenAI-compatible endpoint.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::Deserialize;

use super::error::LlmError;
use super::provider::{ChatModel, TitleModel, summary_prompt, title_prompt};
use super::sse::SseEventStream;
use super::types::{ChatMessage, ChatRequest, ChatStream, StreamEvent, to_wire};
use crate::models::Message;

pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleClient {
    #[must_use]
    pub fn new(client: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
        }
    }

    async fn send(&self, request: &impl serde::Serialize) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
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

    /// Non-streaming completion; returns the first choice's content.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
        let request = ChatRequest::new(self.model.clone(), messages);
        let response = self.send(&request).await?;
        let body: CompletionResponse = response.json().await?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleClient {
    async fn stream(&self, history: &[Message]) -> Result<ChatStream, LlmError> {
        let request = StreamRequest {
            model: self.model.clone(),
            messages: to_wire(history),
            stream: true,
        };
        let response = self.send(&request).await?;
        let events = SseEventStream::new(response.bytes_stream());
        Ok(Box::pin(StreamAdapter {
            inner: events,
            done: false,
        }))
    }
}

#[async_trait]
impl TitleModel for OpenAiCompatibleClient {
    async fn generate_title(&self, messages: &[Message]) -> Result<String, LlmError> {
        let title = self.complete(title_prompt(messages)).await?;
        Ok(title.trim().to_string())
    }

    async fn summarize_file(&self, messages: &[Message]) -> Result<String, LlmError> {
        let summary = self.complete(summary_prompt(messages)).await?;
        Ok(summary.trim().to_string())
    }
}

#[derive(serde::Serialize)]
struct StreamRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Converts decoded SSE events into [`StreamEvent`]s.
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
                    if event.data == "[DONE]" {
                        self.done = true;
                        return Poll::Ready(Some(Ok(StreamEvent::Done)));
                    }
                    match serde_json::from_str::<StreamChunk>(&event.data) {
                        Ok(chunk) => {
                            if let Some(content) = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta.content)
                                && !content.is_empty()
                            {
                                return Poll::Ready(Some(Ok(StreamEvent::Token(content))));
                            }
                            // Chunks without content (role prelude, finish markers).
                        }
                        Err(e) => {
                            tracing::debug!(data = %event.data, error = %e, "failed to parse stream chunk");
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

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
