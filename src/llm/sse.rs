//! Minimal SSE decoder for provider streaming responses.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use super::error::LlmError;

/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// Concatenated `data:` lines.
    pub data: String,
}

/// Decodes a byte stream into [`SseEvent`]s.
///
/// Handles events split across network chunks and multiple events per
/// chunk. Comment lines and unknown fields are ignored.
pub struct SseEventStream<S> {
    inner: S,
    buffer: String,
    done: bool,
}

impl<S> SseEventStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
            done: false,
        }
    }

    /// Pop one complete event (terminated by a blank line) from the buffer.
    fn pop_event(&mut self) -> Option<SseEvent> {
        let boundary = self.buffer.find("\n\n")?;
        let raw: String = self.buffer.drain(..boundary + 2).collect();

        let mut event = SseEvent::default();
        for line in raw.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event.event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                if !event.data.is_empty() {
                    event.data.push('\n');
                }
                event.data.push_str(value.strip_prefix(' ').unwrap_or(value));
            }
        }
        Some(event)
    }
}

impl<S> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pop_event() {
                return Poll::Ready(Some(Ok(event)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(LlmError::Request(e))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    // Flush a trailing event that was never terminated.
                    if !self.buffer.trim().is_empty() {
                        self.buffer.push_str("\n\n");
                        continue;
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
