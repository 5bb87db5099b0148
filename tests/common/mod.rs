//! Shared test doubles for the integration suite.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use unichat::llm::{
    ChatModel, ChatStream, LlmError, ProviderFactory, SessionClients, StreamEvent, TitleModel,
};
use unichat::models::Message;
use unichat::worker::{ChunkFn, DispatcherConfig, SessionRequest, StreamRequest};

/// Gate handle for providers configured to block mid-stream.
pub struct Gate {
    pub started: Arc<Notify>,
    release_tx: watch::Sender<bool>,
    release_rx: watch::Receiver<bool>,
}

impl Gate {
    fn new() -> Self {
        let (release_tx, release_rx) = watch::channel(false);
        Self {
            started: Arc::new(Notify::new()),
            release_tx,
            release_rx,
        }
    }

    pub fn release(&self) {
        let _ = self.release_tx.send(true);
    }
}

/// Provider factory double. Echoes the last user message back as the
/// assistant reply in two token batches; providers registered with
/// [`FakeFactory::block_provider`] stall after signalling `started` until
/// their gate is released.
pub struct FakeFactory {
    pub builds: AtomicUsize,
    pub title_calls: Arc<AtomicUsize>,
    pub summary_calls: Arc<AtomicUsize>,
    pub served: Arc<Mutex<Vec<String>>>,
    title: String,
    summary: String,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl FakeFactory {
    pub fn new(title: &str) -> Arc<Self> {
        Arc::new(Self {
            builds: AtomicUsize::new(0),
            title_calls: Arc::new(AtomicUsize::new(0)),
            summary_calls: Arc::new(AtomicUsize::new(0)),
            served: Arc::new(Mutex::new(Vec::new())),
            title: title.to_string(),
            summary: "key points of the document".to_string(),
            gates: Mutex::new(HashMap::new()),
        })
    }

    /// Make every chat stream for `provider` block until the returned gate
    /// is released.
    pub fn block_provider(&self, provider: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.gates
            .lock()
            .unwrap()
            .insert(provider.to_string(), gate.clone());
        gate
    }

    pub fn summary_text(&self) -> &str {
        &self.summary
    }
}

impl ProviderFactory for FakeFactory {
    fn build(&self, provider: &str, _model: &str, _token: &str) -> Result<SessionClients, LlmError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().get(provider).cloned();
        let chat: Arc<dyn ChatModel> = Arc::new(EchoChat {
            served: self.served.clone(),
            gate,
        });
        let assist: Arc<dyn TitleModel> = Arc::new(FakeAssist {
            title: self.title.clone(),
            summary: self.summary.clone(),
            title_calls: self.title_calls.clone(),
            summary_calls: self.summary_calls.clone(),
        });
        Ok(SessionClients { chat, assist })
    }
}

struct EchoChat {
    served: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Gate>>,
}

#[async_trait]
impl ChatModel for EchoChat {
    async fn stream(&self, history: &[Message]) -> Result<ChatStream, LlmError> {
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            let mut release = gate.release_rx.clone();
            while !*release.borrow() {
                if release.changed().await.is_err() {
                    break;
                }
            }
        }

        let last = history.last().map(|m| m.content.clone()).unwrap_or_default();
        self.served.lock().unwrap().push(last.clone());
        Ok(Box::pin(stream::iter(vec![
            Ok(StreamEvent::Token("ai: ".to_string())),
            Ok(StreamEvent::Token(last)),
            Ok(StreamEvent::Done),
        ])))
    }
}

struct FakeAssist {
    title: String,
    summary: String,
    title_calls: Arc<AtomicUsize>,
    summary_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TitleModel for FakeAssist {
    async fn generate_title(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.title_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.title.clone())
    }

    async fn summarize_file(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.summary.clone())
    }
}

pub fn test_config(min: usize, max: usize, queue: usize) -> DispatcherConfig {
    DispatcherConfig {
        min_workers: min,
        max_workers: max,
        queue_size: queue,
        worker_idle_timeout: Duration::from_secs(60),
        ..Default::default()
    }
}

pub fn session_req(user_id: i64, session_id: i64, provider: &str) -> SessionRequest {
    SessionRequest {
        user_id,
        session_id,
        provider: provider.to_string(),
        model: "m1".to_string(),
        token: "tok".to_string(),
        cancel: CancellationToken::new(),
    }
}

pub fn noop_chunk() -> ChunkFn {
    let chunk_fn: ChunkFn = Arc::new(|_chunk| Box::pin(async { Ok(()) }));
    chunk_fn
}

/// A chunk sink that records every cumulative text it receives.
pub fn collecting_chunk() -> (ChunkFn, Arc<Mutex<Vec<String>>>) {
    let chunks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = chunks.clone();
    let chunk_fn: ChunkFn = Arc::new(move |chunk| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(chunk);
            Ok(())
        })
    });
    (chunk_fn, chunks)
}

pub fn stream_req(
    user_id: i64,
    session_id: i64,
    provider: &str,
    content: &str,
    chunk_fn: ChunkFn,
) -> StreamRequest {
    StreamRequest {
        session: session_req(user_id, session_id, provider),
        message: Message::unsaved(
            user_id,
            session_id,
            unichat::models::Role::User,
            content,
        ),
        file_ids: Vec::new(),
        chunk_fn,
    }
}
