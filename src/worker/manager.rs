//! Manager: public entrypoints plus the task executor running on workers.
//!
//! The manager is the sole owner of the dispatcher, the pool behind it, and
//! the per-user state registry. Public operations validate, enqueue a job,
//! and block on its oneshot reply; the executor methods run inside worker
//! tasks and are the only code touching `UserState`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{InvalidateMessage, Scope, StateCache};
use super::dispatcher::Dispatcher;
use super::error::WorkerError;
use super::job::{Job, SessionRequest, StreamOutcome, StreamRequest};
use super::pool::JobRunner;
use super::state::{ResourceKey, SessionResources, UserState};
use crate::cache::CacheBus;
use crate::files::FileLoader;
use crate::llm::{ProviderFactory, StreamEvent};
use crate::models::{Message, Role, Session, TempFile};
use crate::store::{NewMessage, Store};

const NEW_CONVERSATION_TITLE: &str = "New Conversation";

const DEFAULT_MIN_WORKERS: usize = 3;
const DEFAULT_MAX_WORKERS: usize = 10;
const DEFAULT_QUEUE_SIZE: usize = 100;
const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Pending-id sequence, one per process. Ids count down from -1 so they can
/// never collide with store-assigned session ids.
static PENDING_SEQ: AtomicI64 = AtomicI64::new(0);

fn next_pending_id() -> i64 {
    -(PENDING_SEQ.fetch_add(1, Ordering::Relaxed) + 1)
}

/// Tuning knobs for the dispatcher, pool, and admission control.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub worker_idle_timeout: Duration,
    pub enqueue_timeout: Duration,
    /// Upper bound on one streaming turn.
    pub stream_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            worker_idle_timeout: DEFAULT_WORKER_IDLE_TIMEOUT,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

impl DispatcherConfig {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.min_workers == 0 {
            self.min_workers = defaults.min_workers;
        }
        if self.max_workers == 0 {
            self.max_workers = defaults.max_workers;
        }
        if self.max_workers < self.min_workers {
            self.max_workers = self.min_workers;
        }
        if self.queue_size == 0 {
            self.queue_size = defaults.queue_size;
        }
        if self.worker_idle_timeout.is_zero() {
            self.worker_idle_timeout = defaults.worker_idle_timeout;
        }
        if self.stream_timeout.is_zero() {
            self.stream_timeout = defaults.stream_timeout;
        }
        self
    }
}

/// Orchestrator for per-user streaming conversation work.
pub struct Manager {
    executor: Arc<TaskExecutor>,
    dispatcher: Arc<Dispatcher>,
    enqueue_timeout: Duration,
    stream_timeout: Duration,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(
        store: Arc<dyn Store>,
        factory: Arc<dyn ProviderFactory>,
        loader: FileLoader,
        cfg: DispatcherConfig,
    ) -> Arc<Self> {
        Self::build(store, factory, loader, cfg, None)
    }

    /// Like [`Manager::new`], with a cache bus for cross-replica
    /// invalidation and shared session state.
    pub fn with_cache(
        store: Arc<dyn Store>,
        factory: Arc<dyn ProviderFactory>,
        loader: FileLoader,
        cfg: DispatcherConfig,
        bus: Arc<dyn CacheBus>,
    ) -> Arc<Self> {
        Self::build(store, factory, loader, cfg, Some(Arc::new(StateCache::new(bus))))
    }

    fn build(
        store: Arc<dyn Store>,
        factory: Arc<dyn ProviderFactory>,
        loader: FileLoader,
        cfg: DispatcherConfig,
        cache: Option<Arc<StateCache>>,
    ) -> Arc<Self> {
        let cfg = cfg.normalized();
        let executor = Arc::new(TaskExecutor {
            states: DashMap::new(),
            store,
            factory,
            loader,
            cache,
        });
        let dispatcher = Dispatcher::new(
            cfg.min_workers,
            cfg.max_workers,
            cfg.queue_size,
            cfg.worker_idle_timeout,
            executor.clone(),
        );
        let shutdown = CancellationToken::new();

        if executor.cache.is_some() {
            tokio::spawn(run_invalidation_listener(executor.clone(), shutdown.clone()));
        }

        Arc::new(Self {
            executor,
            dispatcher,
            enqueue_timeout: cfg.enqueue_timeout,
            stream_timeout: cfg.stream_timeout,
            shutdown,
        })
    }

    /// Create or resume a session.
    ///
    /// `session_id == 0` creates a new session under an internal pending id
    /// which is promoted to the store-assigned id before this returns. A
    /// ready session short-circuits to the cached copy.
    pub async fn init_session(&self, mut req: SessionRequest) -> Result<Session, WorkerError> {
        if req.user_id <= 0 {
            return Err(WorkerError::Validation("user id required".to_string()));
        }
        if req.session_id < 0 {
            return Err(WorkerError::Validation(
                "session id must not be negative".to_string(),
            ));
        }
        if req.session_id == 0 {
            req.session_id = next_pending_id();
        }

        let state = self.executor.user_state(req.user_id);
        if req.session_id > 0
            && state.is_ready(req.session_id)
            && let Some(session) = state.get_session(req.session_id)
        {
            return Ok(session);
        }

        let cancel = req.cancel.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatcher
            .enqueue(Job::Init { req, reply: reply_tx }, self.enqueue_timeout)
            .await?;

        tokio::select! {
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            reply = reply_rx => reply
                .unwrap_or_else(|_| Err(WorkerError::Persistence("worker dropped reply".to_string()))),
        }
    }

    /// Run one streaming turn, emitting cumulative text through the
    /// request's chunk callback and returning the assistant message plus
    /// the freshly generated title, if any.
    pub async fn stream(&self, mut req: StreamRequest) -> Result<StreamOutcome, WorkerError> {
        if req.session.user_id <= 0 {
            return Err(WorkerError::Validation("user id required".to_string()));
        }
        if req.session.session_id < 0 {
            return Err(WorkerError::Validation(
                "session id must not be negative".to_string(),
            ));
        }
        if req.message.content.trim().is_empty() {
            return Err(WorkerError::Validation("message content required".to_string()));
        }

        let state = self.executor.user_state(req.session.user_id);
        if req.session.session_id == 0 || !state.is_ready(req.session.session_id) {
            let session = self.init_session(req.session.clone()).await?;
            req.session.session_id = session.id;
            req.message.session_id = session.id;
        }

        let cancel = req.session.cancel.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatcher
            .enqueue(Job::Stream { req, reply: reply_tx }, self.enqueue_timeout)
            .await?;

        tokio::select! {
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            reply = timeout(self.stream_timeout, reply_rx) => match reply {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(WorkerError::Persistence("worker dropped reply".to_string())),
                Err(_) => {
                    cancel.cancel();
                    Err(WorkerError::Cancelled)
                }
            },
        }
    }

    /// Drop one session's cached state.
    pub async fn purge(&self, user_id: i64, session_id: i64) {
        self.executor.purge(user_id, session_id).await;
    }

    /// Drop all of a user's cached state and cancel their queued jobs.
    pub async fn reset_user(&self, user_id: i64) {
        self.executor.reset_user(user_id).await;
        self.dispatcher.cancel_user(user_id);
    }

    /// Drop a session's attachment cache; the next stream re-reads from the
    /// store.
    pub async fn invalidate_temp_files(&self, user_id: i64, session_id: i64) {
        self.executor.invalidate_temp_files(user_id, session_id).await;
    }

    /// Retire all workers and stop the dispatcher and invalidation loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.dispatcher.shutdown();
    }
}

async fn run_invalidation_listener(executor: Arc<TaskExecutor>, shutdown: CancellationToken) {
    let Some(cache) = executor.cache.clone() else {
        return;
    };
    let Some(mut rx) = cache.subscribe().await else {
        return;
    };
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Ok(payload) => match serde_json::from_str::<InvalidateMessage>(&payload) {
                    Ok(inv) => executor.apply_invalidation(&inv),
                    Err(e) => warn!(error = %e, "invalidation decode failed"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "invalidation listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Run a future unless the request's cancellation fires first.
async fn checked<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, WorkerError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WorkerError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Executes init and stream jobs on worker tasks.
pub(crate) struct TaskExecutor {
    states: DashMap<i64, Arc<UserState>>,
    store: Arc<dyn Store>,
    factory: Arc<dyn ProviderFactory>,
    loader: FileLoader,
    cache: Option<Arc<StateCache>>,
}

#[async_trait]
impl JobRunner for TaskExecutor {
    async fn run(&self, job: Job) {
        match job {
            Job::Init { req, reply } => {
                let result = self.handle_init(req).await;
                let _ = reply.send(result);
            }
            Job::Stream { req, reply } => {
                let result = self.handle_stream(req).await;
                let _ = reply.send(result);
            }
            Job::Stop => {}
        }
    }
}

impl TaskExecutor {
    pub fn user_state(&self, user_id: i64) -> Arc<UserState> {
        self.states
            .entry(user_id)
            .or_insert_with(|| Arc::new(UserState::new()))
            .value()
            .clone()
    }

    async fn handle_init(&self, req: SessionRequest) -> Result<Session, WorkerError> {
        let state = self.user_state(req.user_id);
        let pending_id = req.session_id;

        let result = self.init_inner(&state, &req).await;
        if result.is_err() && pending_id < 0 {
            // Clear the pending slot so the caller can retry cleanly.
            state.purge_cache(pending_id);
        }
        result
    }

    async fn init_inner(
        &self,
        state: &UserState,
        req: &SessionRequest,
    ) -> Result<Session, WorkerError> {
        let cancel = &req.cancel;

        let (session, history) = if req.session_id <= 0 {
            let session = checked(
                cancel,
                self.store.create_session(req.user_id, NEW_CONVERSATION_TITLE),
            )
            .await??;
            (session, Vec::new())
        } else {
            self.load_session(cancel, req.user_id, req.session_id).await?
        };
        let real_id = session.id;

        self.ensure_resources(state, req, real_id)?;

        state.set_session(session.clone());
        state.set_history(real_id, history.clone());
        state.promote_session(req.session_id, real_id);
        state.mark_ready(real_id);
        debug!(user_id = req.user_id, session_id = real_id, "session ready");

        if let Some(cache) = &self.cache {
            cache.cache_session(&session, &history).await;
        }
        Ok(session)
    }

    /// Read path for existing sessions: distributed cache, then the store.
    /// (The local cache is consulted by the ready short-circuit upstream.)
    async fn load_session(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        session_id: i64,
    ) -> Result<(Session, Vec<Message>), WorkerError> {
        if let Some(cache) = &self.cache
            && let Some(found) = checked(cancel, cache.load_session(user_id, session_id)).await?
        {
            return Ok(found);
        }
        Ok(checked(cancel, self.store.get_session_with_messages(user_id, session_id)).await??)
    }

    async fn handle_stream(&self, req: StreamRequest) -> Result<StreamOutcome, WorkerError> {
        let user_id = req.session.user_id;
        let session_id = req.session.session_id;
        let cancel = req.session.cancel.clone();
        let state = self.user_state(user_id);

        // At most one streaming turn runs per session; a concurrent turn on
        // another worker waits here in dispatch order.
        let turn_lock = state.turn_lock(session_id);
        let _turn_permit = match checked(&cancel, turn_lock.acquire_owned()).await? {
            Ok(permit) => permit,
            Err(_) => return Err(WorkerError::Cancelled),
        };

        // Attachments come from the store every turn; the cache layers only
        // serve to shed them across replicas.
        let mut files = checked(
            &cancel,
            self.store.list_session_temp_files(user_id, session_id),
        )
        .await??;
        for id in &req.file_ids {
            if !files.iter().any(|f| f.id == *id) {
                return Err(WorkerError::NotFound(format!("temp file {id}")));
            }
        }
        state.set_files(session_id, files.clone());
        if let Some(cache) = &self.cache {
            cache.cache_files(session_id, &files).await;
        }

        let resources = self.ensure_resources(&state, &req.session, session_id)?;

        let mut history = state.get_history(session_id);
        let mut title = None;
        if !history.iter().any(|m| m.role == Role::User) {
            let generated = checked(
                &cancel,
                resources.assist.generate_title(std::slice::from_ref(&req.message)),
            )
            .await?
            .map_err(WorkerError::provider)?;

            if !generated.is_empty() {
                checked(
                    &cancel,
                    self.store.update_session_title(user_id, session_id, &generated),
                )
                .await??;
                if let Some(mut session) = state.get_session(session_id) {
                    session.title = generated.clone();
                    state.set_session(session);
                }
                if let Some(cache) = &self.cache {
                    cache.invalidate_session(session_id).await;
                    cache
                        .publish_invalidation(InvalidateMessage {
                            user_id,
                            session_id,
                            scope: Scope::Session,
                        })
                        .await;
                }
                title = Some(generated);
            }
        }

        if !req.file_ids.is_empty() {
            self.attach_file_summaries(&cancel, &state, &req, &resources, &mut files, &mut history)
                .await?;
            state.set_files(session_id, files.clone());
            if let Some(cache) = &self.cache {
                cache.cache_files(session_id, &files).await;
            }
        }

        // The persisted copy of the user message is written by the HTTP
        // layer before this job runs; only the in-memory history grows here.
        history.push(req.message.clone());
        state.set_history(session_id, history.clone());

        let mut stream = checked(&cancel, resources.chat.stream(&history))
            .await?
            .map_err(WorkerError::provider)?;

        let mut accumulated = String::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                event = stream.next() => event,
            };
            match event {
                Some(Ok(StreamEvent::Token(tokens))) => {
                    accumulated.push_str(&tokens);
                    let delivered = checked(&cancel, (req.chunk_fn)(accumulated.clone())).await?;
                    delivered.map_err(|_| WorkerError::Cancelled)?;
                }
                Some(Ok(StreamEvent::Done)) | None => break,
                Some(Err(e)) => return Err(WorkerError::provider(e)),
            }
        }

        let message = Message::unsaved(user_id, session_id, Role::Assistant, accumulated);
        state.append_history(session_id, message.clone());

        if let Some(cache) = &self.cache
            && let Some(session) = state.get_session(session_id)
        {
            cache.cache_session(&session, &state.get_history(session_id)).await;
        }

        Ok(StreamOutcome { message, title })
    }

    /// Compare the cached resource key against the request and rebuild the
    /// provider clients when any of (provider, model, token) changed.
    fn ensure_resources(
        &self,
        state: &UserState,
        req: &SessionRequest,
        session_id: i64,
    ) -> Result<Arc<SessionResources>, WorkerError> {
        if session_id <= 0 {
            return Err(WorkerError::Validation("session id required".to_string()));
        }
        let key = ResourceKey {
            provider: req.provider.clone(),
            model: req.model.clone(),
            token: req.token.clone(),
        };
        if let Some(resources) = state.get_resources(session_id)
            && resources.key == key
        {
            return Ok(resources);
        }

        let clients = self
            .factory
            .build(&req.provider, &req.model, &req.token)
            .map_err(WorkerError::resource)?;
        let resources = Arc::new(SessionResources {
            chat: clients.chat,
            assist: clients.assist,
            key,
        });
        state.set_resources(session_id, resources.clone());
        Ok(resources)
    }

    /// Summarize every referenced attachment that has no stored summary yet,
    /// persisting one system message per file and linking it back to the
    /// file record.
    async fn attach_file_summaries(
        &self,
        cancel: &CancellationToken,
        state: &UserState,
        req: &StreamRequest,
        resources: &SessionResources,
        files: &mut [TempFile],
        history: &mut Vec<Message>,
    ) -> Result<(), WorkerError> {
        let user_id = req.session.user_id;
        let session_id = req.session.session_id;

        for file in files
            .iter_mut()
            .filter(|f| req.file_ids.contains(&f.id))
        {
            if file.stored_path.is_empty() || !file.summary.is_empty() {
                continue;
            }

            let summary = self.generate_file_summary(cancel, resources, file).await?;
            if summary.is_empty() {
                continue;
            }

            let msg = checked(
                cancel,
                self.store.add_message(NewMessage {
                    user_id,
                    session_id,
                    role: Role::System,
                    content: format!(
                        "Summary of {} (file_id={}):\n{}",
                        file.file_name, file.id, summary
                    ),
                }),
            )
            .await??;
            checked(
                cancel,
                self.store.update_temp_file_summary(file.id, &summary, msg.id),
            )
            .await??;

            file.summary = summary;
            file.summary_message_id = msg.id;
            state.append_history(session_id, msg.clone());
            history.push(msg);
        }
        Ok(())
    }

    async fn generate_file_summary(
        &self,
        cancel: &CancellationToken,
        resources: &SessionResources,
        file: &TempFile,
    ) -> Result<String, WorkerError> {
        let docs = checked(cancel, self.loader.load(&file.stored_path))
            .await?
            .map_err(|e| WorkerError::Provider(format!("load {}: {e}", file.file_name)))?;

        let mut payload = format!("File name: {}\n\n", file.file_name);
        for doc in &docs {
            let content = doc.content.trim();
            if content.is_empty() {
                continue;
            }
            payload.push_str(content);
            payload.push_str("\n\n");
        }
        if docs.iter().all(|d| d.content.trim().is_empty()) {
            return Err(WorkerError::Provider(format!(
                "file {} content empty",
                file.file_name
            )));
        }

        let messages = vec![Message::unsaved(
            file.user_id,
            file.session_id,
            Role::User,
            payload.trim_end(),
        )];
        checked(cancel, resources.assist.summarize_file(&messages))
            .await?
            .map_err(WorkerError::provider)
    }

    pub(crate) async fn purge(&self, user_id: i64, session_id: i64) {
        if let Some(state) = self.states.get(&user_id) {
            state.purge_cache(session_id);
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_session(session_id).await;
            cache.invalidate_files(session_id).await;
            cache
                .publish_invalidation(InvalidateMessage {
                    user_id,
                    session_id,
                    scope: Scope::Session,
                })
                .await;
        }
    }

    pub(crate) async fn reset_user(&self, user_id: i64) {
        let session_ids = if let Some((_, state)) = self.states.remove(&user_id) {
            let ids = state.session_ids();
            state.reset();
            ids
        } else {
            Vec::new()
        };
        if let Some(cache) = &self.cache {
            for session_id in session_ids {
                cache.invalidate_session(session_id).await;
                cache.invalidate_files(session_id).await;
            }
            cache
                .publish_invalidation(InvalidateMessage {
                    user_id,
                    session_id: 0,
                    scope: Scope::User,
                })
                .await;
        }
    }

    pub(crate) async fn invalidate_temp_files(&self, user_id: i64, session_id: i64) {
        if let Some(state) = self.states.get(&user_id) {
            state.clear_files(session_id);
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_files(session_id).await;
            cache
                .publish_invalidation(InvalidateMessage {
                    user_id,
                    session_id,
                    scope: Scope::Files,
                })
                .await;
        }
    }

    /// Drop local entries named by a fan-out invalidation.
    fn apply_invalidation(&self, msg: &InvalidateMessage) {
        debug!(
            user_id = msg.user_id,
            session_id = msg.session_id,
            scope = ?msg.scope,
            "applying invalidation"
        );
        match msg.scope {
            Scope::User => {
                if let Some((_, state)) = self.states.remove(&msg.user_id) {
                    state.reset();
                }
            }
            Scope::Session => {
                if let Some(state) = self.states.get(&msg.user_id) {
                    state.purge_cache(msg.session_id);
                }
            }
            Scope::Files => {
                if let Some(state) = self.states.get(&msg.user_id) {
                    state.clear_files(msg.session_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatModel, ChatStream, LlmError, SessionClients, TitleModel};
    use crate::models::Session;
    use crate::store::MemoryStore;
    use futures::stream;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    struct EchoChat {
        served: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ChatModel for EchoChat {
        async fn stream(&self, history: &[Message]) -> Result<ChatStream, LlmError> {
            let last = history.last().map(|m| m.content.clone()).unwrap_or_default();
            self.served.lock().unwrap().push(last.clone());
            Ok(Box::pin(stream::iter(vec![
                Ok(StreamEvent::Token(format!("ai: {last}"))),
                Ok(StreamEvent::Done),
            ])))
        }
    }

    struct PendingChat;

    #[async_trait]
    impl ChatModel for PendingChat {
        async fn stream(&self, _history: &[Message]) -> Result<ChatStream, LlmError> {
            Ok(Box::pin(stream::pending()))
        }
    }

    struct FakeAssist {
        title: String,
    }

    #[async_trait]
    impl TitleModel for FakeAssist {
        async fn generate_title(&self, _messages: &[Message]) -> Result<String, LlmError> {
            Ok(self.title.clone())
        }

        async fn summarize_file(&self, _messages: &[Message]) -> Result<String, LlmError> {
            Ok("fake summary".to_string())
        }
    }

    struct FakeFactory {
        builds: AtomicUsize,
        title: String,
        served: Arc<StdMutex<Vec<String>>>,
        pending: bool,
    }

    impl FakeFactory {
        fn new(title: &str) -> Arc<Self> {
            Arc::new(Self {
                builds: AtomicUsize::new(0),
                title: title.to_string(),
                served: Arc::new(StdMutex::new(Vec::new())),
                pending: false,
            })
        }

        fn pending() -> Arc<Self> {
            Arc::new(Self {
                builds: AtomicUsize::new(0),
                title: "fake-title".to_string(),
                served: Arc::new(StdMutex::new(Vec::new())),
                pending: true,
            })
        }
    }

    impl ProviderFactory for FakeFactory {
        fn build(
            &self,
            _provider: &str,
            _model: &str,
            _token: &str,
        ) -> Result<SessionClients, LlmError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let chat: Arc<dyn ChatModel> = if self.pending {
                Arc::new(PendingChat)
            } else {
                Arc::new(EchoChat {
                    served: self.served.clone(),
                })
            };
            Ok(SessionClients {
                chat,
                assist: Arc::new(FakeAssist {
                    title: self.title.clone(),
                }),
            })
        }
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            min_workers: 2,
            max_workers: 2,
            queue_size: 10,
            worker_idle_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn test_manager(factory: Arc<FakeFactory>) -> (Arc<Manager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = Manager::new(
            store.clone(),
            factory,
            FileLoader::new("."),
            test_config(),
        );
        (manager, store)
    }

    fn session_req(user_id: i64, session_id: i64) -> SessionRequest {
        SessionRequest {
            user_id,
            session_id,
            provider: "mock".to_string(),
            model: "m1".to_string(),
            token: "tok".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    fn noop_chunk() -> crate::worker::job::ChunkFn {
        let chunk_fn: crate::worker::job::ChunkFn =
            Arc::new(|_chunk| Box::pin(async { Ok(()) }));
        chunk_fn
    }

    fn stream_req(user_id: i64, session_id: i64, content: &str) -> StreamRequest {
        StreamRequest {
            session: session_req(user_id, session_id),
            message: Message::unsaved(user_id, session_id, Role::User, content),
            file_ids: Vec::new(),
            chunk_fn: noop_chunk(),
        }
    }

    #[tokio::test]
    async fn init_creates_session_and_short_circuits_when_ready() {
        let (manager, store) = test_manager(FakeFactory::new("fake-title"));

        let session = manager.init_session(session_req(1, 0)).await.unwrap();
        assert!(session.id > 0);
        assert_eq!(session.title, NEW_CONVERSATION_TITLE);

        // A follow-up init with the real id returns the cached session
        // without another store write.
        let again = manager.init_session(session_req(1, session.id)).await.unwrap();
        assert_eq!(again.id, session.id);
        assert_eq!(store.session_count(), 1);

        manager.shutdown();
    }

    #[tokio::test]
    async fn init_rejects_invalid_identifiers() {
        let (manager, _store) = test_manager(FakeFactory::new("t"));

        let err = manager.init_session(session_req(0, 0)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation(_)));

        let err = manager.init_session(session_req(1, -5)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation(_)));

        manager.shutdown();
    }

    #[tokio::test]
    async fn init_unknown_session_is_not_found() {
        let (manager, _store) = test_manager(FakeFactory::new("t"));
        let err = manager.init_session(session_req(1, 404)).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
        manager.shutdown();
    }

    #[tokio::test]
    async fn first_stream_generates_title_follow_up_does_not() {
        let factory = FakeFactory::new("fake-title");
        let (manager, store) = test_manager(factory);

        let session = manager.init_session(session_req(1, 0)).await.unwrap();

        let outcome = manager.stream(stream_req(1, session.id, "hello")).await.unwrap();
        assert_eq!(outcome.message.content, "ai: hello");
        assert_eq!(outcome.title.as_deref(), Some("fake-title"));
        let (persisted, _) = store.get_session_with_messages(1, session.id).await.unwrap();
        assert_eq!(persisted.title, "fake-title");

        let outcome = manager.stream(stream_req(1, session.id, "again")).await.unwrap();
        assert_eq!(outcome.title, None);

        manager.shutdown();
    }

    #[tokio::test]
    async fn empty_generated_title_leaves_previous_title() {
        let (manager, store) = test_manager(FakeFactory::new(""));

        let session = manager.init_session(session_req(1, 0)).await.unwrap();
        let outcome = manager.stream(stream_req(1, session.id, "hi")).await.unwrap();
        assert_eq!(outcome.title, None);

        let (persisted, _) = store.get_session_with_messages(1, session.id).await.unwrap();
        assert_eq!(persisted.title, NEW_CONVERSATION_TITLE);

        manager.shutdown();
    }

    #[tokio::test]
    async fn stream_validates_message_content() {
        let (manager, _store) = test_manager(FakeFactory::new("t"));
        let err = manager.stream(stream_req(1, 0, "   ")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation(_)));
        manager.shutdown();
    }

    #[tokio::test]
    async fn stream_with_zero_session_id_creates_session() {
        let (manager, _store) = test_manager(FakeFactory::new("fake-title"));
        let outcome = manager.stream(stream_req(1, 0, "fresh")).await.unwrap();
        assert!(outcome.message.session_id > 0);
        assert_eq!(outcome.message.content, "ai: fresh");
        manager.shutdown();
    }

    #[tokio::test]
    async fn unknown_file_id_fails_before_any_provider_call() {
        let factory = FakeFactory::new("fake-title");
        let (manager, _store) = test_manager(factory.clone());

        let session = manager.init_session(session_req(1, 0)).await.unwrap();
        let builds_before = factory.builds.load(Ordering::SeqCst);

        let mut req = stream_req(1, session.id, "hello");
        req.file_ids = vec![999];
        let err = manager.stream(req).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));

        // No chat stream was opened for the failed turn.
        assert!(factory.served.lock().unwrap().is_empty());
        assert_eq!(factory.builds.load(Ordering::SeqCst), builds_before);

        manager.shutdown();
    }

    #[tokio::test]
    async fn resources_rebuild_exactly_once_per_key_change() {
        let factory = FakeFactory::new("fake-title");
        let (manager, _store) = test_manager(factory.clone());

        let session = manager.init_session(session_req(1, 0)).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

        // Same key: no rebuild.
        manager.stream(stream_req(1, session.id, "one")).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

        // Changed model: exactly one rebuild, history preserved (no new
        // title is generated because the cached history has a user message).
        let mut req = stream_req(1, session.id, "two");
        req.session.model = "m2".to_string();
        let outcome = manager.stream(req).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.title, None);

        let mut req = stream_req(1, session.id, "three");
        req.session.model = "m2".to_string();
        manager.stream(req).await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);

        manager.shutdown();
    }

    #[tokio::test]
    async fn sequential_streams_execute_in_submission_order() {
        let factory = FakeFactory::new("fake-title");
        let (manager, _store) = test_manager(factory.clone());

        let session = manager.init_session(session_req(11, 0)).await.unwrap();
        manager.stream(stream_req(11, session.id, "first")).await.unwrap();
        manager.stream(stream_req(11, session.id, "second")).await.unwrap();

        assert_eq!(*factory.served.lock().unwrap(), vec!["first", "second"]);
        manager.shutdown();
    }

    #[tokio::test]
    async fn cancelled_stream_returns_cancelled() {
        let (manager, _store) = test_manager(FakeFactory::pending());

        let session = manager.init_session(session_req(1, 0)).await.unwrap();
        let mut req = stream_req(1, session.id, "hang");
        let cancel = CancellationToken::new();
        req.session.cancel = cancel.clone();

        let handle = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.stream(req).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(WorkerError::Cancelled)));
        manager.shutdown();
    }

    #[tokio::test]
    async fn purge_and_reset_clear_cached_state() {
        let (manager, _store) = test_manager(FakeFactory::new("t"));

        let state = manager.executor.user_state(42);
        let now = chrono::Utc::now();
        state.set_session(Session {
            id: 99,
            user_id: 42,
            title: "cached".to_string(),
            created_at: now,
            updated_at: now,
        });
        state.set_history(99, vec![Message::unsaved(42, 99, Role::User, "x")]);
        state.mark_ready(99);

        manager.purge(42, 99).await;
        assert!(state.get_session(99).is_none());
        assert!(!state.is_ready(99));

        state.mark_ready(99);
        manager.reset_user(42).await;
        assert!(!manager.executor.states.contains_key(&42));

        // Purge after reset is a no-op.
        manager.purge(42, 99).await;
        manager.shutdown();
    }

    #[tokio::test]
    async fn failed_init_clears_pending_slot_for_retry() {
        struct FailingFactory;

        impl ProviderFactory for FailingFactory {
            fn build(
                &self,
                provider: &str,
                _model: &str,
                _token: &str,
            ) -> Result<SessionClients, LlmError> {
                Err(LlmError::UnknownProvider(provider.to_string()))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let manager = Manager::new(
            store.clone(),
            Arc::new(FailingFactory),
            FileLoader::new("."),
            test_config(),
        );

        let err = manager.init_session(session_req(1, 0)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Resource(_)));

        manager.shutdown();
    }
}
