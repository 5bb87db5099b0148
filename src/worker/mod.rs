//! Per-user streaming conversation dispatcher.
//!
//! The manager admits session-bound jobs into a bounded intake queue, a
//! round-robin dispatcher fans them out over an elastic worker pool, and
//! the task executor drives session init and streaming turns against the
//! persistence, provider, and cache collaborators.
//!
//! Scheduler tracing lives under this module's target; enable it with
//! `RUST_LOG=unichat::worker=debug`.

mod cache;
mod dispatcher;
mod error;
mod job;
mod manager;
mod pool;
mod state;

pub use cache::{InvalidateMessage, Scope};
pub use error::WorkerError;
pub use job::{ChunkFn, ChunkSendError, SessionRequest, StreamOutcome, StreamRequest};
pub use manager::{DispatcherConfig, Manager};
