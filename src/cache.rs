//! Cross-process cache bus collaborator.
//!
//! The worker core talks to an optional key/value store with TTLs plus a
//! fan-out channel for invalidation messages. [`MemoryBus`] is the
//! in-process implementation used by the standalone server and tests;
//! deployments with multiple replicas plug in a shared backend instead.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Buffered messages per subscription before lagging receivers drop.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// TTL'd key/value store plus publish/subscribe fan-out.
#[async_trait]
pub trait CacheBus: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Expired entries read as a miss, never an error.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn del(&self, keys: &[String]) -> Result<(), CacheError>;

    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError>;

    /// Subscribe to a fan-out channel. The publisher's own process receives
    /// its messages too; handlers must be idempotent.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, CacheError>;
}

#[derive(Default)]
struct BusState {
    entries: HashMap<String, (String, Instant)>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// In-process [`CacheBus`].
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<BusState>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, state: &mut BusState, channel: &str) -> broadcast::Sender<String> {
        state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CacheBus for MemoryBus {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        state
            .entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                state.entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        for key in keys {
            state.entries.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        let sender = {
            let mut state = self.state.lock().unwrap();
            self.channel(&mut state, channel)
        };
        // No subscribers yet is not an error.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, CacheError> {
        let mut state = self.state.lock().unwrap();
        Ok(self.channel(&mut state, channel).subscribe())
    }
}
