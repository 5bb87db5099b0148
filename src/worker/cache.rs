//! Distributed state cache and invalidation fan-out.
//!
//! Wraps the [`CacheBus`] collaborator with the worker's key families:
//! `worker:session:{id}`, `worker:history:{id}`, `worker:files:{id}`, all
//! JSON with a 30-minute TTL, plus the `worker:invalidate` channel.
//!
//! Cache failures log and continue; only the store and providers abort a
//! turn.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::CacheBus;
use crate::models::{Message, Session, TempFile};

const INVALIDATE_CHANNEL: &str = "worker:invalidate";
const STATE_TTL: Duration = Duration::from_secs(30 * 60);

/// Which local cache entries an invalidation drops.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    User,
    Session,
    Files,
}

/// Cross-process signal that cached state for a user or session is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateMessage {
    pub user_id: i64,
    pub session_id: i64,
    pub scope: Scope,
}

fn session_key(session_id: i64) -> String {
    format!("worker:session:{session_id}")
}

fn history_key(session_id: i64) -> String {
    format!("worker:history:{session_id}")
}

fn files_key(session_id: i64) -> String {
    format!("worker:files:{session_id}")
}

pub(crate) struct StateCache {
    bus: Arc<dyn CacheBus>,
}

impl StateCache {
    pub fn new(bus: Arc<dyn CacheBus>) -> Self {
        Self { bus }
    }

    pub async fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        match self.bus.subscribe(INVALIDATE_CHANNEL).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(error = %e, "cache subscribe failed, invalidations disabled");
                None
            }
        }
    }

    pub async fn publish_invalidation(&self, msg: InvalidateMessage) {
        let payload = match serde_json::to_string(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "invalidation encode failed");
                return;
            }
        };
        if let Err(e) = self.bus.publish(INVALIDATE_CHANNEL, payload).await {
            warn!(error = %e, "invalidation publish failed");
        }
    }

    pub async fn cache_session(&self, session: &Session, history: &[Message]) {
        if session.id <= 0 {
            return;
        }
        match serde_json::to_string(session) {
            Ok(data) => {
                if let Err(e) = self.bus.set(&session_key(session.id), data, STATE_TTL).await {
                    warn!(session_id = session.id, error = %e, "session cache write failed");
                }
            }
            Err(e) => warn!(session_id = session.id, error = %e, "session encode failed"),
        }
        self.cache_history(session.id, history).await;
    }

    pub async fn cache_history(&self, session_id: i64, history: &[Message]) {
        if session_id <= 0 {
            return;
        }
        match serde_json::to_string(history) {
            Ok(data) => {
                if let Err(e) = self.bus.set(&history_key(session_id), data, STATE_TTL).await {
                    warn!(session_id, error = %e, "history cache write failed");
                }
            }
            Err(e) => warn!(session_id, error = %e, "history encode failed"),
        }
    }

    pub async fn cache_files(&self, session_id: i64, files: &[TempFile]) {
        if session_id <= 0 {
            return;
        }
        if files.is_empty() {
            self.invalidate_files(session_id).await;
            return;
        }
        match serde_json::to_string(files) {
            Ok(data) => {
                if let Err(e) = self.bus.set(&files_key(session_id), data, STATE_TTL).await {
                    warn!(session_id, error = %e, "files cache write failed");
                }
            }
            Err(e) => warn!(session_id, error = %e, "files encode failed"),
        }
    }

    /// Load a cached session and history, checking ownership.
    pub async fn load_session(
        &self,
        user_id: i64,
        session_id: i64,
    ) -> Option<(Session, Vec<Message>)> {
        if session_id <= 0 {
            return None;
        }
        let raw = match self.bus.get(&session_key(session_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(session_id, error = %e, "session cache read failed");
                return None;
            }
        };
        let session: Session = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                debug!(session_id, error = %e, "session cache decode failed");
                return None;
            }
        };
        if session.user_id != user_id {
            return None;
        }

        let history = match self.bus.get(&history_key(session_id)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                debug!(session_id, error = %e, "history cache decode failed");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(session_id, error = %e, "history cache read failed");
                Vec::new()
            }
        };
        Some((session, history))
    }

    pub async fn invalidate_session(&self, session_id: i64) {
        if session_id <= 0 {
            return;
        }
        let keys = vec![session_key(session_id), history_key(session_id)];
        if let Err(e) = self.bus.del(&keys).await {
            warn!(session_id, error = %e, "session cache invalidate failed");
        }
    }

    pub async fn invalidate_files(&self, session_id: i64) {
        if session_id <= 0 {
            return;
        }
        if let Err(e) = self.bus.del(&[files_key(session_id)]).await {
            warn!(session_id, error = %e, "files cache invalidate failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBus;
    use crate::models::Role;
    use chrono::Utc;

    fn cache() -> StateCache {
        StateCache::new(Arc::new(MemoryBus::new()))
    }

    fn session(id: i64, user_id: i64) -> Session {
        let now = Utc::now();
        Session {
            id,
            user_id,
            title: "t".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn session_roundtrip_checks_ownership() {
        let cache = cache();
        let history = vec![Message::unsaved(1, 5, Role::User, "hi")];
        cache.cache_session(&session(5, 1), &history).await;

        let (loaded, loaded_history) = cache.load_session(1, 5).await.unwrap();
        assert_eq!(loaded.id, 5);
        assert_eq!(loaded_history.len(), 1);

        // A different user never sees the entry.
        assert!(cache.load_session(2, 5).await.is_none());
    }

    #[tokio::test]
    async fn pending_ids_are_never_cached() {
        let cache = cache();
        cache.cache_session(&session(-4, 1), &[]).await;
        assert!(cache.load_session(1, -4).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_drops_entries() {
        let cache = cache();
        cache.cache_session(&session(9, 1), &[]).await;
        cache.invalidate_session(9).await;
        assert!(cache.load_session(1, 9).await.is_none());
    }

    #[tokio::test]
    async fn invalidation_message_roundtrip() {
        let msg = InvalidateMessage {
            user_id: 1,
            session_id: 2,
            scope: Scope::Files,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"scope\":\"files\""));
        let decoded: InvalidateMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.scope, Scope::Files);
    }
}
