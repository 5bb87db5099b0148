//! Per-user in-memory cache of sessions, histories, resources, and files.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::Semaphore;

use crate::llm::{ChatModel, TitleModel};
use crate::models::{Message, Session, TempFile};

/// The (provider, model, token) triple a compiled client pair is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResourceKey {
    pub provider: String,
    pub model: String,
    pub token: String,
}

/// Compiled provider clients for one session.
pub(crate) struct SessionResources {
    pub chat: Arc<dyn ChatModel>,
    pub assist: Arc<dyn TitleModel>,
    pub key: ResourceKey,
}

#[derive(Default)]
struct Maps {
    ready: HashSet<i64>,
    sessions: HashMap<i64, Session>,
    history: HashMap<i64, Vec<Message>>,
    resources: HashMap<i64, Arc<SessionResources>>,
    files: HashMap<i64, Vec<TempFile>>,
    /// One permit per session: at most one streaming turn runs at a time.
    turn_locks: HashMap<i64, Arc<Semaphore>>,
}

/// Thread-safe per-user cache keyed by session id.
///
/// Mutators take the write lock, readers the read lock. Nothing is called
/// out to while a lock is held; executors copy what they need and release.
#[derive(Default)]
pub(crate) struct UserState {
    maps: RwLock<Maps>,
}

impl UserState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, session_id: i64) -> bool {
        self.maps.read().unwrap().ready.contains(&session_id)
    }

    pub fn mark_ready(&self, session_id: i64) {
        self.maps.write().unwrap().ready.insert(session_id);
    }

    /// Atomically move session, history, and files from the pending id to
    /// the store-assigned real id, dropping the pending ready marker.
    pub fn promote_session(&self, pending_id: i64, real_id: i64) {
        if pending_id == real_id {
            return;
        }
        let mut maps = self.maps.write().unwrap();
        if let Some(session) = maps.sessions.remove(&pending_id) {
            maps.sessions.insert(real_id, session);
        }
        if let Some(history) = maps.history.remove(&pending_id) {
            maps.history.insert(real_id, history);
        }
        if let Some(files) = maps.files.remove(&pending_id) {
            maps.files.insert(real_id, files);
        }
        maps.ready.remove(&pending_id);
        maps.turn_locks.remove(&pending_id);
    }

    pub fn set_session(&self, session: Session) {
        let mut maps = self.maps.write().unwrap();
        maps.sessions.insert(session.id, session);
    }

    pub fn get_session(&self, session_id: i64) -> Option<Session> {
        self.maps.read().unwrap().sessions.get(&session_id).cloned()
    }

    pub fn set_history(&self, session_id: i64, history: Vec<Message>) {
        self.maps.write().unwrap().history.insert(session_id, history);
    }

    pub fn append_history(&self, session_id: i64, msg: Message) {
        self.maps
            .write()
            .unwrap()
            .history
            .entry(session_id)
            .or_default()
            .push(msg);
    }

    pub fn get_history(&self, session_id: i64) -> Vec<Message> {
        self.maps
            .read()
            .unwrap()
            .history
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_resources(&self, session_id: i64, res: Arc<SessionResources>) {
        self.maps.write().unwrap().resources.insert(session_id, res);
    }

    pub fn get_resources(&self, session_id: i64) -> Option<Arc<SessionResources>> {
        self.maps.read().unwrap().resources.get(&session_id).cloned()
    }

    pub fn set_files(&self, session_id: i64, files: Vec<TempFile>) {
        self.maps.write().unwrap().files.insert(session_id, files);
    }

    pub fn get_files(&self, session_id: i64) -> Vec<TempFile> {
        self.maps
            .read()
            .unwrap()
            .files
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_files(&self, session_id: i64) {
        self.maps.write().unwrap().files.remove(&session_id);
    }

    /// Ids of all cached sessions.
    pub fn session_ids(&self) -> Vec<i64> {
        self.maps.read().unwrap().sessions.keys().copied().collect()
    }

    /// The session's turn semaphore (one permit). Holding the permit for
    /// the duration of a streaming turn serialises turns per session.
    pub fn turn_lock(&self, session_id: i64) -> Arc<Semaphore> {
        let mut maps = self.maps.write().unwrap();
        maps.turn_locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Delete every mapping for one session.
    pub fn purge_cache(&self, session_id: i64) {
        let mut maps = self.maps.write().unwrap();
        maps.ready.remove(&session_id);
        maps.sessions.remove(&session_id);
        maps.history.remove(&session_id);
        maps.resources.remove(&session_id);
        maps.files.remove(&session_id);
        maps.turn_locks.remove(&session_id);
    }

    /// Empty all mappings.
    pub fn reset(&self) {
        let mut maps = self.maps.write().unwrap();
        *maps = Maps::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::Utc;

    fn session(id: i64) -> Session {
        let now = Utc::now();
        Session {
            id,
            user_id: 1,
            title: "t".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn ready_markers() {
        let state = UserState::new();
        assert!(!state.is_ready(1));
        state.mark_ready(1);
        assert!(state.is_ready(1));
    }

    #[test]
    fn history_append_preserves_order() {
        let state = UserState::new();
        state.set_history(1, vec![Message::unsaved(1, 1, Role::User, "a")]);
        state.append_history(1, Message::unsaved(1, 1, Role::Assistant, "b"));

        let history = state.get_history(1);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "a");
        assert_eq!(history[1].content, "b");
    }

    #[test]
    fn promote_moves_all_maps_and_clears_pending_ready() {
        let state = UserState::new();
        let pending = -3;
        state.set_session(session(pending));
        state.set_history(pending, vec![Message::unsaved(1, pending, Role::User, "hi")]);
        state.set_files(pending, Vec::new());
        state.mark_ready(pending);

        state.promote_session(pending, 7);

        assert!(state.get_session(7).is_some());
        assert_eq!(state.get_history(7).len(), 1);
        assert!(state.get_session(pending).is_none());
        assert!(!state.is_ready(pending));
    }

    #[test]
    fn promote_to_same_id_is_noop() {
        let state = UserState::new();
        state.set_session(session(5));
        state.mark_ready(5);
        state.promote_session(5, 5);
        assert!(state.is_ready(5));
        assert!(state.get_session(5).is_some());
    }

    #[test]
    fn purge_clears_every_mapping() {
        let state = UserState::new();
        state.set_session(session(2));
        state.set_history(2, vec![Message::unsaved(1, 2, Role::User, "x")]);
        state.mark_ready(2);

        state.purge_cache(2);

        assert!(state.get_session(2).is_none());
        assert!(state.get_history(2).is_empty());
        assert!(!state.is_ready(2));
    }

    #[test]
    fn reset_empties_all_sessions() {
        let state = UserState::new();
        state.set_session(session(1));
        state.set_session(session(2));
        state.reset();
        assert!(state.get_session(1).is_none());
        assert!(state.get_session(2).is_none());
    }
}
