//! Session Store
//!
//! Owns every live [`Session`]. Each session sits behind its own async mutex,
//! so a chat running on one session never waits on, or touches, another.
//! Store operations are in-memory and never suspend.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::session::{Session, SessionId, SessionMetadata, SessionRecord, SessionSummary};

/// Options for [`SessionStore::create`]
#[derive(Clone, Debug, Default)]
pub struct CreateSession {
    pub id: Option<SessionId>,
    pub system_message: Option<String>,
    pub metadata: SessionMetadata,
}

impl CreateSession {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: SessionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn build(self) -> Session {
        let mut session = Session::with_id(self.id.unwrap_or_default());
        if let Some(system) = self.system_message {
            session.push(Message::system(system));
        }
        session.metadata = self.metadata;
        session
    }
}

/// Shared access to one stored session
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    session: Arc<AsyncMutex<Session>>,
    summary: Arc<Mutex<SessionSummary>>,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self {
            id: session.id.clone(),
            summary: Arc::new(Mutex::new(session.summary())),
            session: Arc::new(AsyncMutex::new(session)),
        }
    }

    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Exclusive access for the duration of one operation
    pub async fn lock(&self) -> SessionGuard {
        SessionGuard {
            guard: Arc::clone(&self.session).lock_owned().await,
            summary: Arc::clone(&self.summary),
        }
    }

    pub fn try_lock(&self) -> Option<SessionGuard> {
        Arc::clone(&self.session)
            .try_lock_owned()
            .ok()
            .map(|guard| SessionGuard {
                guard,
                summary: Arc::clone(&self.summary),
            })
    }

    /// Whether a chat currently holds the session
    pub fn is_busy(&self) -> bool {
        self.session.try_lock().is_err()
    }

    /// Last published summary; does not wait on an in-flight chat
    pub fn summary(&self) -> SessionSummary {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persistence record of the current state
    pub async fn snapshot(&self) -> SessionRecord {
        self.lock().await.to_record()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Locked session.
///
/// Publishes the session summary when dropped. A drop that happens while a
/// tool-call block still lacks results (an abandoned chat) rolls that block
/// back so the log never keeps an unpaired call.
pub struct SessionGuard {
    guard: OwnedMutexGuard<Session>,
    summary: Arc<Mutex<SessionSummary>>,
}

impl SessionGuard {
    /// Publish the current summary without releasing the lock
    pub fn checkpoint(&self) {
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner) = self.guard.summary();
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self.guard.conversation.rollback_unpaired();
        if removed > 0 {
            tracing::warn!(
                session_id = %self.guard.id,
                removed,
                "Rolled back unpaired tool calls from abandoned chat"
            );
        }
        self.checkpoint();
    }
}

/// Session lifecycle operations
pub trait SessionStore: Send + Sync {
    /// Create a session; fails if the id is taken
    fn create(&self, options: CreateSession) -> Result<SessionHandle>;

    fn get(&self, id: &SessionId) -> Option<SessionHandle>;

    fn get_or_create(&self, id: &SessionId) -> SessionHandle;

    /// Summaries, most recently active first
    fn list(&self) -> Vec<SessionSummary>;

    fn destroy(&self, id: &SessionId) -> bool;

    /// Remove idle sessions older than `timeout`; sessions with a chat in
    /// flight are kept. Returns the number removed.
    fn sweep_stale(&self, timeout: Duration) -> usize;

    /// Seed a new session from a persistence record; fails if the id is taken
    fn restore(&self, record: SessionRecord) -> Result<SessionHandle>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory session store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_new(&self, session: Session) -> Result<SessionHandle> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session.id) {
            return Err(AgentError::SessionExists(session.id.to_string()));
        }
        let handle = SessionHandle::new(session);
        sessions.insert(handle.id.clone(), handle.clone());
        tracing::debug!(session_id = %handle.id, "Session created");
        Ok(handle)
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, options: CreateSession) -> Result<SessionHandle> {
        self.insert_new(options.build())
    }

    fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn get_or_create(&self, id: &SessionId) -> SessionHandle {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::debug!(session_id = %id, "Session created on first use");
                SessionHandle::new(Session::with_id(id.clone()))
            })
            .clone()
    }

    fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(SessionHandle::summary)
            .collect();

        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        summaries
    }

    fn destroy(&self, id: &SessionId) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            tracing::debug!(session_id = %id, "Session destroyed");
        }
        removed
    }

    fn sweep_stale(&self, timeout: Duration) -> usize {
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 1000));
        let now = Utc::now();

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|id, handle| {
            if handle.is_busy() {
                return true;
            }
            let idle = handle.summary().idle_for(now);
            let keep = idle <= timeout;
            if !keep {
                tracing::info!(session_id = %id, idle_secs = idle.num_seconds(), "Sweeping stale session");
            }
            keep
        });
        before - sessions.len()
    }

    fn restore(&self, record: SessionRecord) -> Result<SessionHandle> {
        self.insert_new(Session::from_record(record))
    }

    fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolCall;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        let handle = store
            .create(CreateSession::new().id("s1").system_message("be brief"))
            .unwrap();

        let loaded = store.get(handle.id()).unwrap();
        assert_eq!(loaded.id().as_str(), "s1");
        assert_eq!(loaded.lock().await.message_count(), 1);
    }

    #[test]
    fn test_create_rejects_duplicate() {
        let store = MemorySessionStore::new();
        store.create(CreateSession::new().id("dup")).unwrap();
        assert!(matches!(
            store.create(CreateSession::new().id("dup")),
            Err(AgentError::SessionExists(_))
        ));
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = MemorySessionStore::new();
        let id = SessionId::from("s1");
        store.get_or_create(&id);
        store.get_or_create(&id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = MemorySessionStore::new();
        let a = store.get_or_create(&SessionId::from("a"));
        let b = store.get_or_create(&SessionId::from("b"));

        a.lock().await.push(Message::user("only in a"));
        b.lock().await.push(Message::user("only in b"));
        b.lock().await.clear();

        assert_eq!(a.lock().await.message_count(), 1);
        assert_eq!(b.lock().await.message_count(), 0);
    }

    #[tokio::test]
    async fn test_list_reflects_guard_updates() {
        let store = MemorySessionStore::new();
        let handle = store.get_or_create(&SessionId::from("s1"));
        {
            let mut session = handle.lock().await;
            session.push(Message::user("hello"));
            session.touch();
        }

        let summaries = store.list();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_count, 1);
        assert_eq!(summaries[0].title, "hello");
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let store = MemorySessionStore::new();
        let old = store.get_or_create(&SessionId::from("old"));
        store.get_or_create(&SessionId::from("fresh"));
        {
            let mut session = old.lock().await;
            session.last_activity = Utc::now() - chrono::Duration::hours(2);
        }

        assert_eq!(store.sweep_stale(Duration::from_secs(3600)), 1);
        assert!(store.get(&SessionId::from("old")).is_none());
        assert!(store.get(&SessionId::from("fresh")).is_some());
    }

    #[tokio::test]
    async fn test_sweep_skips_busy_sessions() {
        let store = MemorySessionStore::new();
        let handle = store.get_or_create(&SessionId::from("busy"));
        let mut guard = handle.lock().await;
        guard.last_activity = Utc::now() - chrono::Duration::hours(2);
        guard.checkpoint();

        assert_eq!(store.sweep_stale(Duration::from_secs(60)), 0);
        drop(guard);
        assert_eq!(store.sweep_stale(Duration::from_secs(60)), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_rolls_back_unpaired_calls() {
        let store = MemorySessionStore::new();
        let handle = store.get_or_create(&SessionId::from("s1"));
        {
            let mut session = handle.lock().await;
            session.push(Message::user("do two things"));
            session.push(Message::assistant_tool_calls(
                "",
                vec![ToolCall::new("c1", "a", "{}"), ToolCall::new("c2", "b", "{}")],
            ));
            session.push(Message::tool("c1", "a", "ok"));
        }

        let session = handle.lock().await;
        assert_eq!(session.message_count(), 1);
        assert!(session.conversation.validate_pairing().is_ok());
    }

    #[tokio::test]
    async fn test_restore_and_snapshot() {
        let store = MemorySessionStore::new();
        let original = store.get_or_create(&SessionId::from("s1"));
        original.lock().await.push(Message::user("remember me"));
        let record = original.snapshot().await;

        let other = MemorySessionStore::new();
        let restored = other.restore(record.clone()).unwrap();
        assert_eq!(restored.lock().await.messages(), record.messages.as_slice());
        assert!(other.restore(record).is_err());
    }

    #[test]
    fn test_destroy() {
        let store = MemorySessionStore::new();
        let id = SessionId::from("gone");
        store.get_or_create(&id);
        assert!(store.destroy(&id));
        assert!(!store.destroy(&id));
        assert!(store.is_empty());
    }
}
