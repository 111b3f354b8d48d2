//! Concurrent session store.
//!
//! Sessions are keyed by id in a `DashMap`; each entry carries its own lock,
//! so operations on different sessions never contend on a global lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use fleet_core::{AgentId, AgentSession, SessionId};

/// One supervised session and the handles of its background tasks.
#[derive(Debug)]
pub struct SessionEntry {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub session_name: String,
    state: Mutex<AgentSession>,
    /// Cancels the health, capture and completion tasks of this session
    cancel: CancellationToken,
    terminating: AtomicBool,
    log_started: AtomicBool,
}

impl SessionEntry {
    pub fn new(session: AgentSession, parent: &CancellationToken) -> Self {
        Self {
            id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            session_name: session.session_name.clone(),
            state: Mutex::new(session),
            cancel: parent.child_token(),
            terminating: AtomicBool::new(false),
            log_started: AtomicBool::new(false),
        }
    }

    /// Locks the session record. Held across multiplexer calls for the
    /// same session, which serializes commands per session.
    pub async fn lock(&self) -> MutexGuard<'_, AgentSession> {
        self.state.lock().await
    }

    /// Clones the current record.
    pub async fn snapshot(&self) -> AgentSession {
        self.state.lock().await.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Marks the entry as terminating; returns false if it already was.
    pub fn begin_termination(&self) -> bool {
        !self.terminating.swap(true, Ordering::AcqRel)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Records that the log store has an open session for this entry.
    pub fn mark_log_started(&self) {
        self.log_started.store(true, Ordering::Release);
    }

    pub fn log_started(&self) -> bool {
        self.log_started.load(Ordering::Acquire)
    }
}

/// Map of live sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<SessionEntry>) {
        self.sessions.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(id).map(|(_, entry)| entry)
    }

    /// Every entry, cloned out so no shard lock is held by the caller.
    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Entries belonging to `agent_id`.
    pub fn entries_for_agent(&self, agent_id: &AgentId) -> Vec<Arc<SessionEntry>> {
        self.sessions
            .iter()
            .filter(|entry| &entry.value().agent_id == agent_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
