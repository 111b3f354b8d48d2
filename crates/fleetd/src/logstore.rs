//! Log store collaborator.
//!
//! Captured agent output ends up in an external log store. The daemon ships
//! two stores: [`TracingLogStore`] forwards records as `tracing` events, and
//! [`MemoryLogStore`] keeps them for inspection.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use fleet_core::{AgentId, LogLevel, LogRecord, SessionId};

/// Errors reported by a log store. The supervisor logs and swallows them.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("log store unavailable: {0}")]
    Unavailable(String),

    #[error("unknown log session: {0}")]
    UnknownSession(SessionId),
}

/// How a session's log ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Terminated on request
    Completed,
    /// Terminated while in `error` status
    Failed(String),
}

/// Destination of structured records from captured output.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, record: LogRecord) -> Result<(), LogStoreError>;

    async fn start_session(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<(), LogStoreError>;

    async fn end_session(
        &self,
        session_id: &SessionId,
        outcome: SessionOutcome,
    ) -> Result<(), LogStoreError>;
}

// ============================================================================
// Tracing Log Store
// ============================================================================

/// Forwards records to `tracing` under the `agent_output` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogStore;

#[async_trait]
impl LogStore for TracingLogStore {
    async fn append(&self, record: LogRecord) -> Result<(), LogStoreError> {
        let LogRecord {
            level,
            source,
            agent_id,
            session_id,
            message,
            ..
        } = record;
        match level {
            LogLevel::Error => error!(target: "agent_output", %agent_id, %session_id, %source, "{message}"),
            LogLevel::Warn => warn!(target: "agent_output", %agent_id, %session_id, %source, "{message}"),
            LogLevel::Info => info!(target: "agent_output", %agent_id, %session_id, %source, "{message}"),
            LogLevel::Debug => debug!(target: "agent_output", %agent_id, %session_id, %source, "{message}"),
        }
        Ok(())
    }

    async fn start_session(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<(), LogStoreError> {
        info!(target: "agent_output", %agent_id, %session_id, "Log session started");
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &SessionId,
        outcome: SessionOutcome,
    ) -> Result<(), LogStoreError> {
        info!(target: "agent_output", %session_id, ?outcome, "Log session ended");
        Ok(())
    }
}

// ============================================================================
// Memory Log Store
// ============================================================================

/// Bookkeeping of one log session.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSession {
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub ended: Option<SessionOutcome>,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: Mutex<Vec<LogRecord>>,
    sessions: Mutex<HashMap<SessionId, LogSession>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records appended so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records of one session.
    pub fn records_for(&self, session_id: &SessionId) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| &r.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<LogSession> {
        self.sessions.lock().get(session_id).cloned()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, record: LogRecord) -> Result<(), LogStoreError> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn start_session(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<(), LogStoreError> {
        self.sessions.lock().insert(
            session_id.clone(),
            LogSession {
                agent_id: agent_id.clone(),
                started_at: Utc::now(),
                ended: None,
            },
        );
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &SessionId,
        outcome: SessionOutcome,
    ) -> Result<(), LogStoreError> {
        match self.sessions.lock().get_mut(session_id) {
            Some(session) => {
                session.ended = Some(outcome);
                Ok(())
            }
            None => Err(LogStoreError::UnknownSession(session_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_session_lifecycle() {
        let store = MemoryLogStore::new();
        let session_id = SessionId::new("s1");
        store
            .start_session(&AgentId::new("a1"), &session_id)
            .await
            .unwrap();
        store
            .append(LogRecord::from_line(
                "tmux",
                &AgentId::new("a1"),
                &session_id,
                "hello",
                &[],
            ))
            .await
            .unwrap();
        store
            .end_session(&session_id, SessionOutcome::Completed)
            .await
            .unwrap();

        assert_eq!(store.records_for(&session_id).len(), 1);
        let session = store.session(&session_id).unwrap();
        assert_eq!(session.ended, Some(SessionOutcome::Completed));
    }

    #[tokio::test]
    async fn test_end_unknown_session() {
        let store = MemoryLogStore::new();
        let result = store
            .end_session(&SessionId::new("nope"), SessionOutcome::Completed)
            .await;
        assert!(matches!(result, Err(LogStoreError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_tracing_store_accepts_records() {
        let store = TracingLogStore;
        let record = LogRecord::from_line(
            "tmux",
            &AgentId::new("a1"),
            &SessionId::new("s1"),
            "error: boom",
            &[],
        );
        assert!(store.append(record).await.is_ok());
    }
}
