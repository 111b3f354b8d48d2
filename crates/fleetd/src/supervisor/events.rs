//! Supervisor notifications.
//!
//! Every lifecycle change and health observation is published on a
//! broadcast channel. Receivers that fall behind lose the oldest events;
//! the supervisor never blocks on them.

use std::fmt;
use std::time::Duration;

use fleet_core::{AgentId, SessionId, SessionStatus};

/// Why a session was terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Explicit request by a caller
    Requested,
    IdleTimeout,
    MaxLifetime,
    /// Token quota blocked the agent
    QuotaExceeded,
    /// Supervisor shutting down
    Shutdown,
    Other(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::MaxLifetime => write!(f, "max lifetime exceeded"),
            Self::QuotaExceeded => write!(f, "token quota exceeded"),
            Self::Shutdown => write!(f, "supervisor shutdown"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl From<&str> for TerminationReason {
    fn from(reason: &str) -> Self {
        Self::Other(reason.to_string())
    }
}

/// Events published by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Spawned {
        session_id: SessionId,
        agent_id: AgentId,
        session_name: String,
    },

    /// The multiplexer refused to create the session; the record stays in
    /// `error` status until terminated.
    SpawnFailed {
        session_id: SessionId,
        agent_id: AgentId,
        error: String,
    },

    CommandSent {
        session_id: SessionId,
        command: String,
    },

    StatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },

    /// Advisory: no command for longer than the idle timeout.
    Idle {
        session_id: SessionId,
        agent_id: AgentId,
        idle_time: Duration,
    },

    /// Advisory: the session outlived its max lifetime.
    MaxLifetime {
        session_id: SessionId,
        agent_id: AgentId,
        lifetime: Duration,
    },

    HealthCheckFailed {
        session_id: SessionId,
        agent_id: AgentId,
        reason: String,
    },

    /// An error-level line was captured from the session's output.
    ErrorOutput {
        session_id: SessionId,
        agent_id: AgentId,
        line: String,
    },

    Terminated {
        session_id: SessionId,
        agent_id: AgentId,
        reason: TerminationReason,
    },
}

impl SupervisorEvent {
    /// Session the event refers to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Spawned { session_id, .. }
            | Self::SpawnFailed { session_id, .. }
            | Self::CommandSent { session_id, .. }
            | Self::StatusChanged { session_id, .. }
            | Self::Idle { session_id, .. }
            | Self::MaxLifetime { session_id, .. }
            | Self::HealthCheckFailed { session_id, .. }
            | Self::ErrorOutput { session_id, .. }
            | Self::Terminated { session_id, .. } => session_id,
        }
    }
}
