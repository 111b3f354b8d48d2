//! Agent session entities and value objects.

use crate::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a supervised session.
///
/// Allocated by the supervisor on spawn; never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocates a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session Status
// ============================================================================

/// Lifecycle status of a supervised session.
///
/// ```text
/// initializing -> running -> busy -> running
/// running|idle|busy -> error     (multiplexer session missing)
/// running -> idle                (idle timeout elapsed)
/// any -> terminating -> removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Initializing,
    Running,
    Idle,
    Busy,
    Error,
    Terminating,
}

impl SessionStatus {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Terminating => "terminating",
        }
    }

    /// Sessions counted by `list_active`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Idle | Self::Busy)
    }

    /// Whether a command may be sent in this status.
    #[must_use]
    pub fn accepts_commands(&self) -> bool {
        matches!(self, Self::Running | Self::Idle)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// Launch configuration for a session. Immutable after spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub agent_id: AgentId,
    pub working_directory: PathBuf,
    /// Command started inside the multiplexer session
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Optional file the captured output is also associated with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Whether captured output is streamed to the log store
    #[serde(default = "default_log_streaming")]
    pub stream_logs: bool,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub max_lifetime: Duration,
}

fn default_log_streaming() -> bool {
    true
}

impl SessionConfig {
    /// Creates a config with the default idle timeout (5 min) and max lifetime (2 h).
    pub fn new(
        agent_id: impl Into<AgentId>,
        working_directory: impl Into<PathBuf>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            working_directory: working_directory.into(),
            command: command.into(),
            environment: BTreeMap::new(),
            log_file: None,
            stream_logs: true,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(7200),
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn without_log_streaming(mut self) -> Self {
        self.stream_logs = false;
        self
    }
}

/// Counters maintained per session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_commands: u64,
    pub output_lines: u64,
    pub error_count: u64,
    /// Exponential moving average of command response time, in milliseconds
    pub average_response_ms: f64,
}

impl SessionMetrics {
    /// Smoothing factor of the response time moving average.
    pub const RESPONSE_EMA_ALPHA: f64 = 0.2;

    /// Folds a response time sample into the moving average.
    ///
    /// The first sample seeds the average.
    pub fn record_response(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        if self.average_response_ms <= 0.0 {
            self.average_response_ms = sample;
        } else {
            self.average_response_ms = Self::RESPONSE_EMA_ALPHA * sample
                + (1.0 - Self::RESPONSE_EMA_ALPHA) * self.average_response_ms;
        }
    }
}

/// Best-effort process resources of the session's pane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionResources {
    pub pid: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
}

// ============================================================================
// Agent Session
// ============================================================================

/// One spawned worker and its supervision state.
///
/// Timestamps are monotonic; `created_at` is the wall-clock spawn time kept
/// for reports only.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: SessionId,
    /// Name of the session inside the multiplexer
    pub session_name: String,
    pub agent_id: AgentId,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub start_time: Instant,
    pub last_activity: Instant,
    pub created_at: DateTime<Utc>,
    pub metrics: SessionMetrics,
    pub resources: SessionResources,
    /// When the in-flight command was sent (set while busy)
    pub busy_since: Option<Instant>,
    /// Bumped on every command so stale completion timers are ignored
    pub command_generation: u64,
}

impl AgentSession {
    /// Creates a session in `initializing` status.
    pub fn new(id: SessionId, config: SessionConfig, now: Instant) -> Self {
        let session_name = Self::session_name_for(&config.agent_id, &id);
        Self {
            agent_id: config.agent_id.clone(),
            id,
            session_name,
            config,
            status: SessionStatus::Initializing,
            start_time: now,
            last_activity: now,
            created_at: Utc::now(),
            metrics: SessionMetrics::default(),
            resources: SessionResources::default(),
            busy_since: None,
            command_generation: 0,
        }
    }

    /// Builds the multiplexer session name: `agent-<agent>-<short id>`.
    ///
    /// Characters tmux treats specially in targets (`.` and `:`) are replaced.
    pub fn session_name_for(agent_id: &AgentId, id: &SessionId) -> String {
        let agent: String = agent_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("agent-{agent}-{}", id.short())
    }

    /// Time since the last command or spawn.
    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Time since spawn.
    pub fn lifetime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    /// Applies a status transition, returning the previous status if it changed.
    pub fn transition(&mut self, to: SessionStatus) -> Option<SessionStatus> {
        if self.status == to {
            return None;
        }
        let from = self.status;
        debug!(session_id = %self.id, from = %from, to = %to, "Session status transition");
        self.status = to;
        Some(from)
    }

    /// Records a dispatched command and moves the session to `busy`.
    ///
    /// Returns the command generation the completion timer must match.
    pub fn begin_command(&mut self, now: Instant) -> u64 {
        self.metrics.total_commands = self.metrics.total_commands.saturating_add(1);
        self.last_activity = now;
        self.busy_since = Some(now);
        self.command_generation = self.command_generation.wrapping_add(1);
        self.transition(SessionStatus::Busy);
        self.command_generation
    }

    /// Reverts `busy` to `running` if `generation` is still the latest command.
    ///
    /// Returns the previous status when the revert happened.
    pub fn complete_command(&mut self, generation: u64, now: Instant) -> Option<SessionStatus> {
        if self.status != SessionStatus::Busy || self.command_generation != generation {
            return None;
        }
        if let Some(since) = self.busy_since.take() {
            self.metrics
                .record_response(now.saturating_duration_since(since));
        }
        self.last_activity = now;
        self.transition(SessionStatus::Running)
    }

    /// Records output captured from the pane.
    pub fn record_output(&mut self, lines: u64, errors: u64) {
        self.metrics.output_lines = self.metrics.output_lines.saturating_add(lines);
        self.metrics.error_count = self.metrics.error_count.saturating_add(errors);
    }

    /// Records a failure (spawn or liveness) and moves to `error`.
    pub fn record_failure(&mut self) -> Option<SessionStatus> {
        self.metrics.error_count = self.metrics.error_count.saturating_add(1);
        self.busy_since = None;
        self.transition(SessionStatus::Error)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_session() -> AgentSession {
        let config = SessionConfig::new("a1", "/tmp", "claude");
        AgentSession::new(SessionId::new("12345678-aaaa"), config, Instant::now())
    }

    #[test]
    fn test_new_session_is_initializing() {
        let session = create_test_session();
        assert_eq!(session.status, SessionStatus::Initializing);
        assert_eq!(session.session_name, "agent-a1-12345678");
        assert_eq!(session.metrics, SessionMetrics::default());
    }

    #[test]
    fn test_session_name_sanitizes_agent() {
        let name = AgentSession::session_name_for(&AgentId::new("team.a:1"), &SessionId::new("x"));
        assert_eq!(name, "agent-team_a_1-x");
    }

    #[test]
    fn test_command_cycle() {
        let mut session = create_test_session();
        session.transition(SessionStatus::Running);

        let start = session.start_time;
        let generation = session.begin_command(start);
        assert_eq!(session.status, SessionStatus::Busy);
        assert_eq!(session.metrics.total_commands, 1);

        let done = start + Duration::from_millis(400);
        assert_eq!(
            session.complete_command(generation, done),
            Some(SessionStatus::Busy)
        );
        assert_eq!(session.status, SessionStatus::Running);
        assert!((session.metrics.average_response_ms - 400.0).abs() < 0.001);
    }

    #[test]
    fn test_stale_completion_ignored() {
        let mut session = create_test_session();
        session.transition(SessionStatus::Running);
        let now = session.start_time;
        let first = session.begin_command(now);
        let _second = session.begin_command(now);

        assert!(session.complete_command(first, now).is_none());
        assert_eq!(session.status, SessionStatus::Busy);
    }

    #[test]
    fn test_response_ema() {
        let mut metrics = SessionMetrics::default();
        metrics.record_response(Duration::from_millis(100));
        metrics.record_response(Duration::from_millis(200));
        assert!((metrics.average_response_ms - 120.0).abs() < 0.001);
    }

    #[test]
    fn test_status_activity() {
        assert!(SessionStatus::Running.is_active());
        assert!(SessionStatus::Busy.is_active());
        assert!(SessionStatus::Idle.is_active());
        assert!(!SessionStatus::Error.is_active());
        assert!(!SessionStatus::Busy.accepts_commands());
        assert!(SessionStatus::Idle.accepts_commands());
    }

    #[test]
    fn test_failure_counts_error() {
        let mut session = create_test_session();
        assert_eq!(session.record_failure(), Some(SessionStatus::Initializing));
        assert_eq!(session.metrics.error_count, 1);
        assert_eq!(session.status, SessionStatus::Error);
    }
}
