//! Log records produced from captured session output.

use crate::{AgentId, Metadata, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a captured output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Classification rules in precedence order; first match wins.
const LEVEL_RULES: [(LogLevel, &[&str]); 3] = [
    (LogLevel::Error, &["error", "failed"]),
    (LogLevel::Warn, &["warn"]),
    (LogLevel::Debug, &["debug"]),
];

/// Classifies a line by case-insensitive token match.
///
/// `error`/`failed` beat `warn`, which beats `debug`; anything else is `info`.
pub fn classify_line(line: &str) -> LogLevel {
    let lower = line.to_lowercase();
    LEVEL_RULES
        .iter()
        .find(|(_, tokens)| tokens.iter().any(|token| lower.contains(token)))
        .map(|(level, _)| *level)
        .unwrap_or(LogLevel::Info)
}

/// A structured record of one captured output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Where the line came from (e.g. `tmux`)
    pub source: String,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub message: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Builds a record for `line`, classifying its level.
    pub fn from_line(
        source: &str,
        agent_id: &AgentId,
        session_id: &SessionId,
        line: &str,
        tags: &[String],
    ) -> Self {
        Self {
            level: classify_line(line),
            source: source.to_string(),
            agent_id: agent_id.clone(),
            session_id: session_id.clone(),
            message: line.to_string(),
            tags: tags.to_vec(),
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }
}
