//! Agent identity and type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an agent whose sessions and token usage are tracked.
///
/// The same agent may run many sessions over time; each spawn gets a new
/// session id but keeps the agent id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

/// Agent id matching every agent in subscription filters.
pub const WILDCARD_AGENT: &str = "*";

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The `"*"` id used by subscriptions that want every agent.
    pub fn wildcard() -> Self {
        Self(WILDCARD_AGENT.to_string())
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_AGENT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of agent, used for default limits and reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Orchestrating agent that dispatches work to others
    Orchestrator,

    /// Agent implementing a task
    #[default]
    Developer,

    /// Agent reviewing or verifying work
    Reviewer,

    /// Agent researching or exploring a codebase
    Researcher,

    /// Custom or unknown agent type
    Custom(String),
}

impl AgentType {
    /// Returns a short identifier for display.
    pub fn short_name(&self) -> &str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Developer => "developer",
            Self::Reviewer => "reviewer",
            Self::Researcher => "researcher",
            Self::Custom(name) => name.as_str(),
        }
    }

    /// Parses an agent type from its configured name.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "orchestrator" | "robo-orchestrator" => Self::Orchestrator,
            "developer" | "dev" | "robo-developer" => Self::Developer,
            "reviewer" | "qa" | "robo-reviewer" => Self::Reviewer,
            "researcher" | "explore" | "robo-researcher" => Self::Researcher,
            _ => Self::Custom(s.to_string()),
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}
