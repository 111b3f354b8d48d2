//! Token usage events, metric data points, and alerts.

use crate::{AgentId, AgentType, FleetError, FleetResult, Money, TokenCount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Open, string-keyed correlation metadata (prp id, task id, signal, ...).
pub type Metadata = BTreeMap<String, String>;

/// Metadata key of the PRP a usage event belongs to.
pub const META_PRP_ID: &str = "prp_id";

/// Metadata key of the task a usage event belongs to.
pub const META_TASK_ID: &str = "task_id";

/// Metadata key of the signal that triggered the operation.
pub const META_SIGNAL: &str = "signal";

/// What the tokens were spent on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOperation {
    #[default]
    Request,
    Response,
    ToolCall,
    Signal,
    Custom(String),
}

impl UsageOperation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::ToolCall => "tool_call",
            Self::Signal => "signal",
            Self::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for UsageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Usage Event
// ============================================================================

/// One observation of tokens consumed by an agent. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageEvent {
    pub agent_id: AgentId,
    #[serde(default)]
    pub agent_type: AgentType,
    pub tokens: TokenCount,
    #[serde(default)]
    pub operation: UsageOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl TokenUsageEvent {
    /// Creates an event stamped with the current time.
    pub fn new(agent_id: impl Into<AgentId>, tokens: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: AgentType::default(),
            tokens: TokenCount::new(tokens),
            operation: UsageOperation::default(),
            model: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = agent_type;
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: UsageOperation) -> Self {
        self.operation = operation;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_prp_id(self, prp_id: impl Into<String>) -> Self {
        self.with_metadata(META_PRP_ID, prp_id)
    }

    pub fn prp_id(&self) -> Option<&str> {
        self.metadata.get(META_PRP_ID).map(String::as_str)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.metadata.get(META_TASK_ID).map(String::as_str)
    }

    pub fn signal(&self) -> Option<&str> {
        self.metadata.get(META_SIGNAL).map(String::as_str)
    }

    /// Rejects events without an agent id.
    pub fn validate(&self) -> FleetResult<()> {
        if self.agent_id.is_empty() || self.agent_id.is_wildcard() {
            return Err(FleetError::invalid_argument(
                "agent_id",
                "usage events need a concrete agent id",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Data Point
// ============================================================================

/// A usage observation as published to metric subscribers.
///
/// `limit` and `remaining` refer to the agent's daily window at the time of
/// the observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDataPoint {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub tokens_used: TokenCount,
    pub limit: TokenCount,
    pub remaining: TokenCount,
    pub cost: Money,
    #[serde(default)]
    pub operation: UsageOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl TokenDataPoint {
    /// Creates a data point stamped now with no cost or limit information.
    pub fn new(agent_id: impl Into<AgentId>, tokens_used: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            tokens_used: TokenCount::new(tokens_used),
            limit: TokenCount::zero(),
            remaining: TokenCount::zero(),
            cost: Money::zero(),
            operation: UsageOperation::default(),
            model: None,
            metadata: Metadata::new(),
        }
    }

    /// Checks the fields every subscriber relies on.
    ///
    /// Token fields are unsigned, so only the agent id, the cost sign, and
    /// the presence of a real timestamp need checking.
    pub fn validate(&self) -> FleetResult<()> {
        if self.agent_id.is_empty() || self.agent_id.is_wildcard() {
            return Err(FleetError::invalid_argument(
                "agent_id",
                "data points need a concrete agent id",
            ));
        }
        if self.cost.is_negative() {
            return Err(FleetError::invalid_argument("cost", "must not be negative"));
        }
        if self.timestamp.timestamp() <= 0 {
            return Err(FleetError::invalid_argument("timestamp", "missing timestamp"));
        }
        Ok(())
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// How serious a quota alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Blocked,
}

impl AlertSeverity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A quota alert. Append-only; acknowledgement is the only mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAlert {
    pub id: String,
    pub agent_id: AgentId,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

impl TokenAlert {
    pub fn new(agent_id: AgentId, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata_accessors() {
        let event = TokenUsageEvent::new("a1", 10)
            .with_prp_id("PRP-7")
            .with_metadata(META_TASK_ID, "t-3");
        assert_eq!(event.prp_id(), Some("PRP-7"));
        assert_eq!(event.task_id(), Some("t-3"));
        assert_eq!(event.signal(), None);
    }

    #[test]
    fn test_event_validation() {
        assert!(TokenUsageEvent::new("a1", 10).validate().is_ok());
        assert!(matches!(
            TokenUsageEvent::new("", 10).validate(),
            Err(FleetError::InvalidArgument { field: "agent_id", .. })
        ));
    }

    #[test]
    fn test_data_point_validation() {
        assert!(TokenDataPoint::new("a1", 5).validate().is_ok());

        let mut point = TokenDataPoint::new("a1", 5);
        point.cost = Money::from_usd(-1.0);
        assert!(point.validate().is_err());

        let mut point = TokenDataPoint::new("a1", 5);
        point.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        assert!(matches!(
            point.validate(),
            Err(FleetError::InvalidArgument { field: "timestamp", .. })
        ));

        assert!(TokenDataPoint::new("*", 5).validate().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::json!({
            "agent_id": "a1",
            "tokens": 42,
            "operation": "tool_call",
            "model": "claude-sonnet-4",
            "metadata": {"prp_id": "PRP-1"},
            "timestamp": "2024-03-14T10:00:00Z"
        });
        let event: TokenUsageEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.tokens, TokenCount::new(42));
        assert_eq!(event.operation, UsageOperation::ToolCall);
        assert_eq!(event.agent_type, AgentType::Developer);
        assert_eq!(event.prp_id(), Some("PRP-1"));
    }
}
