//! Quota engine notifications and query results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{AgentId, AgentType, AlertSeverity, Money, TokenAlert, TokenCount, UsageWindow};

/// Daily usage percentage at which enforcement warns.
pub const WARNING_PCT: f64 = 80.0;
/// Daily usage percentage at which enforcement raises a critical alert.
pub const CRITICAL_PCT: f64 = 90.0;
/// Daily usage percentage at which enforcement blocks the agent.
pub const BLOCKED_PCT: f64 = 95.0;

/// Events published by the quota engine.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    /// Enforcement put the agent in the warning tier.
    LimitWarning { agent_id: AgentId, percent_used: f64 },

    /// A window crossed the configured warning threshold.
    LimitApproached {
        agent_id: AgentId,
        window: UsageWindow,
        percent_used: f64,
    },

    /// Usage is above the limit of one or more windows.
    LimitExceeded {
        agent_id: AgentId,
        windows: Vec<UsageWindow>,
    },

    /// A window passed its boundary and started from zero.
    WindowReset {
        agent_id: AgentId,
        window: UsageWindow,
    },

    AlertCreated { alert: TokenAlert },
}

/// Enforcement tier derived from the daily usage percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    None,
    Warning,
    Critical,
    Blocked,
}

impl EnforcementAction {
    /// Exactly one tier applies to any percentage.
    pub fn for_percent(percent_used: f64) -> Self {
        if percent_used >= BLOCKED_PCT {
            Self::Blocked
        } else if percent_used >= CRITICAL_PCT {
            Self::Critical
        } else if percent_used >= WARNING_PCT {
            Self::Warning
        } else {
            Self::None
        }
    }

    /// Severity of the alert the tier raises, if any.
    pub fn alert_severity(&self) -> Option<AlertSeverity> {
        match self {
            Self::None => None,
            Self::Warning => Some(AlertSeverity::Warning),
            Self::Critical => Some(AlertSeverity::Critical),
            Self::Blocked => Some(AlertSeverity::Blocked),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }
}

/// Result of an enforcement check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enforcement {
    pub action: EnforcementAction,
    pub percent_used: f64,
    /// Alert raised by this check
    pub alert: Option<TokenAlert>,
}

/// A window at or above a queried threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproachingLimit {
    pub agent_id: AgentId,
    pub window: UsageWindow,
    pub used: TokenCount,
    pub limit: TokenCount,
    pub percent_used: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExceededLimits {
    pub exceeded: bool,
    pub windows: Vec<UsageWindow>,
}

/// Usage of one window in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReport {
    pub window: UsageWindow,
    pub used: TokenCount,
    pub limit: TokenCount,
    pub remaining: TokenCount,
    pub percent_used: f64,
    pub next_reset: DateTime<Utc>,
}

/// Lifetime and per-window usage of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUsageReport {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub total_tokens: TokenCount,
    pub request_count: u64,
    pub average_tokens_per_request: f64,
    pub total_cost: Money,
    pub windows: Vec<WindowReport>,
    /// Tokens by operation name
    pub by_operation: BTreeMap<String, TokenCount>,
    pub last_activity: Option<DateTime<Utc>>,
}
