//! Snapshot consumed by terminal dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{AgentId, Money, TokenAlert, TokenCount, TokenDataPoint};

/// Per-agent row of the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub latest: Option<TokenDataPoint>,
    /// Tokens across the retained history
    pub total_tokens: TokenCount,
    pub total_cost: Money,
    pub tokens_last_hour: TokenCount,
    pub projected_daily: TokenCount,
    pub data_points: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    pub generated_at: DateTime<Utc>,
    /// Sorted by agent id
    pub agents: Vec<AgentSummary>,
    /// Unacknowledged alerts, newest first
    pub alerts: Vec<TokenAlert>,
    pub subscriber_count: usize,
    pub buffered_points: usize,
    pub total_tokens: TokenCount,
    pub total_cost: Money,
}
