//! Usage projections from recent history.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{AgentId, FleetError, FleetResult, TokenCount, TokenDataPoint};

/// Horizon a projection extrapolates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Hour,
    Day,
    Week,
    Month,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Self::Hour, Self::Day, Self::Week, Self::Month];

    /// Hours in the timeframe; a month counts as 30 days.
    pub fn hours(&self) -> u64 {
        match self {
            Self::Hour => 1,
            Self::Day => 24,
            Self::Week => 168,
            Self::Month => 720,
        }
    }

    pub fn parse(s: &str) -> FleetResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(FleetError::invalid_argument(
                "timeframe",
                format!("unknown timeframe {other:?}"),
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Linear extrapolation of the last hour's usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub agent_id: AgentId,
    pub timeframe: Timeframe,
    /// Tokens observed in the hour before the projection
    pub hourly_tokens: TokenCount,
    pub projected_tokens: TokenCount,
    /// Fixed at medium; a linear model has no error estimate.
    pub confidence: Confidence,
}

/// Sum of tokens in `series` within the hour before `now`.
pub fn tokens_in_last_hour<'a>(
    series: impl IntoIterator<Item = &'a TokenDataPoint>,
    now: DateTime<Utc>,
) -> TokenCount {
    let since = now - Duration::hours(1);
    series
        .into_iter()
        .filter(|p| p.timestamp > since && p.timestamp <= now)
        .map(|p| p.tokens_used)
        .sum()
}

/// Projects `series` over `timeframe`.
pub fn project<'a>(
    agent_id: &AgentId,
    series: impl IntoIterator<Item = &'a TokenDataPoint>,
    timeframe: Timeframe,
    now: DateTime<Utc>,
) -> Projection {
    let hourly_tokens = tokens_in_last_hour(series, now);
    Projection {
        agent_id: agent_id.clone(),
        timeframe,
        hourly_tokens,
        projected_tokens: TokenCount::new(hourly_tokens.as_u64().saturating_mul(timeframe.hours())),
        confidence: Confidence::Medium,
    }
}
