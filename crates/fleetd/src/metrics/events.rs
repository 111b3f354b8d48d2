//! Metrics bus notifications.

use fleet_core::{AgentId, TokenAlert};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events published by the metrics bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    SubscriberAdded {
        subscription_id: SubscriptionId,
        agent_id: AgentId,
    },

    SubscriberRemoved {
        subscription_id: SubscriptionId,
        agent_id: AgentId,
    },

    /// The recent-point buffer grew past the backpressure threshold.
    Backpressure { buffered: usize, threshold: usize },

    /// Oldest buffered points were discarded to relieve backpressure.
    DataDropped { count: usize },

    AlertAdded { alert: TokenAlert },

    /// A subscriber's queue was full and a point was dropped for it.
    /// `dropped` counts every point lost by this subscription so far.
    SubscriberLagged {
        subscription_id: SubscriptionId,
        dropped: usize,
    },

    /// A subscriber callback failed or panicked. Other subscribers and the
    /// publisher are unaffected.
    SubscriberError {
        subscription_id: SubscriptionId,
        error: String,
    },

    /// Persisting the history failed; it is retried on the next flush.
    PersistenceFailed { error: String },
}
