//! Error taxonomy shared by every fleet component.

use thiserror::Error;

/// Errors returned by supervisor, quota, and metrics operations.
///
/// Only `InvalidArgument` is a hard failure for callers. The others describe
/// a degraded session or agent and never affect unrelated ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    /// Unknown session, subscription, alert, or agent.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation not valid for the session's current status.
    #[error("invalid state for {operation}: session {session_id} is {status}")]
    InvalidState {
        operation: &'static str,
        session_id: String,
        status: String,
    },

    /// Malformed usage or data point input.
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    /// The terminal multiplexer call failed.
    #[error("multiplexer failure: {0}")]
    AdapterFailure(String),

    /// A capacity limit was reached.
    #[error("limit exceeded: {what} (max: {max})")]
    LimitExceeded { what: String, max: usize },
}

impl FleetError {
    /// Creates a `NotFound` error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::not_found("session", "abc");
        assert_eq!(err.to_string(), "session not found: abc");

        let err = FleetError::InvalidState {
            operation: "send_command",
            session_id: "abc".to_string(),
            status: "terminating".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid state for send_command: session abc is terminating"
        );

        let err = FleetError::invalid_argument("agent_id", "must not be empty");
        assert_eq!(err.to_string(), "invalid agent_id: must not be empty");

        let err = FleetError::LimitExceeded {
            what: "subscribers for a1".to_string(),
            max: 50,
        };
        assert_eq!(err.to_string(), "limit exceeded: subscribers for a1 (max: 50)");
    }
}
