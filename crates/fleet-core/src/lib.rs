//! Fleet Core - Shared domain types for agent fleet supervision
//!
//! This crate provides the domain types shared between the multiplexer
//! adapter, the daemon engines, and the binary:
//! - Agent sessions and their lifecycle status
//! - Token counts, money, and the per-model price table
//! - Multi-window token limits and their reset boundaries
//! - Usage events, metric data points, and alerts
//! - Captured-output log records
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod agent;
pub mod config;
pub mod cost;
pub mod error;
pub mod log;
pub mod model;
pub mod session;
pub mod tokens;
pub mod usage;
pub mod window;

// Re-exports for convenience
pub use agent::{AgentId, AgentType};
pub use config::{ConfigError, FleetConfig, MetricsConfig, QuotaConfig, SupervisorConfig};
pub use cost::Money;
pub use error::{FleetError, FleetResult};
pub use log::{classify_line, LogLevel, LogRecord};
pub use model::Model;
pub use session::{
    AgentSession, SessionConfig, SessionId, SessionMetrics, SessionResources, SessionStatus,
};
pub use tokens::TokenCount;
pub use usage::{
    AlertSeverity, Metadata, TokenAlert, TokenDataPoint, TokenUsageEvent, UsageOperation,
};
pub use window::{LimitUpdate, TokenLimit, UsageWindow, WindowUsage};
