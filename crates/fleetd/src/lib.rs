//! agent-fleet daemon library.
//!
//! - `supervisor` - agent session lifecycle over a terminal multiplexer
//! - `quota` - token usage accounting, limits and enforcement
//! - `metrics` - token data point fan-out, history and dashboard data
//! - `logstream` / `logstore` - captured output to structured log records
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           fleetd                              │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌──────────────┐   capture   ┌──────────────────┐            │
//! │  │  Supervisor  │────────────▶│    LogStream     │──▶ LogStore│
//! │  └──────┬───────┘             └──────────────────┘            │
//! │         │ Multiplexer (tmux)                                  │
//! │         ▼                                                     │
//! │   agent sessions                                              │
//! │                                                               │
//! │  ┌──────────────┐  data points ┌──────────────┐               │
//! │  │ QuotaEngine  │─────────────▶│  MetricsBus  │──▶ subscribers│
//! │  └──────────────┘    alerts    └──────┬───────┘               │
//! │                                       ▼                       │
//! │                                HistoryBackend                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Production code never calls `.unwrap()` or `.expect()`. Multiplexer
//! failures become session state transitions or events, and subscriber
//! panics are caught and reported as bus events.

pub mod fleet;
pub mod logstore;
pub mod logstream;
pub mod metrics;
pub mod persistence;
pub mod quota;
pub mod resources;
pub mod store;
pub mod supervisor;

pub use fleet::Fleet;
pub use logstore::{LogStore, LogStoreError, MemoryLogStore, SessionOutcome, TracingLogStore};
pub use logstream::LogStreamProcessor;
pub use metrics::{BusEvent, MetricsBus, SubscriptionId, Timeframe};
pub use persistence::{FileHistoryBackend, HistoryBackend, MemoryHistoryBackend, PersistenceError};
pub use quota::{EnforcementAction, QuotaEngine, QuotaEvent};
pub use supervisor::{Supervisor, SupervisorEvent, TerminationReason};
