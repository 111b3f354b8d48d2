//! End-to-end wiring of supervisor, quota engine and metrics bus.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, session_config, FakeMux};
use fleet_core::{AgentId, FleetConfig, LimitUpdate, TokenUsageEvent};
use fleetd::quota::EnforcementAction;
use fleetd::{Fleet, HistoryBackend, MemoryHistoryBackend, MemoryLogStore, TerminationReason};

fn config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.supervisor = common::fast_config();
    config
}

#[tokio::test]
async fn test_quota_block_terminates_agent_session() {
    let mux = FakeMux::new();
    let history = Arc::new(MemoryHistoryBackend::new());
    let fleet = Fleet::start(
        config(),
        mux.clone(),
        Arc::new(MemoryLogStore::new()),
        history.clone(),
    )
    .await;

    let agent = AgentId::new("dev-1");
    let session = fleet.supervisor.spawn(session_config("dev-1")).await;
    fleet
        .quota
        .set_limits(&agent, None, LimitUpdate::daily(100))
        .unwrap();

    let usage = TokenUsageEvent::new("dev-1", 97).with_prp_id("PRP-001");
    fleet.quota.record_usage(usage.clone()).unwrap();

    // The bus saw the usage
    let latest = fleet.metrics.get_latest_data(Some(&agent), 1);
    assert_eq!(latest[0].metadata.get("prp_id").map(String::as_str), Some("PRP-001"));

    let enforcement = fleet.quota.enforce(&usage);
    if enforcement.action == EnforcementAction::Blocked {
        fleet
            .supervisor
            .terminate(&session.id, TerminationReason::QuotaExceeded)
            .await;
    }
    assert!(fleet.supervisor.get_session(&session.id).await.is_none());
    assert!(!mux.has_pane(&session.session_name));
    assert_eq!(fleet.metrics.active_alerts().len(), 1);

    fleet.shutdown().await;

    // Shutdown writes the history one last time
    assert!(history
        .load(fleetd::metrics::HISTORY_KEY)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_shutdown_stops_all_sessions() {
    let mux = FakeMux::new();
    let fleet = Fleet::start(
        config(),
        mux.clone(),
        Arc::new(MemoryLogStore::new()),
        Arc::new(MemoryHistoryBackend::new()),
    )
    .await;

    let a = fleet.supervisor.spawn(session_config("a")).await;
    let b = fleet.supervisor.spawn(session_config("b")).await;
    let supervisor = fleet.supervisor.clone();

    fleet.shutdown().await;

    assert_eq!(supervisor.session_count(), 0);
    assert!(eventually(Duration::from_secs(1), || {
        !mux.has_pane(&a.session_name) && !mux.has_pane(&b.session_name)
    })
    .await);
}
