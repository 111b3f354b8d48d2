//! Integration tests for the token quota engine.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::drain;
use fleet_core::{
    AgentId, AlertSeverity, FleetError, LimitUpdate, MetricsConfig, QuotaConfig, TokenUsageEvent,
    UsageOperation, UsageWindow,
};
use fleetd::quota::{EnforcementAction, QuotaEngine, QuotaEvent};
use fleetd::{BusEvent, MemoryHistoryBackend, MetricsBus};

// ============================================================================
// Test Helpers
// ============================================================================

fn engine_with_daily(agent: &str, daily: u64) -> QuotaEngine {
    let engine = QuotaEngine::new(QuotaConfig::default());
    engine
        .set_limits(&AgentId::new(agent), None, LimitUpdate::daily(daily))
        .unwrap();
    engine
}

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

// ============================================================================
// Limits and Thresholds
// ============================================================================

#[test]
fn test_approaching_limit_at_81_percent() {
    let engine = engine_with_daily("dev-1", 100);
    engine.record_usage(TokenUsageEvent::new("dev-1", 81)).unwrap();

    let approaching = engine.check_approaching_limits(80.0);
    assert_eq!(approaching.len(), 1, "only the daily window is close: {approaching:?}");
    assert_eq!(approaching[0].agent_id, AgentId::new("dev-1"));
    assert_eq!(approaching[0].window, UsageWindow::Daily);
    assert!((approaching[0].percent_used - 81.0).abs() < f64::EPSILON);
}

#[test]
fn test_approaching_limits_sorted_descending() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    for (agent, used) in [("a", 85), ("b", 99), ("c", 90)] {
        engine
            .set_limits(&AgentId::new(agent), None, LimitUpdate::daily(100))
            .unwrap();
        engine.record_usage(TokenUsageEvent::new(agent, used)).unwrap();
    }

    let order: Vec<String> = engine
        .check_approaching_limits(80.0)
        .into_iter()
        .map(|a| a.agent_id.to_string())
        .collect();
    assert_eq!(order, vec!["b", "c", "a"]);
}

#[test]
fn test_limit_events() {
    let engine = engine_with_daily("dev-1", 100);
    let mut events = engine.subscribe();

    engine.record_usage(TokenUsageEvent::new("dev-1", 85)).unwrap();
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        QuotaEvent::LimitApproached { window: UsageWindow::Daily, .. }
    )));

    engine.record_usage(TokenUsageEvent::new("dev-1", 20)).unwrap();
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        QuotaEvent::LimitExceeded { windows, .. } if windows == &vec![UsageWindow::Daily]
    )));

    let exceeded = engine.has_exceeded_limits(&AgentId::new("dev-1"));
    assert!(exceeded.exceeded);
    assert_eq!(exceeded.windows, vec![UsageWindow::Daily]);
}

#[test]
fn test_usage_equal_to_limit_is_not_exceeded() {
    let engine = engine_with_daily("dev-1", 100);
    engine.record_usage(TokenUsageEvent::new("dev-1", 100)).unwrap();
    assert!(!engine.has_exceeded_limits(&AgentId::new("dev-1")).exceeded);
}

#[test]
fn test_unknown_agent_has_not_exceeded() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    assert!(!engine.has_exceeded_limits(&AgentId::new("ghost")).exceeded);
}

#[test]
fn test_zero_limit_never_exceeds() {
    let engine = engine_with_daily("dev-1", 0);
    engine.record_usage(TokenUsageEvent::new("dev-1", 5_000)).unwrap();
    assert!(!engine.has_exceeded_limits(&AgentId::new("dev-1")).exceeded);
    assert!(engine
        .check_approaching_limits(0.0)
        .iter()
        .all(|a| a.window != UsageWindow::Daily));
}

#[test]
fn test_set_limits_keeps_unset_fields() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    let agent = AgentId::new("dev-1");
    engine
        .set_limits(&agent, None, LimitUpdate::daily(1_000))
        .unwrap();
    let limit = engine
        .set_limits(
            &agent,
            None,
            LimitUpdate {
                weekly: Some(7_000),
                ..LimitUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(limit.daily_limit.as_u64(), 1_000);
    assert_eq!(limit.weekly_limit.as_u64(), 7_000);
    assert_eq!(limit.monthly_limit.as_u64(), 2_000_000);
}

#[test]
fn test_invalid_agent_ids_rejected() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    let err = engine
        .record_usage(TokenUsageEvent::new("*", 10))
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidArgument { .. }));

    let err = engine
        .set_limits(&AgentId::new("  "), None, LimitUpdate::daily(1))
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidArgument { .. }));
    assert_eq!(engine.history_len(), 0);
}

// ============================================================================
// Enforcement
// ============================================================================

#[test]
fn test_enforce_blocks_at_96_percent() {
    let engine = engine_with_daily("dev-1", 100);
    engine.record_usage(TokenUsageEvent::new("dev-1", 96)).unwrap();
    let mut events = engine.subscribe();

    let enforcement = engine.enforce(&TokenUsageEvent::new("dev-1", 1));
    assert_eq!(enforcement.action, EnforcementAction::Blocked);
    let alert = enforcement.alert.expect("blocked raises an alert");
    assert_eq!(alert.severity, AlertSeverity::Blocked);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, QuotaEvent::AlertCreated { .. })));
    assert_eq!(engine.alerts(Some(&AgentId::new("dev-1")), false).len(), 1);
}

#[test]
fn test_enforcement_tiers_are_exclusive() {
    let cases = [
        (79, EnforcementAction::None, None),
        (80, EnforcementAction::Warning, Some(AlertSeverity::Warning)),
        (90, EnforcementAction::Critical, Some(AlertSeverity::Critical)),
        (95, EnforcementAction::Blocked, Some(AlertSeverity::Blocked)),
    ];
    for (used, expected, severity) in cases {
        let agent = format!("agent-{used}");
        let engine = engine_with_daily(&agent, 100);
        engine.record_usage(TokenUsageEvent::new(agent.as_str(), used)).unwrap();
        let mut events = engine.subscribe();

        let enforcement = engine.enforce(&TokenUsageEvent::new(agent.as_str(), 1));
        assert_eq!(enforcement.action, expected, "at {used}%");
        assert_eq!(
            enforcement.alert.as_ref().map(|a| a.severity),
            severity,
            "alert severity at {used}%"
        );

        let events = drain(&mut events);
        let warnings = events
            .iter()
            .filter(|e| matches!(e, QuotaEvent::LimitWarning { .. }))
            .count();
        let alerts = events
            .iter()
            .filter(|e| matches!(e, QuotaEvent::AlertCreated { .. }))
            .count();
        match expected {
            EnforcementAction::None => assert_eq!((warnings, alerts), (0, 0)),
            EnforcementAction::Warning => assert_eq!((warnings, alerts), (1, 1)),
            EnforcementAction::Critical | EnforcementAction::Blocked => {
                assert_eq!((warnings, alerts), (0, 1))
            }
        }
    }
}

#[test]
fn test_enforce_unknown_agent_is_none() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    let enforcement = engine.enforce(&TokenUsageEvent::new("new-agent", 10));
    assert_eq!(enforcement.action, EnforcementAction::None);
    assert!(enforcement.alert.is_none());
}

#[test]
fn test_acknowledge_alert() {
    let engine = engine_with_daily("dev-1", 100);
    engine.record_usage(TokenUsageEvent::new("dev-1", 92)).unwrap();
    let alert = engine
        .enforce(&TokenUsageEvent::new("dev-1", 1))
        .alert
        .unwrap();
    assert_eq!(alert.severity, AlertSeverity::Critical);

    engine.acknowledge_alert(&alert.id).unwrap();
    assert!(engine.alerts(None, false).is_empty());
    assert_eq!(engine.alerts(None, true).len(), 1);

    let err = engine.acknowledge_alert("missing").unwrap_err();
    assert!(matches!(err, FleetError::NotFound { kind: "alert", .. }));
}

// ============================================================================
// Windows
// ============================================================================

#[test]
fn test_windows_reset_lazily_at_boundaries() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    let agent = AgentId::new("dev-1");
    let mut events = engine.subscribe();

    // Wednesday
    engine
        .record_usage_at(TokenUsageEvent::new("dev-1", 50), &at(2030, 1, 16, 10))
        .unwrap();
    // Thursday: new day, same week
    engine
        .record_usage_at(TokenUsageEvent::new("dev-1", 30), &at(2030, 1, 17, 10))
        .unwrap();

    let usage = |now: DateTime<Utc>| {
        engine
            .check_approaching_limits_at(0.0, &now)
            .into_iter()
            .filter(|a| a.agent_id == agent)
            .map(|a| (a.window, a.used.as_u64()))
            .collect::<Vec<_>>()
    };
    let thursday = usage(at(2030, 1, 17, 11));
    assert!(thursday.contains(&(UsageWindow::Daily, 30)));
    assert!(thursday.contains(&(UsageWindow::Weekly, 80)));
    assert!(thursday.contains(&(UsageWindow::Monthly, 80)));

    // Following Monday: daily and weekly reset, monthly keeps counting
    engine
        .record_usage_at(TokenUsageEvent::new("dev-1", 5), &at(2030, 1, 21, 10))
        .unwrap();
    let monday = usage(at(2030, 1, 21, 11));
    assert!(monday.contains(&(UsageWindow::Daily, 5)));
    assert!(monday.contains(&(UsageWindow::Weekly, 5)));
    assert!(monday.contains(&(UsageWindow::Monthly, 85)));

    let resets: Vec<UsageWindow> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            QuotaEvent::WindowReset { window, .. } => Some(window),
            _ => None,
        })
        .collect();
    assert_eq!(
        resets,
        vec![UsageWindow::Daily, UsageWindow::Daily, UsageWindow::Weekly]
    );
}

#[test]
fn test_reset_expired_windows_sweeps_all_agents() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    for agent in ["a", "b"] {
        engine
            .record_usage_at(TokenUsageEvent::new(agent, 10), &at(2030, 1, 16, 10))
            .unwrap();
    }
    // Two days later only the daily windows have passed
    assert_eq!(engine.reset_expired_windows_at(&at(2030, 1, 18, 10)), 2);
    assert_eq!(engine.reset_expired_windows_at(&at(2030, 1, 18, 11)), 0);
}

// ============================================================================
// Reports and History
// ============================================================================

#[test]
fn test_usage_report() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    engine
        .record_usage(
            TokenUsageEvent::new("dev-1", 1_000)
                .with_model("claude-3-opus")
                .with_operation(UsageOperation::Request),
        )
        .unwrap();
    engine
        .record_usage(
            TokenUsageEvent::new("dev-1", 500)
                .with_model("claude-3-opus")
                .with_operation(UsageOperation::Response),
        )
        .unwrap();
    engine.record_usage(TokenUsageEvent::new("dev-2", 10)).unwrap();

    let reports = engine.get_usage_report(None);
    assert_eq!(reports.len(), 2);

    let report = &engine.get_usage_report(Some(&AgentId::new("dev-1")))[0];
    assert_eq!(report.total_tokens.as_u64(), 1_500);
    assert_eq!(report.request_count, 2);
    assert!((report.average_tokens_per_request - 750.0).abs() < f64::EPSILON);
    assert!((report.total_cost.as_usd() - 0.0225).abs() < 1e-9);
    assert_eq!(report.by_operation["request"].as_u64(), 1_000);
    assert_eq!(report.by_operation["response"].as_u64(), 500);
    assert_eq!(report.windows.len(), 3);
    assert!(report.last_activity.is_some());
}

#[test]
fn test_history_ring_is_bounded() {
    let engine = QuotaEngine::new(QuotaConfig {
        history_capacity: 5,
        ..QuotaConfig::default()
    });
    for i in 1..=8 {
        engine.record_usage(TokenUsageEvent::new("dev-1", i)).unwrap();
    }
    assert_eq!(engine.history_len(), 5);
    let recent = engine.recent_events(2);
    let tokens: Vec<u64> = recent.iter().map(|e| e.tokens.as_u64()).collect();
    assert_eq!(tokens, vec![7, 8]);
}

#[test]
fn test_concurrent_recording_is_monotonic() {
    let engine = QuotaEngine::new(QuotaConfig::default());
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    engine.record_usage(TokenUsageEvent::new("shared", 1)).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let report = &engine.get_usage_report(Some(&AgentId::new("shared")))[0];
    assert_eq!(report.total_tokens.as_u64(), 800);
    assert_eq!(report.request_count, 800);
    let daily = report
        .windows
        .iter()
        .find(|w| w.window == UsageWindow::Daily)
        .unwrap();
    assert_eq!(daily.used.as_u64(), 800);
}

// ============================================================================
// Bus Integration
// ============================================================================

#[tokio::test]
async fn test_usage_is_published_to_bus() {
    let bus = MetricsBus::new(MetricsConfig::default(), Arc::new(MemoryHistoryBackend::new()));
    let engine = QuotaEngine::with_bus(QuotaConfig::default(), bus.clone());
    engine
        .set_limits(&AgentId::new("dev-1"), None, LimitUpdate::daily(100))
        .unwrap();
    let mut bus_events = bus.subscribe_events();

    let point = engine.record_usage(TokenUsageEvent::new("dev-1", 81)).unwrap();
    assert_eq!(point.limit.as_u64(), 100);
    assert_eq!(point.remaining.as_u64(), 19);

    let latest = bus.get_latest_data(Some(&AgentId::new("dev-1")), 10);
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].tokens_used.as_u64(), 81);

    engine.record_usage(TokenUsageEvent::new("dev-1", 15)).unwrap();
    engine.enforce(&TokenUsageEvent::new("dev-1", 1));
    let alert_forwarded = common::wait_for(&mut bus_events, Duration::from_secs(1), |e| {
        matches!(e, BusEvent::AlertAdded { .. })
    })
    .await;
    assert!(alert_forwarded.is_some());
    assert_eq!(bus.active_alerts().len(), 1);
}
