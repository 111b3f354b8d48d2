//! Token quota engine.
//!
//! Records token usage per agent against daily, weekly and monthly windows,
//! raises threshold notifications, and decides enforcement tiers. Window
//! resets are applied lazily whenever an agent's usage is touched.
//!
//! Per-agent state lives in a `DashMap`, so recording for different agents
//! does not contend. Every recorded event is also published to the metrics
//! bus as one data point when a bus is attached.

mod events;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fleet_core::{
    AgentId, AgentType, AlertSeverity, FleetError, FleetResult, LimitUpdate, Model, Money,
    QuotaConfig, TokenAlert, TokenCount, TokenDataPoint, TokenLimit, TokenUsageEvent,
    UsageWindow,
};

use crate::metrics::MetricsBus;

pub use events::{
    AgentUsageReport, ApproachingLimit, Enforcement, EnforcementAction, ExceededLimits,
    QuotaEvent, WindowReport, BLOCKED_PCT, CRITICAL_PCT, WARNING_PCT,
};

const EVENT_BUFFER: usize = 256;

/// Everything tracked for one agent.
#[derive(Debug, Clone)]
struct AgentLedger {
    limit: TokenLimit,
    total_tokens: TokenCount,
    request_count: u64,
    total_cost: Money,
    by_operation: BTreeMap<String, TokenCount>,
    last_activity: Option<DateTime<Utc>>,
}

impl AgentLedger {
    fn new(limit: TokenLimit) -> Self {
        Self {
            limit,
            total_tokens: TokenCount::zero(),
            request_count: 0,
            total_cost: Money::zero(),
            by_operation: BTreeMap::new(),
            last_activity: None,
        }
    }

    fn report(&self) -> AgentUsageReport {
        let average = if self.request_count == 0 {
            0.0
        } else {
            self.total_tokens.as_u64() as f64 / self.request_count as f64
        };
        AgentUsageReport {
            agent_id: self.limit.agent_id.clone(),
            agent_type: self.limit.agent_type.clone(),
            total_tokens: self.total_tokens,
            request_count: self.request_count,
            average_tokens_per_request: average,
            total_cost: self.total_cost,
            windows: UsageWindow::ALL
                .into_iter()
                .map(|window| WindowReport {
                    window,
                    used: self.limit.used(window),
                    limit: self.limit.limit(window),
                    remaining: self.limit.remaining(window),
                    percent_used: self.limit.percent_used(window),
                    next_reset: self.limit.usage(window).next_reset,
                })
                .collect(),
            by_operation: self.by_operation.clone(),
            last_activity: self.last_activity,
        }
    }
}

struct QuotaInner {
    config: QuotaConfig,
    agents: DashMap<AgentId, AgentLedger>,
    /// Most recent usage events, oldest first
    history: Mutex<VecDeque<TokenUsageEvent>>,
    alerts: Mutex<Vec<TokenAlert>>,
    events: broadcast::Sender<QuotaEvent>,
    bus: Option<MetricsBus>,
}

/// Handle to the quota engine. Cheap to clone.
#[derive(Clone)]
pub struct QuotaEngine {
    inner: Arc<QuotaInner>,
}

impl QuotaEngine {
    pub fn new(config: QuotaConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates an engine that publishes every recorded event to `bus`.
    pub fn with_bus(config: QuotaConfig, bus: MetricsBus) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: QuotaConfig, bus: Option<MetricsBus>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(QuotaInner {
                config,
                agents: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                alerts: Mutex::new(Vec::new()),
                events,
                bus,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuotaEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.inner.config
    }

    fn emit(&self, event: QuotaEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Returns the agent's ledger, creating it with the configured defaults
    /// and rolling any expired windows.
    fn ledger<Tz: TimeZone>(
        &self,
        agent_id: &AgentId,
        agent_type: &AgentType,
        now: &DateTime<Tz>,
    ) -> RefMut<'_, AgentId, AgentLedger> {
        let mut ledger = self
            .inner
            .agents
            .entry(agent_id.clone())
            .or_insert_with(|| {
                debug!(agent_id = %agent_id, "Tracking new agent");
                AgentLedger::new(TokenLimit::with_defaults(
                    agent_id.clone(),
                    agent_type.clone(),
                    self.inner.config.default_limits(),
                    now,
                ))
            });
        let reset = ledger.limit.roll_windows(now);
        self.report_resets(agent_id, &reset);
        ledger
    }

    fn report_resets(&self, agent_id: &AgentId, windows: &[UsageWindow]) {
        for window in windows {
            info!(agent_id = %agent_id, window = %window, "Usage window reset");
            self.emit(QuotaEvent::WindowReset {
                agent_id: agent_id.clone(),
                window: *window,
            });
        }
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Records a usage event in local time.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the event has no concrete agent id.
    pub fn record_usage(&self, event: TokenUsageEvent) -> FleetResult<TokenDataPoint> {
        self.record_usage_at(event, &Local::now())
    }

    /// Records a usage event, evaluating window boundaries at `now`.
    ///
    /// Returns the data point published for the event.
    pub fn record_usage_at<Tz: TimeZone>(
        &self,
        event: TokenUsageEvent,
        now: &DateTime<Tz>,
    ) -> FleetResult<TokenDataPoint> {
        event.validate()?;
        let cost = Model::cost_for(event.model.as_deref(), event.tokens);

        let limit = {
            let mut ledger = self.ledger(&event.agent_id, &event.agent_type, now);
            ledger.limit.record(event.tokens, now);
            ledger.total_tokens += event.tokens;
            ledger.request_count = ledger.request_count.saturating_add(1);
            ledger.total_cost += cost;
            *ledger
                .by_operation
                .entry(event.operation.as_str().to_string())
                .or_default() += event.tokens;
            ledger.last_activity = Some(event.timestamp);
            ledger.limit.clone()
        };

        debug!(
            agent_id = %event.agent_id,
            tokens = event.tokens.as_u64(),
            operation = %event.operation,
            daily_used = limit.daily.used.as_u64(),
            "Token usage recorded"
        );

        let point = TokenDataPoint {
            agent_id: event.agent_id.clone(),
            timestamp: event.timestamp,
            tokens_used: event.tokens,
            limit: limit.daily_limit,
            remaining: limit.remaining(UsageWindow::Daily),
            cost,
            operation: event.operation.clone(),
            model: event.model.clone(),
            metadata: event.metadata.clone(),
        };

        {
            let capacity = self.inner.config.history_capacity.max(1);
            let mut history = self.inner.history.lock();
            history.push_back(event);
            while history.len() > capacity {
                history.pop_front();
            }
        }

        if let Some(bus) = &self.inner.bus {
            if let Err(e) = bus.publish(point.clone()) {
                warn!(agent_id = %point.agent_id, error = %e, "Failed to publish usage data point");
            }
        }

        self.check_thresholds(&limit);
        Ok(point)
    }

    fn check_thresholds(&self, limit: &TokenLimit) {
        let exceeded = limit.exceeded_windows();
        if !exceeded.is_empty() {
            warn!(agent_id = %limit.agent_id, windows = ?exceeded, "Token limit exceeded");
            self.emit(QuotaEvent::LimitExceeded {
                agent_id: limit.agent_id.clone(),
                windows: exceeded,
            });
            return;
        }

        for window in UsageWindow::ALL {
            if limit.limit(window).is_zero() {
                continue;
            }
            let percent_used = limit.percent_used(window);
            if percent_used >= self.inner.config.warning_threshold_pct {
                debug!(agent_id = %limit.agent_id, window = %window, percent_used, "Token limit approached");
                self.emit(QuotaEvent::LimitApproached {
                    agent_id: limit.agent_id.clone(),
                    window,
                    percent_used,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------

    /// Sets limits for an agent, creating it if unknown. Unset fields of
    /// `update` keep their current value.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty or wildcard agent id.
    pub fn set_limits(
        &self,
        agent_id: &AgentId,
        agent_type: Option<AgentType>,
        update: LimitUpdate,
    ) -> FleetResult<TokenLimit> {
        if agent_id.is_empty() || agent_id.is_wildcard() {
            return Err(FleetError::invalid_argument(
                "agent_id",
                "limits need a concrete agent id",
            ));
        }
        let now = Local::now();
        let default_type = agent_type.clone().unwrap_or_default();
        let mut ledger = self.ledger(agent_id, &default_type, &now);
        if let Some(agent_type) = agent_type {
            ledger.limit.agent_type = agent_type;
        }
        ledger.limit.apply(update);
        info!(
            agent_id = %agent_id,
            daily = ledger.limit.daily_limit.as_u64(),
            weekly = ledger.limit.weekly_limit.as_u64(),
            monthly = ledger.limit.monthly_limit.as_u64(),
            "Token limits updated"
        );
        Ok(ledger.limit.clone())
    }

    /// Current limits and usage of an agent.
    pub fn get_limits(&self, agent_id: &AgentId) -> Option<TokenLimit> {
        let mut ledger = self.inner.agents.get_mut(agent_id)?;
        let reset = ledger.limit.roll_windows(&Local::now());
        self.report_resets(agent_id, &reset);
        Some(ledger.limit.clone())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Windows of every agent at or above `threshold_pct`, highest first.
    pub fn check_approaching_limits(&self, threshold_pct: f64) -> Vec<ApproachingLimit> {
        self.check_approaching_limits_at(threshold_pct, &Local::now())
    }

    pub fn check_approaching_limits_at<Tz: TimeZone>(
        &self,
        threshold_pct: f64,
        now: &DateTime<Tz>,
    ) -> Vec<ApproachingLimit> {
        let mut approaching = Vec::new();
        for mut ledger in self.inner.agents.iter_mut() {
            let reset = ledger.limit.roll_windows(now);
            self.report_resets(ledger.key(), &reset);
            let limit = &ledger.limit;
            for window in UsageWindow::ALL {
                if limit.limit(window).is_zero() {
                    continue;
                }
                let percent_used = limit.percent_used(window);
                if percent_used >= threshold_pct {
                    approaching.push(ApproachingLimit {
                        agent_id: limit.agent_id.clone(),
                        window,
                        used: limit.used(window),
                        limit: limit.limit(window),
                        percent_used,
                    });
                }
            }
        }
        approaching.sort_by(|a, b| b.percent_used.total_cmp(&a.percent_used));
        approaching
    }

    /// Windows in which the agent is over its limit. Unknown agents are
    /// never over.
    pub fn has_exceeded_limits(&self, agent_id: &AgentId) -> ExceededLimits {
        self.has_exceeded_limits_at(agent_id, &Local::now())
    }

    pub fn has_exceeded_limits_at<Tz: TimeZone>(
        &self,
        agent_id: &AgentId,
        now: &DateTime<Tz>,
    ) -> ExceededLimits {
        let Some(mut ledger) = self.inner.agents.get_mut(agent_id) else {
            return ExceededLimits::default();
        };
        let reset = ledger.limit.roll_windows(now);
        self.report_resets(agent_id, &reset);
        let windows = ledger.limit.exceeded_windows();
        ExceededLimits {
            exceeded: !windows.is_empty(),
            windows,
        }
    }

    // ------------------------------------------------------------------
    // Enforcement
    // ------------------------------------------------------------------

    /// Decides the enforcement tier for the event's agent from its daily
    /// usage percentage.
    ///
    /// Every tier above `None` raises an alert of the matching severity;
    /// warning also emits `LimitWarning`.
    pub fn enforce(&self, event: &TokenUsageEvent) -> Enforcement {
        self.enforce_at(event, &Local::now())
    }

    pub fn enforce_at<Tz: TimeZone>(&self, event: &TokenUsageEvent, now: &DateTime<Tz>) -> Enforcement {
        let percent_used = match self.inner.agents.get_mut(&event.agent_id) {
            Some(mut ledger) => {
                let reset = ledger.limit.roll_windows(now);
                self.report_resets(&event.agent_id, &reset);
                ledger.limit.percent_used(UsageWindow::Daily)
            }
            None => 0.0,
        };

        let action = EnforcementAction::for_percent(percent_used);
        if action == EnforcementAction::Warning {
            self.emit(QuotaEvent::LimitWarning {
                agent_id: event.agent_id.clone(),
                percent_used,
            });
        }
        let alert = action.alert_severity().map(|severity| {
            let message = match action {
                EnforcementAction::Blocked => {
                    format!("Agent blocked at {percent_used:.1}% of daily token limit")
                }
                EnforcementAction::Critical => {
                    format!("Agent throttled at {percent_used:.1}% of daily token limit")
                }
                _ => format!("Agent at {percent_used:.1}% of daily token limit"),
            };
            self.create_alert(&event.agent_id, severity, message)
        });

        if action != EnforcementAction::None {
            warn!(agent_id = %event.agent_id, ?action, percent_used, "Token quota enforcement");
        }

        Enforcement {
            action,
            percent_used,
            alert,
        }
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Stores a new alert and forwards it to the bus.
    pub fn create_alert(
        &self,
        agent_id: &AgentId,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> TokenAlert {
        let alert = TokenAlert::new(agent_id.clone(), severity, message);
        self.inner.alerts.lock().push(alert.clone());
        if let Some(bus) = &self.inner.bus {
            bus.add_alert(alert.clone());
        }
        self.emit(QuotaEvent::AlertCreated {
            alert: alert.clone(),
        });
        alert
    }

    /// Alerts, optionally for one agent, newest first.
    pub fn alerts(&self, agent_id: Option<&AgentId>, include_acknowledged: bool) -> Vec<TokenAlert> {
        self.inner
            .alerts
            .lock()
            .iter()
            .rev()
            .filter(|a| agent_id.map_or(true, |id| &a.agent_id == id))
            .filter(|a| include_acknowledged || !a.acknowledged)
            .cloned()
            .collect()
    }

    /// # Errors
    ///
    /// `NotFound` if no alert has `alert_id`.
    pub fn acknowledge_alert(&self, alert_id: &str) -> FleetResult<()> {
        {
            let mut alerts = self.inner.alerts.lock();
            let alert = alerts
                .iter_mut()
                .find(|a| a.id == alert_id)
                .ok_or_else(|| FleetError::not_found("alert", alert_id))?;
            alert.acknowledged = true;
        }
        if let Some(bus) = &self.inner.bus {
            bus.acknowledge_alert(alert_id);
        }
        debug!(alert_id, "Alert acknowledged");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reports and maintenance
    // ------------------------------------------------------------------

    /// Usage reports for one agent or all agents, sorted by agent id.
    pub fn get_usage_report(&self, agent_id: Option<&AgentId>) -> Vec<AgentUsageReport> {
        let now = Local::now();
        let mut reports: Vec<AgentUsageReport> = self
            .inner
            .agents
            .iter_mut()
            .filter(|ledger| agent_id.map_or(true, |id| ledger.key() == id))
            .map(|mut ledger| {
                let reset = ledger.limit.roll_windows(&now);
                self.report_resets(ledger.key(), &reset);
                ledger.report()
            })
            .collect();
        reports.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        reports
    }

    /// Most recent usage events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<TokenUsageEvent> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    /// Resets every window whose boundary has passed; returns how many.
    pub fn reset_expired_windows(&self) -> usize {
        self.reset_expired_windows_at(&Local::now())
    }

    pub fn reset_expired_windows_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> usize {
        let mut count = 0;
        for mut ledger in self.inner.agents.iter_mut() {
            let reset = ledger.limit.roll_windows(now);
            count += reset.len();
            self.report_resets(ledger.key(), &reset);
        }
        count
    }

    pub fn agent_count(&self) -> usize {
        self.inner.agents.len()
    }
}

impl std::fmt::Debug for QuotaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEngine")
            .field("agents", &self.inner.agents.len())
            .finish()
    }
}
