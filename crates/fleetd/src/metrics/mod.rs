//! Metrics stream bus.
//!
//! Token data points are published once and fanned out to subscribers
//! filtered by agent id (or `"*"` for every agent). The bus also keeps a
//! ring of recent points, a capped per-agent history that survives
//! restarts, and the alert list shown on dashboards.
//!
//! # Delivery
//!
//! ```text
//! publish() ──▶ ring buffer + history
//!     │
//!     └─unbounded─▶ dispatcher task ──▶ per-subscriber queue ──▶ worker ──▶ callback
//! ```
//!
//! `publish` never waits on a subscriber. Each subscriber has its own queue
//! and worker, so a slow or failing callback only delays itself, and every
//! subscriber sees points in publish order.
//!
//! Subscriber queues hold at most `buffer_size` points. When a queue is
//! full the point is dropped for that subscriber alone and a
//! `SubscriberLagged` event reports the running drop count.

mod dashboard;
mod events;
mod projection;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_core::{
    AgentId, FleetError, FleetResult, MetricsConfig, Money, TokenAlert, TokenCount,
    TokenDataPoint,
};

use crate::persistence::{HistoryBackend, PersistenceError};

pub use dashboard::{AgentSummary, DashboardData};
pub use events::{BusEvent, SubscriptionId};
pub use projection::{project, tokens_in_last_hour, Confidence, Projection, Timeframe};

/// Key under which the history is persisted.
pub const HISTORY_KEY: &str = "token-history";

const EVENT_BUFFER: usize = 1024;

/// Error returned by a subscriber callback.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&TokenDataPoint) -> Result<(), SubscriberError> + Send + Sync>;

struct Subscription {
    agent_id: AgentId,
    queue: mpsc::Sender<TokenDataPoint>,
    /// Points dropped because the queue was full
    dropped: AtomicUsize,
}

impl Subscription {
    fn wants(&self, point: &TokenDataPoint) -> bool {
        self.agent_id.is_wildcard() || self.agent_id == point.agent_id
    }
}

type Subscriptions = Arc<RwLock<HashMap<SubscriptionId, Subscription>>>;

struct BusInner {
    config: MetricsConfig,
    buffer: Mutex<VecDeque<TokenDataPoint>>,
    history: Mutex<HashMap<AgentId, VecDeque<TokenDataPoint>>>,
    subscriptions: Subscriptions,
    alerts: Mutex<Vec<TokenAlert>>,
    dispatch: mpsc::UnboundedSender<TokenDataPoint>,
    events: broadcast::Sender<BusEvent>,
    backend: Arc<dyn HistoryBackend>,
    /// History changed since the last successful flush
    dirty: AtomicBool,
}

/// Handle to the metrics bus. Cheap to clone.
#[derive(Clone)]
pub struct MetricsBus {
    inner: Arc<BusInner>,
}

impl MetricsBus {
    /// Creates the bus and spawns its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(config: MetricsConfig, backend: Arc<dyn HistoryBackend>) -> Self {
        let (dispatch, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(dispatch_loop(rx, Arc::clone(&subscriptions), events.clone()));

        Self {
            inner: Arc::new(BusInner {
                config,
                buffer: Mutex::new(VecDeque::new()),
                history: Mutex::new(HashMap::new()),
                subscriptions,
                alerts: Mutex::new(Vec::new()),
                dispatch,
                events,
                backend,
                dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Creates the bus and reloads persisted history before returning, so
    /// subscribers never observe a partially restored history.
    pub async fn start(config: MetricsConfig, backend: Arc<dyn HistoryBackend>) -> Self {
        let bus = Self::new(config, backend);
        match bus.restore().await {
            Ok(points) => info!(points, "Metrics history restored"),
            Err(e) => warn!(error = %e, "Failed to restore metrics history, starting empty"),
        }
        bus
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.inner.config
    }

    /// Subscribes to bus events (backpressure, drops, subscriber errors).
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: BusEvent) {
        let _ = self.inner.events.send(event);
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Registers `callback` for points of `agent_id` (`"*"` for all).
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty agent id
    /// - `LimitExceeded` when the agent already has `max_subscribers`
    pub fn subscribe<F>(&self, agent_id: impl Into<AgentId>, callback: F) -> FleetResult<SubscriptionId>
    where
        F: Fn(&TokenDataPoint) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let agent_id = agent_id.into();
        if agent_id.is_empty() {
            return Err(FleetError::invalid_argument(
                "agent_id",
                "subscriptions need an agent id or \"*\"",
            ));
        }

        let max = self.inner.config.max_subscribers;
        let subscription_id = SubscriptionId::generate();
        let rx = {
            let mut subscriptions = self.inner.subscriptions.write();
            let existing = subscriptions
                .values()
                .filter(|s| s.agent_id == agent_id)
                .count();
            if existing >= max {
                return Err(FleetError::LimitExceeded {
                    what: format!("subscribers for agent {agent_id}"),
                    max,
                });
            }
            let (queue, rx) = mpsc::channel(self.inner.config.buffer_size.max(1));
            subscriptions.insert(
                subscription_id.clone(),
                Subscription {
                    agent_id: agent_id.clone(),
                    queue,
                    dropped: AtomicUsize::new(0),
                },
            );
            rx
        };

        spawn_subscriber(
            subscription_id.clone(),
            Arc::new(callback),
            rx,
            self.inner.events.clone(),
        );

        debug!(subscription_id = %subscription_id, agent_id = %agent_id, "Subscriber added");
        self.emit(BusEvent::SubscriberAdded {
            subscription_id: subscription_id.clone(),
            agent_id,
        });
        Ok(subscription_id)
    }

    /// Removes a subscription. Points already queued for it are still
    /// delivered. Returns false for an unknown id.
    pub fn unsubscribe(&self, subscription_id: &SubscriptionId) -> bool {
        let removed = self.inner.subscriptions.write().remove(subscription_id);
        match removed {
            Some(subscription) => {
                debug!(subscription_id = %subscription_id, "Subscriber removed");
                self.emit(BusEvent::SubscriberRemoved {
                    subscription_id: subscription_id.clone(),
                    agent_id: subscription.agent_id,
                });
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Buffers a point, appends it to its agent's history and queues it for
    /// delivery. Never waits on subscribers.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the point fails validation.
    pub fn publish(&self, point: TokenDataPoint) -> FleetResult<()> {
        point.validate()?;

        let notices = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push_back(point.clone());
            let notices = relieve_backpressure(&mut buffer, self.inner.config.backpressure_threshold);
            let capacity = self.inner.config.buffer_size.max(1);
            while buffer.len() > capacity {
                buffer.pop_front();
            }
            notices
        };
        for notice in notices {
            if let BusEvent::DataDropped { count } = &notice {
                warn!(count, "Dropped buffered data points under backpressure");
            }
            self.emit(notice);
        }

        {
            let cap = self.inner.config.history_per_agent.max(1);
            let mut history = self.inner.history.lock();
            let series = history.entry(point.agent_id.clone()).or_default();
            series.push_back(point.clone());
            while series.len() > cap {
                series.pop_front();
            }
        }
        self.inner.dirty.store(true, Ordering::Release);

        if self.inner.dispatch.send(point).is_err() {
            debug!("Dispatcher stopped, point not delivered");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Up to `limit` most recent buffered points, newest first, optionally
    /// for one agent.
    pub fn get_latest_data(&self, agent_id: Option<&AgentId>, limit: usize) -> Vec<TokenDataPoint> {
        self.inner
            .buffer
            .lock()
            .iter()
            .rev()
            .filter(|p| agent_id.map_or(true, |a| &p.agent_id == a))
            .take(limit)
            .cloned()
            .collect()
    }

    /// An agent's retained history, oldest first, optionally since a time.
    pub fn get_historical_data(
        &self,
        agent_id: &AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Vec<TokenDataPoint> {
        self.inner
            .history
            .lock()
            .get(agent_id)
            .map(|series| {
                series
                    .iter()
                    .filter(|p| since.map_or(true, |s| p.timestamp >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Extrapolates the agent's last hour of usage over `timeframe`.
    pub fn projection(&self, agent_id: &AgentId, timeframe: Timeframe) -> Projection {
        self.projection_at(agent_id, timeframe, Utc::now())
    }

    pub fn projection_at(
        &self,
        agent_id: &AgentId,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Projection {
        let history = self.inner.history.lock();
        let series = history.get(agent_id).into_iter().flatten();
        project(agent_id, series, timeframe, now)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub fn add_alert(&self, alert: TokenAlert) {
        debug!(alert_id = %alert.id, agent_id = %alert.agent_id, severity = %alert.severity, "Alert added");
        self.inner.alerts.lock().push(alert.clone());
        self.emit(BusEvent::AlertAdded { alert });
    }

    /// Unacknowledged alerts, newest first.
    pub fn active_alerts(&self) -> Vec<TokenAlert> {
        self.inner
            .alerts
            .lock()
            .iter()
            .rev()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> bool {
        let mut alerts = self.inner.alerts.lock();
        match alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Dashboard
    // ------------------------------------------------------------------

    /// Aggregates the current state for a terminal dashboard.
    pub fn get_tui_dashboard_data(&self) -> DashboardData {
        let now = Utc::now();
        let latest: HashMap<AgentId, TokenDataPoint> = {
            let buffer = self.inner.buffer.lock();
            let mut latest = HashMap::new();
            for point in buffer.iter() {
                latest.insert(point.agent_id.clone(), point.clone());
            }
            latest
        };

        let mut agents: BTreeMap<AgentId, AgentSummary> = BTreeMap::new();
        {
            let history = self.inner.history.lock();
            for (agent_id, series) in history.iter() {
                let tokens_last_hour = tokens_in_last_hour(series, now);
                agents.insert(
                    agent_id.clone(),
                    AgentSummary {
                        agent_id: agent_id.clone(),
                        latest: series.back().cloned(),
                        total_tokens: series.iter().map(|p| p.tokens_used).sum(),
                        total_cost: series.iter().map(|p| p.cost).sum(),
                        tokens_last_hour,
                        projected_daily: TokenCount::new(
                            tokens_last_hour
                                .as_u64()
                                .saturating_mul(Timeframe::Day.hours()),
                        ),
                        data_points: series.len(),
                    },
                );
            }
        }
        for (agent_id, point) in latest {
            if let Some(summary) = agents.get_mut(&agent_id) {
                summary.latest = Some(point);
            }
        }

        let agents: Vec<AgentSummary> = agents.into_values().collect();
        let total_tokens: TokenCount = agents.iter().map(|a| a.total_tokens).sum();
        let total_cost: Money = agents.iter().map(|a| a.total_cost).sum();

        DashboardData {
            generated_at: now,
            agents,
            alerts: self.active_alerts(),
            subscriber_count: self.subscriber_count(),
            buffered_points: self.buffered_len(),
            total_tokens,
            total_cost,
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Reloads the persisted history, replacing series of the same agents.
    ///
    /// Returns the number of points restored.
    pub async fn restore(&self) -> Result<usize, PersistenceError> {
        let Some(bytes) = self.inner.backend.load(HISTORY_KEY).await? else {
            return Ok(0);
        };
        let saved: BTreeMap<AgentId, Vec<TokenDataPoint>> = serde_json::from_slice(&bytes)?;

        let cap = self.inner.config.history_per_agent.max(1);
        let mut restored = 0;
        let mut history = self.inner.history.lock();
        for (agent_id, points) in saved {
            let skip = points.len().saturating_sub(cap);
            let series: VecDeque<TokenDataPoint> = points.into_iter().skip(skip).collect();
            restored += series.len();
            history.insert(agent_id, series);
        }
        Ok(restored)
    }

    /// Saves the history if it changed since the last flush.
    ///
    /// Returns whether anything was written.
    pub async fn flush(&self) -> Result<bool, PersistenceError> {
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let snapshot: BTreeMap<AgentId, Vec<TokenDataPoint>> = self
            .inner
            .history
            .lock()
            .iter()
            .map(|(agent_id, series)| (agent_id.clone(), series.iter().cloned().collect()))
            .collect();

        let result = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => self.inner.backend.save(HISTORY_KEY, bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.inner.dirty.store(true, Ordering::Release);
            self.emit(BusEvent::PersistenceFailed {
                error: e.to_string(),
            });
            return Err(e);
        }
        Ok(true)
    }

    /// Spawns the periodic flush task. Flushes once more on cancellation.
    pub fn spawn_flush_task(&self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let period = bus.inner.config.flush_interval();
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        if let Err(e) = bus.flush().await {
                            warn!(error = %e, "Final metrics history flush failed");
                        }
                        break;
                    }

                    _ = tick.tick() => {
                        if let Err(e) = bus.flush().await {
                            warn!(error = %e, "Metrics history flush failed");
                        }
                    }
                }
            }

            debug!("Metrics flush task completed");
        })
    }
}

impl std::fmt::Debug for MetricsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsBus")
            .field("subscribers", &self.subscriber_count())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

/// Applies the backpressure policy to the ring after a push.
///
/// Above `threshold` a `Backpressure` notice is produced; above 1.5 times
/// the threshold the oldest fifth (rounded up) of the buffer is dropped.
fn relieve_backpressure(buffer: &mut VecDeque<TokenDataPoint>, threshold: usize) -> Vec<BusEvent> {
    let len = buffer.len();
    if len <= threshold {
        return Vec::new();
    }

    let mut notices = vec![BusEvent::Backpressure {
        buffered: len,
        threshold,
    }];
    if len > threshold + threshold / 2 {
        let count = len.div_ceil(5);
        buffer.drain(..count);
        notices.push(BusEvent::DataDropped { count });
    }
    notices
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<TokenDataPoint>,
    subscriptions: Subscriptions,
    events: broadcast::Sender<BusEvent>,
) {
    while let Some(point) = rx.recv().await {
        let active = subscriptions.read();
        for (subscription_id, subscription) in active.iter().filter(|(_, s)| s.wants(&point)) {
            match subscription.queue.try_send(point.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = subscription.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 {
                        warn!(subscription_id = %subscription_id, "Subscriber queue full, dropping points");
                    }
                    let _ = events.send(BusEvent::SubscriberLagged {
                        subscription_id: subscription_id.clone(),
                        dropped,
                    });
                }
                // The worker is gone; unsubscribe cleans up
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
    debug!("Metrics dispatcher stopped");
}

fn spawn_subscriber(
    subscription_id: SubscriptionId,
    callback: Callback,
    mut rx: mpsc::Receiver<TokenDataPoint>,
    events: broadcast::Sender<BusEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(point) = rx.recv().await {
            let error = match catch_unwind(AssertUnwindSafe(|| callback(&point))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(subscription_id = %subscription_id, error = %error, "Subscriber callback failed");
            let _ = events.send(BusEvent::SubscriberError {
                subscription_id: subscription_id.clone(),
                error,
            });
        }
        debug!(subscription_id = %subscription_id, "Subscriber worker stopped");
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("callback panicked: {s}")
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_of(n: usize) -> VecDeque<TokenDataPoint> {
        (0..n).map(|i| TokenDataPoint::new("a1", i as u64)).collect()
    }

    #[test]
    fn test_no_backpressure_at_threshold() {
        let mut buffer = buffer_of(10);
        assert!(relieve_backpressure(&mut buffer, 10).is_empty());
    }

    #[test]
    fn test_backpressure_without_drop() {
        let mut buffer = buffer_of(15);
        let notices = relieve_backpressure(&mut buffer, 10);
        assert_eq!(
            notices,
            vec![BusEvent::Backpressure {
                buffered: 15,
                threshold: 10
            }]
        );
        assert_eq!(buffer.len(), 15);
    }

    #[test]
    fn test_drop_oldest_fifth() {
        let mut buffer = buffer_of(16);
        let notices = relieve_backpressure(&mut buffer, 10);
        assert_eq!(notices.last(), Some(&BusEvent::DataDropped { count: 4 }));
        assert_eq!(buffer.len(), 12);
        // Oldest points went first
        assert_eq!(buffer.front().map(|p| p.tokens_used.as_u64()), Some(4));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "callback panicked: boom");
    }
}
