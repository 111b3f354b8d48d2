//! Wiring of the supervisor, quota engine and metrics bus.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleet_core::FleetConfig;
use fleet_tmux::Multiplexer;

use crate::logstore::LogStore;
use crate::metrics::MetricsBus;
use crate::persistence::HistoryBackend;
use crate::quota::QuotaEngine;
use crate::supervisor::Supervisor;

/// The running services of one daemon.
#[derive(Debug)]
pub struct Fleet {
    pub supervisor: Supervisor,
    pub quota: QuotaEngine,
    pub metrics: MetricsBus,
    cancel: CancellationToken,
    flush_task: JoinHandle<()>,
}

impl Fleet {
    /// Restores metrics history, then starts every service.
    pub async fn start(
        config: FleetConfig,
        mux: Arc<dyn Multiplexer>,
        log_store: Arc<dyn LogStore>,
        history: Arc<dyn HistoryBackend>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let metrics = MetricsBus::start(config.metrics, history).await;
        let flush_task = metrics.spawn_flush_task(cancel.child_token());
        let quota = QuotaEngine::with_bus(config.quota, metrics.clone());
        let supervisor = Supervisor::new(mux, log_store, config.supervisor);

        info!("Fleet services started");
        Self {
            supervisor,
            quota,
            metrics,
            cancel,
            flush_task,
        }
    }

    /// Terminates every session and writes the metrics history one last
    /// time.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
        self.cancel.cancel();
        if let Err(e) = self.flush_task.await {
            warn!(error = %e, "Metrics flush task failed");
        }
        info!("Fleet services stopped");
    }
}
