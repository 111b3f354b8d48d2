//! Resource sampling for agent processes.
//!
//! Session health checks look up the pane's process and record its memory
//! and CPU usage on the session. One [`ProcessSampler`] is shared by all
//! sessions so the process table is refreshed at most once per
//! [`MIN_REFRESH_INTERVAL`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::debug;

use fleet_core::SessionResources;

/// Minimum spacing between process table refreshes.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Samples memory and CPU of arbitrary processes by pid.
pub struct ProcessSampler {
    system: System,
    last_refresh: Option<Instant>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            last_refresh: None,
        }
    }

    /// Returns resources for `pid`, or only the pid when the process is gone.
    ///
    /// CPU usage needs two refreshes, so the first sample after startup
    /// reports 0%.
    pub fn sample(&mut self, pid: u32) -> SessionResources {
        let stale = self
            .last_refresh
            .map_or(true, |at| at.elapsed() >= MIN_REFRESH_INTERVAL);
        if stale {
            // refresh_all() is required for CPU calculation to work
            self.system.refresh_all();
            self.last_refresh = Some(Instant::now());
        }

        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => SessionResources {
                pid: Some(pid),
                memory_bytes: Some(process.memory()),
                cpu_percent: Some(process.cpu_usage()),
            },
            None => {
                debug!(pid, "Process not found while sampling resources");
                SessionResources {
                    pid: Some(pid),
                    ..SessionResources::default()
                }
            }
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared sampler handle.
pub type SharedSampler = Arc<Mutex<ProcessSampler>>;

/// Samples `pid` on the blocking pool; the refresh reads `/proc`.
pub async fn sample_blocking(sampler: SharedSampler, pid: u32) -> Option<SessionResources> {
    tokio::task::spawn_blocking(move || sampler.lock().sample(pid))
        .await
        .ok()
}
