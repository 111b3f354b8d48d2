//! Per-session background tasks.
//!
//! - health task: liveness, idle and lifetime thresholds, resource sampling
//! - capture task: polls pane output into the log stream
//! - completion timer: reverts `busy` after the command grace period
//!
//! All three stop when the session's cancellation token fires.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use fleet_core::{LogLevel, SessionStatus};

use super::{now, Shared, SupervisorEvent};
use crate::logstream::{IngestResult, LogStreamProcessor};
use crate::resources::sample_blocking;
use crate::store::SessionEntry;

/// Notification bookkeeping kept by the health task between ticks.
#[derive(Debug, Default)]
struct HealthState {
    /// `last_activity` of the idle stretch already reported
    idle_reported_for: Option<StdInstant>,
    lifetime_reported: bool,
}

pub(super) fn spawn_health_task(shared: Arc<Shared>, entry: Arc<SessionEntry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = shared.config.health_interval();
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = HealthState::default();

        loop {
            tokio::select! {
                biased;

                _ = entry.cancel_token().cancelled() => break,

                _ = tick.tick() => {
                    if check_session(&shared, &entry, &mut state).await.is_break() {
                        break;
                    }
                }
            }
        }

        debug!(session_id = %entry.id, "Health task completed");
    })
}

async fn check_session(
    shared: &Shared,
    entry: &SessionEntry,
    state: &mut HealthState,
) -> ControlFlow<()> {
    let alive = shared
        .call("has-session", shared.mux.has_session(&entry.session_name))
        .await;

    let pid = match alive {
        Ok(true) => shared
            .call("pane-pid", shared.mux.pane_pid(&entry.session_name))
            .await
            .ok()
            .flatten(),
        _ => None,
    };
    let resources = match pid {
        Some(pid) => sample_blocking(Arc::clone(&shared.sampler), pid).await,
        None => None,
    };

    let now = now();
    let mut session = entry.lock().await;
    if entry.is_terminating() {
        return ControlFlow::Break(());
    }

    let failure = match alive {
        Ok(true) => None,
        Ok(false) => Some("multiplexer session no longer exists".to_string()),
        Err(error) => Some(error),
    };
    if let Some(reason) = failure {
        if !session.status.is_active() {
            return ControlFlow::Continue(());
        }
        let from = session.record_failure();
        warn!(session_id = %entry.id, reason = %reason, "Session health check failed");
        shared.emit(SupervisorEvent::HealthCheckFailed {
            session_id: entry.id.clone(),
            agent_id: entry.agent_id.clone(),
            reason,
        });
        shared.emit_status(&entry.id, from, SessionStatus::Error);
        return ControlFlow::Break(());
    }

    if let Some(resources) = resources {
        session.resources = resources;
    }

    let idle_time = session.idle_time(now);
    if idle_time > session.config.idle_timeout
        && state.idle_reported_for != Some(session.last_activity)
    {
        state.idle_reported_for = Some(session.last_activity);
        debug!(session_id = %entry.id, idle_ms = idle_time.as_millis() as u64, "Session idle");
        shared.emit(SupervisorEvent::Idle {
            session_id: entry.id.clone(),
            agent_id: entry.agent_id.clone(),
            idle_time,
        });
        if session.status == SessionStatus::Running {
            let from = session.transition(SessionStatus::Idle);
            shared.emit_status(&entry.id, from, SessionStatus::Idle);
        }
    }

    let lifetime = session.lifetime(now);
    if !state.lifetime_reported && lifetime > session.config.max_lifetime {
        state.lifetime_reported = true;
        warn!(
            session_id = %entry.id,
            lifetime_secs = lifetime.as_secs(),
            "Session exceeded max lifetime"
        );
        shared.emit(SupervisorEvent::MaxLifetime {
            session_id: entry.id.clone(),
            agent_id: entry.agent_id.clone(),
            lifetime,
        });
    }

    ControlFlow::Continue(())
}

pub(super) fn spawn_capture_task(shared: Arc<Shared>, entry: Arc<SessionEntry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = shared.config.capture_interval();
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut processor = LogStreamProcessor::new(
            entry.agent_id.clone(),
            entry.id.clone(),
            shared.config.log_source.clone(),
        );
        let log_file = {
            let session = entry.lock().await;
            session.config.log_file.clone()
        };
        let mut log_file = match log_file {
            Some(path) => open_log_file(&path).await,
            None => None,
        };

        loop {
            tokio::select! {
                biased;

                _ = entry.cancel_token().cancelled() => break,

                _ = tick.tick() => {
                    let Some(result) = capture_once(&shared, &entry, &mut processor).await else {
                        continue;
                    };
                    if let Some(file) = log_file.as_mut() {
                        write_lines(file, &result).await;
                    }
                    for record in result.records {
                        if let Err(e) = shared.log_store.append(record).await {
                            warn!(session_id = %entry.id, error = %e, "Failed to append log record");
                        }
                    }
                }
            }
        }

        if let Some(mut file) = log_file {
            if let Err(e) = file.flush().await {
                warn!(session_id = %entry.id, error = %e, "Failed to flush session log file");
            }
        }
        debug!(session_id = %entry.id, "Capture task completed");
    })
}

/// Captures the pane once; `None` when nothing new was produced.
async fn capture_once(
    shared: &Shared,
    entry: &SessionEntry,
    processor: &mut LogStreamProcessor,
) -> Option<IngestResult> {
    let capture = shared
        .call(
            "capture-pane",
            shared
                .mux
                .capture_pane(&entry.session_name, Some(shared.config.capture_lines)),
        )
        .await;

    // Liveness is the health task's concern
    let text = match capture {
        Ok(text) => text,
        Err(error) => {
            debug!(session_id = %entry.id, error = %error, "Capture failed");
            return None;
        }
    };

    let result = processor.ingest_capture(&text);
    if result.records.is_empty() {
        return None;
    }

    entry.lock().await.record_output(result.lines, result.errors);

    for record in result.records.iter().filter(|r| r.level == LogLevel::Error) {
        shared.emit(SupervisorEvent::ErrorOutput {
            session_id: entry.id.clone(),
            agent_id: entry.agent_id.clone(),
            line: record.message.clone(),
        });
    }
    Some(result)
}

async fn open_log_file(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to open session log file");
            None
        }
    }
}

async fn write_lines(file: &mut File, result: &IngestResult) {
    let mut text = String::new();
    for record in &result.records {
        text.push_str(&record.message);
        text.push('\n');
    }
    if let Err(e) = file.write_all(text.as_bytes()).await {
        warn!(error = %e, "Failed to write session log file");
    }
}

pub(super) fn spawn_completion_timer(
    shared: Arc<Shared>,
    entry: Arc<SessionEntry>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;

            _ = entry.cancel_token().cancelled() => {}

            _ = sleep(shared.config.command_grace()) => {
                let mut session = entry.lock().await;
                if let Some(from) = session.complete_command(generation, now()) {
                    debug!(session_id = %entry.id, generation, "Command assumed complete");
                    shared.emit_status(&entry.id, Some(from), session.status);
                }
            }
        }
    })
}
