//! Agent session supervisor.
//!
//! The supervisor owns every agent session: it creates the multiplexer
//! session, tracks status and metrics, polls liveness and output, and tears
//! sessions down.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  spawn / send_command  ┌──────────────────────────┐
//! │    caller    │───────────────────────▶│        Supervisor        │
//! └──────────────┘                        │  SessionStore (DashMap)  │
//!                                         └────────────┬─────────────┘
//!                        per session                   │
//!          ┌──────────────────────┬────────────────────┼──────────────┐
//!          ▼                      ▼                    ▼              ▼
//!   health task            capture task         completion timer   broadcast
//!   (liveness, idle,       (LogStreamProcessor  (busy → running)   SupervisorEvent
//!    lifetime, resources)   → LogStore)
//! ```
//!
//! Each session has its own lock and its own cancellation token, so a hung
//! multiplexer call only stalls the session it was made for. Multiplexer
//! calls are bounded by [`SupervisorConfig::adapter_timeout`].

mod events;
mod monitor;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_core::{
    AgentId, AgentSession, FleetError, FleetResult, SessionConfig, SessionId, SessionStatus,
    SupervisorConfig,
};
use fleet_tmux::{Multiplexer, TmuxError};

use crate::logstore::{LogStore, SessionOutcome};
use crate::resources::{ProcessSampler, SharedSampler};
use crate::store::{SessionEntry, SessionStore};

pub use events::{SupervisorEvent, TerminationReason};

/// Broadcast buffer for supervisor events.
const EVENT_BUFFER: usize = 256;

/// Monotonic now. Follows tokio's clock so paused test time applies.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// State shared by the supervisor handle and the per-session tasks.
pub(crate) struct Shared {
    pub(crate) store: SessionStore,
    pub(crate) mux: Arc<dyn Multiplexer>,
    pub(crate) log_store: Arc<dyn LogStore>,
    pub(crate) sampler: SharedSampler,
    pub(crate) config: SupervisorConfig,
    pub(crate) events: broadcast::Sender<SupervisorEvent>,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_status(&self, session_id: &SessionId, from: Option<SessionStatus>, to: SessionStatus) {
        if let Some(from) = from {
            self.emit(SupervisorEvent::StatusChanged {
                session_id: session_id.clone(),
                from,
                to,
            });
        }
    }

    /// Runs a multiplexer call under the adapter timeout, flattening the
    /// failure into a message.
    pub(crate) async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, TmuxError>>,
    ) -> Result<T, String> {
        let timeout = self.config.adapter_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("{operation} timed out after {timeout:?}")),
        }
    }
}

/// Handle to the session supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        log_store: Arc<dyn LogStore>,
        config: SupervisorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                store: SessionStore::new(),
                mux,
                log_store,
                sampler: Arc::new(parking_lot::Mutex::new(ProcessSampler::new())),
                config,
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Subscribes to supervisor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Creates a multiplexer session for an agent and starts supervising it.
    ///
    /// Never fails: when the multiplexer refuses, the returned session is in
    /// `error` status with one recorded error, and `SpawnFailed` is emitted.
    pub async fn spawn(&self, config: SessionConfig) -> AgentSession {
        let config = self.apply_defaults(config);
        let session = AgentSession::new(SessionId::generate(), config, now());
        let entry = Arc::new(SessionEntry::new(session, &self.shared.cancel));
        self.shared.store.insert(Arc::clone(&entry));

        let mut session = entry.lock().await;
        let created = self
            .shared
            .call(
                "create",
                self.shared.mux.create(
                    &entry.session_name,
                    &session.config.working_directory,
                    &session.config.command,
                    &session.config.environment,
                ),
            )
            .await;

        if let Err(error) = created {
            session.record_failure();
            warn!(
                session_id = %entry.id,
                agent_id = %entry.agent_id,
                error = %error,
                "Failed to spawn agent session"
            );
            self.shared.emit(SupervisorEvent::SpawnFailed {
                session_id: entry.id.clone(),
                agent_id: entry.agent_id.clone(),
                error,
            });
            return session.clone();
        }

        session.transition(SessionStatus::Running);

        if session.config.stream_logs {
            match self
                .shared
                .log_store
                .start_session(&entry.agent_id, &entry.id)
                .await
            {
                Ok(()) => entry.mark_log_started(),
                Err(e) => warn!(session_id = %entry.id, error = %e, "Failed to open log session"),
            }
        }

        let snapshot = session.clone();
        drop(session);

        monitor::spawn_health_task(Arc::clone(&self.shared), Arc::clone(&entry));
        if snapshot.config.stream_logs {
            monitor::spawn_capture_task(Arc::clone(&self.shared), Arc::clone(&entry));
        }

        info!(
            session_id = %entry.id,
            agent_id = %entry.agent_id,
            session_name = %entry.session_name,
            "Agent session spawned"
        );
        self.shared.emit(SupervisorEvent::Spawned {
            session_id: entry.id.clone(),
            agent_id: entry.agent_id.clone(),
            session_name: entry.session_name.clone(),
        });

        snapshot
    }

    /// Sends a line of input to a session.
    ///
    /// The session is `busy` until the command grace period passes without
    /// another command, then reverts to `running`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the session does not exist
    /// - `InvalidState` unless the session is `running` or `idle`
    /// - `AdapterFailure` if the multiplexer call fails; the session moves
    ///   to `error`
    pub async fn send_command(&self, session_id: &SessionId, command: &str) -> FleetResult<()> {
        let entry = self.entry(session_id)?;
        let mut session = entry.lock().await;

        let status = if entry.is_terminating() {
            SessionStatus::Terminating
        } else {
            session.status
        };
        if !status.accepts_commands() {
            return Err(FleetError::InvalidState {
                operation: "send_command",
                session_id: session_id.to_string(),
                status: status.label().to_string(),
            });
        }

        let sent = self
            .shared
            .call(
                "send-keys",
                self.shared.mux.send_keys(&entry.session_name, command),
            )
            .await;
        if let Err(error) = sent {
            let from = session.record_failure();
            warn!(session_id = %session_id, error = %error, "Failed to send command");
            self.shared.emit_status(session_id, from, SessionStatus::Error);
            return Err(FleetError::AdapterFailure(error));
        }

        let from = session.status;
        let generation = session.begin_command(now());
        drop(session);

        debug!(session_id = %session_id, generation, "Command sent");
        self.shared.emit(SupervisorEvent::CommandSent {
            session_id: session_id.clone(),
            command: command.to_string(),
        });
        self.shared
            .emit_status(session_id, Some(from), SessionStatus::Busy);

        monitor::spawn_completion_timer(Arc::clone(&self.shared), entry, generation);
        Ok(())
    }

    /// Returns the current pane content, optionally limited to the last
    /// `lines` lines of scrollback.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the session does not exist
    /// - `AdapterFailure` if the capture fails
    pub async fn capture_output(
        &self,
        session_id: &SessionId,
        lines: Option<u32>,
    ) -> FleetResult<String> {
        let entry = self.entry(session_id)?;
        self.shared
            .call(
                "capture-pane",
                self.shared.mux.capture_pane(&entry.session_name, lines),
            )
            .await
            .map_err(FleetError::AdapterFailure)
    }

    /// Terminates a session and forgets it.
    ///
    /// Idempotent: returns false when the session is unknown or already
    /// being terminated. A failing multiplexer kill is logged and the
    /// session is removed anyway.
    pub async fn terminate(&self, session_id: &SessionId, reason: TerminationReason) -> bool {
        let Some(entry) = self.shared.store.get(session_id) else {
            debug!(session_id = %session_id, "Terminate for unknown session ignored");
            return false;
        };
        if !entry.begin_termination() {
            debug!(session_id = %session_id, "Session already terminating");
            return false;
        }

        entry.cancel_token().cancel();

        let previous = {
            let mut session = entry.lock().await;
            let previous = session.status;
            let from = session.transition(SessionStatus::Terminating);
            self.shared
                .emit_status(session_id, from, SessionStatus::Terminating);
            previous
        };

        if let Err(error) = self
            .shared
            .call("kill", self.shared.mux.kill(&entry.session_name))
            .await
        {
            warn!(
                session_id = %session_id,
                error = %error,
                "Failed to kill multiplexer session, removing anyway"
            );
        }

        if entry.log_started() {
            let outcome = match previous {
                SessionStatus::Error => SessionOutcome::Failed(reason.to_string()),
                _ => SessionOutcome::Completed,
            };
            if let Err(e) = self.shared.log_store.end_session(session_id, outcome).await {
                warn!(session_id = %session_id, error = %e, "Failed to close log session");
            }
        }

        self.shared.store.remove(session_id);

        info!(
            session_id = %session_id,
            agent_id = %entry.agent_id,
            reason = %reason,
            "Agent session terminated"
        );
        self.shared.emit(SupervisorEvent::Terminated {
            session_id: session_id.clone(),
            agent_id: entry.agent_id.clone(),
            reason,
        });
        true
    }

    /// Sessions that are `running`, `idle` or `busy`.
    pub async fn list_active(&self) -> Vec<AgentSession> {
        let mut active = Vec::new();
        for entry in self.shared.store.entries() {
            if entry.is_terminating() {
                continue;
            }
            let session = entry.snapshot().await;
            if session.status.is_active() {
                active.push(session);
            }
        }
        active.sort_by_key(|s| s.start_time);
        active
    }

    /// Every known session, including those in `error`.
    pub async fn list_sessions(&self) -> Vec<AgentSession> {
        let mut sessions = Vec::with_capacity(self.shared.store.len());
        for entry in self.shared.store.entries() {
            sessions.push(entry.snapshot().await);
        }
        sessions.sort_by_key(|s| s.start_time);
        sessions
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Option<AgentSession> {
        match self.shared.store.get(session_id) {
            Some(entry) => Some(entry.snapshot().await),
            None => None,
        }
    }

    /// Most recently started session of an agent that is not terminating.
    pub async fn get_session_by_agent_id(&self, agent_id: &AgentId) -> Option<AgentSession> {
        let mut latest: Option<AgentSession> = None;
        for entry in self.shared.store.entries_for_agent(agent_id) {
            if entry.is_terminating() {
                continue;
            }
            let session = entry.snapshot().await;
            if latest.as_ref().map_or(true, |l| session.start_time > l.start_time) {
                latest = Some(session);
            }
        }
        latest
    }

    pub fn session_count(&self) -> usize {
        self.shared.store.len()
    }

    /// Terminates every session and stops all background tasks.
    pub async fn shutdown(&self) {
        let entries = self.shared.store.entries();
        info!(sessions = entries.len(), "Supervisor shutting down");
        for entry in entries {
            self.terminate(&entry.id, TerminationReason::Shutdown).await;
        }
        self.shared.cancel.cancel();
    }

    fn entry(&self, session_id: &SessionId) -> FleetResult<Arc<SessionEntry>> {
        self.shared
            .store
            .get(session_id)
            .ok_or_else(|| FleetError::not_found("session", session_id.as_str()))
    }

    /// Fills zero timeouts from the configured defaults.
    fn apply_defaults(&self, mut config: SessionConfig) -> SessionConfig {
        if config.idle_timeout.is_zero() {
            config.idle_timeout = Duration::from_secs(self.shared.config.default_idle_timeout_secs);
        }
        if config.max_lifetime.is_zero() {
            config.max_lifetime =
                Duration::from_secs(self.shared.config.default_max_lifetime_secs);
        }
        config
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("sessions", &self.shared.store.len())
            .finish()
    }
}
