//! Shared helpers for fleetd integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use fleet_core::{AgentId, SessionConfig, SupervisorConfig};
use fleet_tmux::{Multiplexer, TmuxError};
use fleetd::{MemoryLogStore, Supervisor};

// ============================================================================
// Fake Multiplexer
// ============================================================================

/// In-memory multiplexer. Panes hold whatever output the test pushes.
#[derive(Default)]
pub struct FakeMux {
    panes: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<(String, String)>>,
    killed: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_send: AtomicBool,
    fail_kill: AtomicBool,
}

impl FakeMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_kill(&self, fail: bool) {
        self.fail_kill.store(fail, Ordering::SeqCst);
    }

    /// Appends output to a pane, as if the agent printed it.
    pub fn push_output(&self, name: &str, text: &str) {
        if let Some(pane) = self.panes.lock().get_mut(name) {
            pane.push_str(text);
        }
    }

    /// Removes a pane without going through the supervisor.
    pub fn crash(&self, name: &str) {
        self.panes.lock().remove(name);
    }

    pub fn has_pane(&self, name: &str) -> bool {
        self.panes.lock().contains_key(name)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().clone()
    }

    fn failure(command: &str) -> TmuxError {
        TmuxError::CommandFailed {
            command: command.to_string(),
            stderr: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl Multiplexer for FakeMux {
    async fn create(
        &self,
        name: &str,
        _cwd: &Path,
        _command: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<(), TmuxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::failure("new-session"));
        }
        self.panes.lock().insert(name.to_string(), String::new());
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), TmuxError> {
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(Self::failure("kill-session"));
        }
        self.killed.lock().push(name.to_string());
        self.panes.lock().remove(name);
        Ok(())
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<(), TmuxError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Self::failure("send-keys"));
        }
        if !self.has_pane(name) {
            return Err(Self::failure("send-keys"));
        }
        self.sent.lock().push((name.to_string(), text.to_string()));
        Ok(())
    }

    async fn capture_pane(&self, name: &str, _lines: Option<u32>) -> Result<String, TmuxError> {
        self.panes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Self::failure("capture-pane"))
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        Ok(self.panes.lock().keys().cloned().collect())
    }
}

// ============================================================================
// Supervisor Helpers
// ============================================================================

/// Short periods so tests run quickly (or under paused time).
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        health_interval_ms: 250,
        capture_interval_ms: 100,
        command_grace_ms: 500,
        ..SupervisorConfig::default()
    }
}

pub fn supervisor(mux: Arc<FakeMux>) -> (Supervisor, Arc<MemoryLogStore>) {
    supervisor_with(mux, fast_config())
}

pub fn supervisor_with(
    mux: Arc<FakeMux>,
    config: SupervisorConfig,
) -> (Supervisor, Arc<MemoryLogStore>) {
    let logs = Arc::new(MemoryLogStore::new());
    let supervisor = Supervisor::new(mux, logs.clone(), config);
    (supervisor, logs)
}

pub fn session_config(agent: &str) -> SessionConfig {
    SessionConfig::new(AgentId::new(agent), "/tmp", "bash")
}

// ============================================================================
// Event Helpers
// ============================================================================

/// Drains every event currently queued on `rx`.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Waits for an event matching `pred`.
pub async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, wait: Duration, mut pred: F) -> Option<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Polls `check` until it returns true or `wait` elapses.
pub async fn eventually<F: FnMut() -> bool>(wait: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
