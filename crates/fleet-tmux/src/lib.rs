//! Tmux integration for agent-fleet.
//!
//! Provides the [`Multiplexer`] capability the supervisor drives, and the
//! [`Tmux`] implementation that shells out to the `tmux` binary.
//!
//! Multiplexers generally have no push-based tail API, so output is read by
//! polling [`Multiplexer::capture_pane`].
//!
//! # Panic-Free Guarantees
//!
//! This crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Tmux command failures are returned as errors

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::FleetError;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during multiplexer operations.
#[derive(Debug, Error)]
pub enum TmuxError {
    /// The tmux binary could not be started
    #[error("failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),

    /// tmux exited with a failure status
    #[error("tmux {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Invalid session name
    #[error("invalid session name: {0:?}")]
    InvalidName(String),

    /// The call did not finish within the adapter timeout
    #[error("tmux {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl From<TmuxError> for FleetError {
    fn from(err: TmuxError) -> Self {
        FleetError::AdapterFailure(err.to_string())
    }
}

// ============================================================================
// Capability
// ============================================================================

/// Operations the supervisor needs from a terminal multiplexer.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Creates a detached session running `command` in `cwd`.
    async fn create(
        &self,
        name: &str,
        cwd: &Path,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), TmuxError>;

    /// Kills a session.
    async fn kill(&self, name: &str) -> Result<(), TmuxError>;

    /// Types `text` into the session followed by Enter.
    async fn send_keys(&self, name: &str, text: &str) -> Result<(), TmuxError>;

    /// Returns the last `lines` lines of the session's pane (visible pane if `None`).
    async fn capture_pane(&self, name: &str, lines: Option<u32>) -> Result<String, TmuxError>;

    /// Lists the names of all sessions.
    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError>;

    /// Whether a session with this name exists.
    async fn has_session(&self, name: &str) -> Result<bool, TmuxError> {
        Ok(self.list_sessions().await?.iter().any(|s| s == name))
    }

    /// PID of the process in the session's pane, if the multiplexer knows it.
    async fn pane_pid(&self, _name: &str) -> Result<Option<u32>, TmuxError> {
        Ok(None)
    }
}

// ============================================================================
// Tmux
// ============================================================================

/// Default bound on a single tmux invocation.
pub const DEFAULT_TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Multiplexer`] backed by the `tmux` CLI.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: String,
    /// Optional `-L` socket name, isolating fleet sessions from the user's server
    socket: Option<String>,
    timeout: Duration,
}

impl Default for Tmux {
    fn default() -> Self {
        Self::new()
    }
}

impl Tmux {
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
            socket: None,
            timeout: DEFAULT_TMUX_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks if the tmux binary is available.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-V")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Runs tmux with `args`, returning stdout on success.
    async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let command_name = args.first().copied().unwrap_or_default().to_string();
        let mut cmd = Command::new(&self.binary);
        if let Some(ref socket) = self.socket {
            cmd.args(["-L", socket.as_str()]);
        }
        cmd.args(args).kill_on_drop(true);

        trace!(?args, "Running tmux");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TmuxError::Timeout {
                command: command_name.clone(),
                timeout: self.timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TmuxError::CommandFailed {
                command: command_name,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Session names tmux accepts as unambiguous targets.
fn validate_name(name: &str) -> Result<(), TmuxError> {
    if name.is_empty() || name.contains(['.', ':']) {
        return Err(TmuxError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Exact-match target for a session (`=name`), so prefixes never match.
fn target(name: &str) -> String {
    format!("={name}")
}

/// Parses `list-sessions -F "#{session_name}"` output.
fn parse_session_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Multiplexer for Tmux {
    async fn create(
        &self,
        name: &str,
        cwd: &Path,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), TmuxError> {
        validate_name(name)?;
        let cwd = cwd.to_string_lossy();
        let env_pairs: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut args: Vec<&str> = vec!["new-session", "-d", "-s", name, "-c", &*cwd];
        for pair in &env_pairs {
            args.push("-e");
            args.push(pair);
        }
        if !command.is_empty() {
            args.push(command);
        }

        self.run(&args).await?;
        debug!(session = name, "tmux session created");
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), TmuxError> {
        validate_name(name)?;
        self.run(&["kill-session", "-t", target(name).as_str()]).await?;
        debug!(session = name, "tmux session killed");
        Ok(())
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<(), TmuxError> {
        validate_name(name)?;
        let target = target(name);
        // Literal text first so key names inside it are not interpreted
        self.run(&["send-keys", "-t", target.as_str(), "-l", text]).await?;
        self.run(&["send-keys", "-t", target.as_str(), "Enter"]).await?;
        Ok(())
    }

    async fn capture_pane(&self, name: &str, lines: Option<u32>) -> Result<String, TmuxError> {
        validate_name(name)?;
        let target = target(name);
        match lines {
            Some(n) => {
                let start = format!("-{n}");
                self.run(&["capture-pane", "-p", "-J", "-t", target.as_str(), "-S", start.as_str()])
                    .await
            }
            None => self.run(&["capture-pane", "-p", "-J", "-t", target.as_str()]).await,
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(stdout) => Ok(parse_session_names(&stdout)),
            // No server running means no sessions
            Err(TmuxError::CommandFailed { stderr, .. })
                if stderr.contains("no server running") || stderr.contains("No such file") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn has_session(&self, name: &str) -> Result<bool, TmuxError> {
        validate_name(name)?;
        match self.run(&["has-session", "-t", target(name).as_str()]).await {
            Ok(_) => Ok(true),
            Err(TmuxError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pane_pid(&self, name: &str) -> Result<Option<u32>, TmuxError> {
        validate_name(name)?;
        let stdout = self
            .run(&["display-message", "-p", "-t", target(name).as_str(), "#{pane_pid}"])
            .await?;
        Ok(stdout.trim().parse().ok())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("agent-a1-1234abcd").is_ok());
        assert!(matches!(validate_name(""), Err(TmuxError::InvalidName(_))));
        assert!(matches!(validate_name("a.b"), Err(TmuxError::InvalidName(_))));
        assert!(matches!(validate_name("a:b"), Err(TmuxError::InvalidName(_))));
    }

    #[test]
    fn test_parse_session_names() {
        let names = parse_session_names("agent-a1-1\n\nagent-b2-2\n");
        assert_eq!(names, vec!["agent-a1-1".to_string(), "agent-b2-2".to_string()]);
    }

    #[test]
    fn test_target_is_exact() {
        assert_eq!(target("agent-a1"), "=agent-a1");
    }

    #[test]
    fn test_tmux_error_display() {
        let err = TmuxError::CommandFailed {
            command: "kill-session".to_string(),
            stderr: "can't find session".to_string(),
        };
        assert_eq!(err.to_string(), "tmux kill-session failed: can't find session");

        let err = TmuxError::InvalidName("a.b".to_string());
        assert_eq!(err.to_string(), "invalid session name: \"a.b\"");
    }

    #[test]
    fn test_tmux_error_into_adapter_failure() {
        let err: FleetError = TmuxError::InvalidName("a:b".to_string()).into();
        assert_eq!(
            err,
            FleetError::AdapterFailure("invalid session name: \"a:b\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tmux = Tmux {
            binary: "/nonexistent/tmux".to_string(),
            socket: None,
            timeout: Duration::from_secs(1),
        };
        assert!(!tmux.is_available().await);
        let err = tmux.kill("agent-x").await.unwrap_err();
        assert!(matches!(err, TmuxError::Spawn(_)));
    }
}
