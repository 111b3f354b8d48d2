//! fleetd - agent fleet supervisor daemon
//!
//! Supervises agent sessions in tmux, accounts their token usage and fans
//! usage data out to subscribers.
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground with defaults
//! fleetd
//!
//! # Run with a config file on a dedicated tmux server
//! fleetd --config ~/.config/agent-fleet/fleet.toml --tmux-socket fleet run
//!
//! # Print the effective configuration
//! fleetd check-config
//!
//! # Enable debug logging
//! RUST_LOG=fleetd=debug fleetd
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: terminate every session, flush history, exit

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_core::FleetConfig;
use fleet_tmux::Tmux;
use fleetd::{
    BusEvent, FileHistoryBackend, Fleet, QuotaEngine, QuotaEvent, SupervisorEvent,
    TracingLogStore,
};

/// How often expired quota windows are swept.
const WINDOW_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// fleetd - agent fleet supervisor
#[derive(Parser, Debug)]
#[command(name = "fleetd", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Run sessions on a dedicated tmux server (`tmux -L <socket>`)
    #[arg(long, env = "FLEET_TMUX_SOCKET")]
    tmux_socket: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Print the effective configuration and exit
    CheckConfig,
}

/// Returns the default state directory.
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("agent-fleet")
}

fn load_config(path: Option<&PathBuf>) -> Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config, args.tmux_socket),
        Command::CheckConfig => {
            let text = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{text}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_daemon(config: FleetConfig, tmux_socket: Option<String>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fleetd=info".parse()?)
                .add_directive("fleet_core=info".parse()?)
                .add_directive("fleet_tmux=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "fleetd starting"
    );

    let mut tmux = Tmux::new().with_timeout(config.supervisor.adapter_timeout());
    if let Some(socket) = tmux_socket {
        tmux = tmux.with_socket(socket);
    }
    if !tmux.is_available().await {
        bail!("tmux is not available on PATH");
    }

    let history_dir = config
        .metrics
        .history_dir
        .clone()
        .unwrap_or_else(|| state_dir().join("history"));
    info!(history_dir = %history_dir.display(), "Metrics history location");

    let fleet = Fleet::start(
        config,
        Arc::new(tmux),
        Arc::new(TracingLogStore),
        Arc::new(FileHistoryBackend::new(history_dir)),
    )
    .await;

    let cancel_token = CancellationToken::new();
    spawn_event_loggers(&fleet, &cancel_token);
    spawn_window_sweeper(fleet.quota.clone(), cancel_token.clone());

    if let Err(e) = wait_for_shutdown_signal().await {
        error!(error = %e, "Error waiting for shutdown signal");
    }
    info!("Shutdown signal received");

    cancel_token.cancel();
    fleet.shutdown().await;

    info!("fleetd stopped");
    Ok(())
}

/// Logs supervisor, quota and bus events until cancelled.
fn spawn_event_loggers(fleet: &Fleet, cancel_token: &CancellationToken) {
    let mut supervisor_events = fleet.supervisor.subscribe();
    let token = cancel_token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = supervisor_events.recv() => match event {
                    Ok(event) => log_supervisor_event(&event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Supervisor event logger lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let mut quota_events = fleet.quota.subscribe();
    let token = cancel_token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = quota_events.recv() => match event {
                    Ok(event) => log_quota_event(&event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Quota event logger lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let mut bus_events = fleet.metrics.subscribe_events();
    let token = cancel_token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = bus_events.recv() => match event {
                    Ok(event) => log_bus_event(&event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Bus event logger lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

fn log_supervisor_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::Idle {
            session_id,
            agent_id,
            idle_time,
        } => info!(%session_id, %agent_id, idle_secs = idle_time.as_secs(), "Session idle"),
        SupervisorEvent::MaxLifetime {
            session_id,
            agent_id,
            lifetime,
        } => warn!(%session_id, %agent_id, lifetime_secs = lifetime.as_secs(), "Session past max lifetime"),
        SupervisorEvent::SpawnFailed {
            session_id,
            agent_id,
            error,
        } => error!(%session_id, %agent_id, %error, "Session spawn failed"),
        other => debug!(event = ?other, "Supervisor event"),
    }
}

fn log_quota_event(event: &QuotaEvent) {
    match event {
        QuotaEvent::LimitExceeded { agent_id, windows } => {
            warn!(%agent_id, ?windows, "Token limit exceeded")
        }
        QuotaEvent::AlertCreated { alert } => {
            warn!(agent_id = %alert.agent_id, severity = %alert.severity, message = %alert.message, "Token alert")
        }
        other => debug!(event = ?other, "Quota event"),
    }
}

fn log_bus_event(event: &BusEvent) {
    match event {
        BusEvent::DataDropped { count } => warn!(count, "Metrics data dropped"),
        BusEvent::SubscriberError {
            subscription_id,
            error,
        } => warn!(%subscription_id, %error, "Metrics subscriber failed"),
        other => debug!(event = ?other, "Bus event"),
    }
}

fn spawn_window_sweeper(quota: QuotaEngine, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(WINDOW_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break,

                _ = tick.tick() => {
                    let reset = quota.reset_expired_windows();
                    if reset > 0 {
                        debug!(reset, "Expired quota windows reset");
                    }
                }
            }
        }
    });
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
