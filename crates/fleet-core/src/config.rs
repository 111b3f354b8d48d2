//! Fleet configuration loaded from TOML.
//!
//! Every section and field has a default, so an empty file (or no file)
//! yields a working configuration.
//!
//! ```toml
//! [supervisor]
//! health_interval_ms = 5000
//! capture_interval_ms = 1000
//!
//! [quota]
//! default_daily_limit = 100000
//!
//! [metrics]
//! max_subscribers = 50
//! ```

use crate::LimitUpdate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub supervisor: SupervisorConfig,
    pub quota: QuotaConfig,
    pub metrics: MetricsConfig,
}

impl FleetConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Session supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Period of the liveness and health-threshold checks
    pub health_interval_ms: u64,
    /// Period of output capture; independent of the health period
    pub capture_interval_ms: u64,
    /// How long a session stays busy after a command before it is assumed done
    pub command_grace_ms: u64,
    /// Idle timeout for sessions whose config does not set one
    pub default_idle_timeout_secs: u64,
    /// Max lifetime for sessions whose config does not set one
    pub default_max_lifetime_secs: u64,
    /// Lines of scrollback requested per capture
    pub capture_lines: u32,
    /// Upper bound on a single multiplexer call
    pub adapter_timeout_ms: u64,
    /// Source tag attached to streamed log records
    pub log_source: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 5_000,
            capture_interval_ms: 1_000,
            command_grace_ms: 5_000,
            default_idle_timeout_secs: 300,
            default_max_lifetime_secs: 7_200,
            capture_lines: 200,
            adapter_timeout_ms: 10_000,
            log_source: "tmux".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms.max(1))
    }

    pub fn command_grace(&self) -> Duration {
        Duration::from_millis(self.command_grace_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms.max(1))
    }
}

/// Token quota settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Usage events retained in the ring
    pub history_capacity: usize,
    pub default_daily_limit: u64,
    pub default_weekly_limit: u64,
    pub default_monthly_limit: u64,
    /// Percentage at which `limit_approached` fires
    pub warning_threshold_pct: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
            default_daily_limit: crate::window::DEFAULT_DAILY_LIMIT,
            default_weekly_limit: crate::window::DEFAULT_WEEKLY_LIMIT,
            default_monthly_limit: crate::window::DEFAULT_MONTHLY_LIMIT,
            warning_threshold_pct: 80.0,
        }
    }
}

impl QuotaConfig {
    /// The configured defaults as a full limit update.
    pub fn default_limits(&self) -> LimitUpdate {
        LimitUpdate {
            daily: Some(self.default_daily_limit),
            weekly: Some(self.default_weekly_limit),
            monthly: Some(self.default_monthly_limit),
        }
    }
}

/// Metrics stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Capacity of the recent data point ring
    pub buffer_size: usize,
    pub max_subscribers: usize,
    /// Buffer length above which backpressure is signalled
    pub backpressure_threshold: usize,
    /// Data points kept per agent in the historical series
    pub history_per_agent: usize,
    pub flush_interval_ms: u64,
    /// Directory of the file-backed history; `None` keeps history in memory
    pub history_dir: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1_000,
            max_subscribers: 50,
            backpressure_threshold: 5_000,
            history_per_agent: 1_000,
            flush_interval_ms: 5_000,
            history_dir: None,
        }
    }
}

impl MetricsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.supervisor.health_interval(), Duration::from_secs(5));
        assert_eq!(config.supervisor.capture_interval(), Duration::from_secs(1));
        assert_eq!(config.metrics.buffer_size, 1_000);
        assert_eq!(config.metrics.backpressure_threshold, 5_000);
        assert_eq!(config.quota.history_capacity, 10_000);
    }

    #[test]
    fn test_partial_section() {
        let config = FleetConfig::from_toml_str(
            r#"
            [supervisor]
            command_grace_ms = 2000

            [metrics]
            max_subscribers = 3
            history_dir = "/var/lib/fleet"
            "#,
        )
        .unwrap();
        assert_eq!(config.supervisor.command_grace(), Duration::from_secs(2));
        assert_eq!(config.supervisor.health_interval_ms, 5_000);
        assert_eq!(config.metrics.max_subscribers, 3);
        assert_eq!(
            config.metrics.history_dir,
            Some(PathBuf::from("/var/lib/fleet"))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = FleetConfig::load(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
