use crate::monitor::MonitorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Process-level operator configuration. Every field has a default so the
/// operator runs without a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Backoff limit applied to every step job.
    #[serde(default = "default_backoff_limit")]
    pub backoff_limit: i32,

    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Seconds before a fresh timeout monitor starts polling.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Seconds between timeout checks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_backoff_limit() -> i32 {
    1
}

fn default_initial_delay_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            backoff_limit: default_backoff_limit(),
            monitor: MonitorSettings::default(),
        }
    }
}

impl OperatorConfig {
    /// Load the config file if it exists, otherwise use defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(config_path)
            .context("Failed to read configuration file")?;
        toml::from_str(&content).context("Failed to parse configuration file")
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            initial_delay: Duration::from_secs(self.monitor.initial_delay_secs),
            poll_interval: Duration::from_secs(self.monitor.poll_interval_secs),
        }
    }
}
