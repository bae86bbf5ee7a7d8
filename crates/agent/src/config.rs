//! Agent configuration
//!
//! Values come from an optional `ids-agent.toml` in the working directory,
//! overridden by `IDS_`-prefixed environment variables (e.g. `IDS_API_PORT`).

use anyhow::{Context, Result};
use ids_lib::{MonitorConfig, StatusThresholds};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE: &str = "ids-agent";
const ENV_PREFIX: &str = "IDS";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name attached to structured log events
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Port for the control, health and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Append-only CSV tailed by the monitor
    #[serde(default = "default_stream_path")]
    pub stream_path: PathBuf,

    /// ONNX classification model
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Expected SHA-256 of the model file, hex encoded
    #[serde(default)]
    pub model_sha256: Option<String>,

    /// Fitted normalizer parameters (JSON)
    #[serde(default = "default_normalizer_path")]
    pub normalizer_path: PathBuf,

    /// Labeled dataset used to fit the normalizer when no saved one exists
    #[serde(default = "default_reference_data_path")]
    pub reference_data_path: PathBuf,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_safe_threshold")]
    pub safe_threshold: f64,

    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Start monitoring as soon as the agent is up
    #[serde(default)]
    pub autostart: bool,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "ids-agent".to_string())
}

fn default_api_port() -> u16 {
    5000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("database/ids_logs.db")
}

fn default_stream_path() -> PathBuf {
    PathBuf::from("data/stream_data.csv")
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/ids_model.onnx")
}

fn default_normalizer_path() -> PathBuf {
    PathBuf::from("models/normalizer.json")
}

fn default_reference_data_path() -> PathBuf {
    PathBuf::from("data/training_data.csv")
}

fn default_poll_interval() -> u64 {
    3
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_safe_threshold() -> f64 {
    0.1
}

fn default_warning_threshold() -> f64 {
    0.3
}

impl AgentConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read agent configuration")?;

        let agent: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        agent.validate()?;
        Ok(agent)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        self.thresholds()?;
        Ok(())
    }

    pub fn thresholds(&self) -> Result<StatusThresholds> {
        StatusThresholds::new(self.safe_threshold, self.warning_threshold)
            .map_err(|e| anyhow::anyhow!("Invalid status thresholds: {}", e))
    }

    pub fn monitor_config(&self) -> Result<MonitorConfig> {
        Ok(MonitorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            thresholds: self.thresholds()?,
        })
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            database_path: default_database_path(),
            stream_path: default_stream_path(),
            model_path: default_model_path(),
            model_sha256: None,
            normalizer_path: default_normalizer_path(),
            reference_data_path: default_reference_data_path(),
            poll_interval_secs: default_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
            safe_threshold: default_safe_threshold(),
            warning_threshold: default_warning_threshold(),
            autostart: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 5000);
        assert_eq!(config.poll_interval_secs, 3);
        assert!(!config.autostart);
        assert!(config.validate().is_ok());

        let monitor = config.monitor_config().unwrap();
        assert_eq!(monitor.poll_interval, Duration::from_secs(3));
        assert_eq!(monitor.stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_empty_source_uses_serde_defaults() {
        let config: AgentConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.database_path, PathBuf::from("database/ids_logs.db"));
        assert_eq!(config.warning_threshold, 0.3);
        assert!(config.model_sha256.is_none());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let config = AgentConfig {
            safe_threshold: 0.5,
            warning_threshold: 0.2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = AgentConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
