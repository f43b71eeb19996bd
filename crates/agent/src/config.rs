//! Repeater configuration.
//!
//! Stored as TOML with snake_case keys; durations are in milliseconds:
//!
//! ```toml
//! repeater_id = "3f1c..."
//! heartbeat_interval_ms = 10000
//!
//! [bus]
//! url = "amqp://broker:5672"
//!
//! [runner]
//! timeout_ms = 30000
//! max_content_length = 1024
//! ```

use std::path::Path;
use std::time::Duration;

use repeater_bus::BusOptions;
use repeater_protocol::codec::duration_ms;
use repeater_protocol::constants::{DEFAULT_HEARTBEAT_INTERVAL, client_queue_name};
use repeater_runner::RequestRunnerOptions;
use serde::{Deserialize, Serialize};

use crate::error::RepeaterError;

/// Everything needed to wire and run one repeater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeaterConfig {
    /// Identity the backend knows this repeater by.
    pub repeater_id: String,

    /// Version reported at registration (crate version by default).
    #[serde(default = "default_version")]
    pub version: String,

    /// Period of the `connected` status heartbeat.
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    pub bus: BusOptions,

    pub runner: RequestRunnerOptions,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            repeater_id: String::new(),
            version: default_version(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            bus: BusOptions::default(),
            runner: RequestRunnerOptions::default(),
        }
    }
}

impl RepeaterConfig {
    pub fn new(repeater_id: impl Into<String>) -> Self {
        Self {
            repeater_id: repeater_id.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, RepeaterError> {
        let config: Self =
            toml::from_str(content).map_err(|e| RepeaterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RepeaterError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RepeaterError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), repeater_id = %config.repeater_id, "configuration loaded");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, RepeaterError> {
        toml::to_string_pretty(self).map_err(|e| RepeaterError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), RepeaterError> {
        if self.repeater_id.trim().is_empty() {
            return Err(RepeaterError::Config("repeater_id must not be empty".into()));
        }
        if self.version.trim().is_empty() {
            return Err(RepeaterError::Config("version must not be empty".into()));
        }
        Ok(())
    }

    /// Heartbeat period; zero falls back to the default.
    pub fn heartbeat_interval(&self) -> Duration {
        if self.heartbeat_interval.is_zero() {
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            self.heartbeat_interval
        }
    }

    /// Bus options with the client queue defaulted to `agent:<repeater id>`.
    pub fn bus_options(&self) -> BusOptions {
        let mut options = self.bus.clone();
        if options.client_queue.is_empty() {
            options.client_queue = client_queue_name(&self.repeater_id);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RepeaterConfig::default();
        assert!(config.repeater_id.is_empty());
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.bus.app_queue, "app");
        assert_eq!(config.runner.max_content_length, 1024);
    }

    #[test]
    fn config_partial_toml() {
        let config = RepeaterConfig::from_toml_str(
            r#"
            repeater_id = "r-1"
            heartbeat_interval_ms = 2500

            [bus]
            url = "amqp://broker:5672"

            [runner]
            max_content_length = -1
            "#,
        )
        .unwrap();

        assert_eq!(config.repeater_id, "r-1");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(config.bus.url, "amqp://broker:5672");
        assert_eq!(config.bus.exchange, "EventBus");
        assert_eq!(config.runner.max_content_length, -1);
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn config_roundtrip_toml() {
        let mut config = RepeaterConfig::new("r-2");
        config.version = "2.1.0".into();
        config.runner.proxy_url = Some("http://proxy:3128".into());
        config.runner.headers.insert("X-Scanner", "repeater");

        let toml_str = config.to_toml_string().unwrap();
        let parsed = RepeaterConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn missing_repeater_id_is_rejected() {
        let err = RepeaterConfig::from_toml_str("heartbeat_interval_ms = 100").unwrap_err();
        assert!(matches!(err, RepeaterError::Config(msg) if msg.contains("repeater_id")));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = RepeaterConfig::from_toml_str("repeater_id = ").unwrap_err();
        assert!(matches!(err, RepeaterError::Config(_)));
    }

    #[test]
    fn client_queue_defaults_to_agent_queue() {
        let config = RepeaterConfig::new("abc");
        assert_eq!(config.bus_options().client_queue, "agent:abc");

        let mut explicit = RepeaterConfig::new("abc");
        explicit.bus.client_queue = "custom".into();
        assert_eq!(explicit.bus_options().client_queue, "custom");
    }

    #[test]
    fn zero_heartbeat_uses_default() {
        let mut config = RepeaterConfig::new("abc");
        config.heartbeat_interval = Duration::ZERO;
        assert_eq!(config.heartbeat_interval(), DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repeater.toml");

        let config = RepeaterConfig::new("saved");
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = RepeaterConfig::load(&path).unwrap();
        assert_eq!(loaded.repeater_id, "saved");
    }

    #[test]
    fn load_missing_file_names_the_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("absent.toml");
        let err = RepeaterConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
