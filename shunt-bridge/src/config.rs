//! Resolved bridge configuration
//!
//! Mirrors the relay's config layer: a `bridge:` section in the shared YAML
//! file, merged with command-line overrides by the launcher.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// URL of the relay's snoop port.
    pub snoop_url: String,

    /// MQTT broker and credentials.
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,

    /// MQTT client id; a random suffix is generated when unset so two
    /// bridge instances never evict each other from the broker.
    pub client_id: Option<String>,

    /// State topics live under `<topic_prefix>/<cp_id>/...`.
    pub topic_prefix: String,

    /// Device discovery documents go to `<discovery_prefix>/<cp_id>/config`.
    pub discovery_prefix: String,

    /// How long an unanswered Call stays correlatable.
    pub correlation_ttl_secs: u64,

    /// Re-publish discovery documents after a broker reconnect, for
    /// consumers that purge retained discovery state on restart.
    pub reannounce_on_reconnect: bool,

    /// Snoop reconnect policy.
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            snoop_url: "ws://localhost:8501/".to_string(),
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            broker_username: None,
            broker_password: None,
            client_id: None,
            topic_prefix: "ocpp".to_string(),
            discovery_prefix: "homeassistant/device/ocpp".to_string(),
            correlation_ttl_secs: 30,
            reannounce_on_reconnect: true,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    bridge: Option<BridgeConfig>,
}

impl BridgeConfig {
    /// Load the `bridge:` section of a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(file.bridge.unwrap_or_default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.is_empty() {
            return Err(ConfigError::MissingBrokerHost);
        }
        if self.broker_username.is_some() != self.broker_password.is_some() {
            return Err(ConfigError::PartialCredentials);
        }
        Ok(())
    }

    pub fn correlation_ttl(&self) -> Duration {
        Duration::from_secs(self.correlation_ttl_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.snoop_url, "ws://localhost:8501/");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.topic_prefix, "ocpp");
        assert_eq!(config.discovery_prefix, "homeassistant/device/ocpp");
        assert!(config.reannounce_on_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let config = BridgeConfig {
            broker_username: Some("bridge".to_string()),
            ..BridgeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PartialCredentials)
        ));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "relay:\n  cpms_url: wss://cpms.example/ws\nbridge:\n  broker_host: broker.example\n  broker_username: bridge\n  broker_password: secret\n  correlation_ttl_secs: 10\n"
        )
        .unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.broker_host, "broker.example");
        assert_eq!(config.correlation_ttl(), Duration::from_secs(10));
        assert_eq!(config.broker_port, 1883);
        assert!(config.validate().is_ok());
    }
}
