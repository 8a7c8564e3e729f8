//! Resolved relay configuration
//!
//! The launcher merges a YAML file (a `relay:` section) with command-line
//! overrides and hands the relay a fully resolved struct. The core never
//! touches argv.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Everything the relay and snoop servers need to run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// URL of the real CPMS, without the charge point id suffix.
    pub cpms_url: String,

    /// Optional HTTP basic auth credentials for the CPMS leg.
    pub cpms_username: Option<String>,
    pub cpms_password: Option<String>,

    /// Charger-facing listener.
    pub ocpp_host: String,
    pub ocpp_port: u16,

    /// Snoop listener.
    pub snoop_host: String,
    pub snoop_port: u16,

    /// PEM certificate chain / private key for the charger-facing listener.
    /// Chargers without public trust roots need the full chain here.
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,

    /// Optional pinned root certificate for the CPMS leg.
    pub cpms_ca: Option<PathBuf>,

    /// CPMS reconnect policy while the charger leg stays open.
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,

    /// Per-subscriber snoop queue depth; a full queue drops the subscriber.
    pub snoop_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cpms_url: String::new(),
            cpms_username: None,
            cpms_password: None,
            ocpp_host: "0.0.0.0".to_string(),
            ocpp_port: 8500,
            snoop_host: "localhost".to_string(),
            snoop_port: 8501,
            ssl_cert: None,
            ssl_key: None,
            cpms_ca: None,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 300,
            max_reconnect_attempts: 6,
            snoop_queue_depth: 64,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    relay: Option<RelayConfig>,
}

impl RelayConfig {
    /// Load the `relay:` section of a YAML config file. A file without that
    /// section yields defaults, matching the CLI-only invocation.
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
        Ok(file.relay.unwrap_or_default())
    }

    /// Reject configurations the relay cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpms_url.is_empty() {
            return Err(ConfigError::MissingCpmsUrl);
        }
        if self.cpms_username.is_some() != self.cpms_password.is_some() {
            return Err(ConfigError::PartialCredentials);
        }
        if self.ssl_cert.is_some() != self.ssl_key.is_some() {
            return Err(ConfigError::PartialTls);
        }
        Ok(())
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
        let config = RelayConfig::default();
        assert_eq!(config.ocpp_port, 8500);
        assert_eq!(config.snoop_port, 8501);
        assert_eq!(config.snoop_host, "localhost");
        assert_eq!(config.snoop_queue_depth, 64);
    }

    #[test]
    fn test_validation() {
        let mut config = RelayConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCpmsUrl)
        ));

        config.cpms_url = "wss://cpms.example/ws/webSocket".to_string();
        assert!(config.validate().is_ok());

        config.cpms_username = Some("relay".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PartialCredentials)
        ));
        config.cpms_password = Some("secret".to_string());
        assert!(config.validate().is_ok());

        config.ssl_cert = Some(PathBuf::from("/etc/shunt/chain.pem"));
        assert!(matches!(config.validate(), Err(ConfigError::PartialTls)));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "relay:\n  cpms_url: wss://cpms.example/ws/webSocket\n  ocpp_port: 9500\n  cpms_username: relay\n  cpms_password: secret\n"
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cpms_url, "wss://cpms.example/ws/webSocket");
        assert_eq!(config.ocpp_port, 9500);
        // Untouched fields keep their defaults
        assert_eq!(config.snoop_port, 8501);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_section_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bridge:\n  broker_host: broker.example\n").unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ocpp_port, 8500);
    }
}
