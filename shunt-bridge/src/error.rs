//! Bridge error taxonomy
//!
//! Publish failures are logged and retried at the connection level; samples
//! produced during a broker outage are dropped (at-most-once). Only
//! configuration errors are fatal.

use std::path::PathBuf;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Startup-only configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("broker_username and broker_password must be set together")]
    PartialCredentials,

    #[error("broker_host must be set")]
    MissingBrokerHost,

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}
