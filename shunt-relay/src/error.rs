//! Relay error taxonomy
//!
//! Transport errors are fatal to one connection pair only. Frame decode
//! errors (see [`crate::frame::FrameError`]) are non-fatal and never reach
//! this type. Configuration errors are fatal at startup.

use std::path::PathBuf;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors local to one connection pair or one listener.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("charge point did not offer a WebSocket subprotocol")]
    MissingSubprotocol,

    #[error("invalid CPMS URL {url}: {source}")]
    InvalidCpmsUrl {
        url: String,
        source: tungstenite::http::uri::InvalidUri,
    },

    #[error("failed to build CPMS handshake request: {0}")]
    Http(#[from] tungstenite::http::Error),

    #[error("CPMS unreachable after {attempts} attempts")]
    CpmsUnreachable { attempts: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Startup-only configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cpms_url must be set, either in the config file or with --cpms")]
    MissingCpmsUrl,

    #[error("cpms_username and cpms_password must be set together")]
    PartialCredentials,

    #[error("ssl_cert and ssl_key must be set together")]
    PartialTls,

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

    #[error("invalid TLS material in {path}: {source}")]
    TlsMaterial {
        path: PathBuf,
        source: native_tls::Error,
    },
}
