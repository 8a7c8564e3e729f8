//! TLS material for both relay legs
//!
//! The charger-facing listener serves a certificate chain loaded from PEM
//! files. Some chargers do not ship public trust roots, so the chain file
//! may carry the full bundle the charger was provisioned with. The
//! CPMS-facing client can pin an extra root certificate for private CPMS
//! deployments.

use std::path::Path;

use native_tls::{Certificate, Identity, TlsConnector};

use crate::error::ConfigError;

/// Build the acceptor for the charger-facing (and optionally snoop) listener
/// from a PEM certificate chain and a PEM private key.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<tokio_native_tls::TlsAcceptor, ConfigError> {
    let cert_pem = read(cert_path)?;
    let key_pem = read(key_path)?;

    let identity = Identity::from_pkcs8(&cert_pem, &key_pem).map_err(|source| {
        ConfigError::TlsMaterial {
            path: cert_path.to_path_buf(),
            source,
        }
    })?;

    let acceptor = native_tls::TlsAcceptor::new(identity).map_err(|source| {
        ConfigError::TlsMaterial {
            path: cert_path.to_path_buf(),
            source,
        }
    })?;

    Ok(tokio_native_tls::TlsAcceptor::from(acceptor))
}

/// Build the connector used when dialing a `wss://` CPMS. With no pinned
/// root this is `None` and tungstenite falls back to the system trust store.
pub fn cpms_connector(ca_path: Option<&Path>) -> Result<Option<TlsConnector>, ConfigError> {
    let Some(ca_path) = ca_path else {
        return Ok(None);
    };

    let ca_pem = read(ca_path)?;
    let cert = Certificate::from_pem(&ca_pem).map_err(|source| ConfigError::TlsMaterial {
        path: ca_path.to_path_buf(),
        source,
    })?;

    let connector = TlsConnector::builder()
        .add_root_certificate(cert)
        .build()
        .map_err(|source| ConfigError::TlsMaterial {
            path: ca_path.to_path_buf(),
            source,
        })?;

    Ok(Some(connector))
}

fn read(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
