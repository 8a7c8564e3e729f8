//! Shunt Relay Node - CLI for the OCPP relay
//!
//! # Usage
//!
//! ```bash
//! # Relay chargers on :8500 to a CPMS, snoop port on :8501
//! shunt-relay-node --cpms wss://cpms.example/ocpp
//!
//! # Everything from a config file, CPMS URL overridden on the command line
//! shunt-relay-node --config /etc/shunt/shunt.yaml --cpms ws://localhost:9000
//!
//! # Serve wss:// to chargers
//! shunt-relay-node --cpms wss://cpms.example/ocpp \
//!     --ssl-cert /etc/shunt/chain.pem --ssl-key /etc/shunt/key.pem
//! ```

use std::path::PathBuf;

use clap::Parser;
use shunt_relay::{tls, RelayConfig, RelayServer, SnoopHub, SnoopServer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Transparent OCPP relay with a read-only snoop port
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file (a `relay:` section); flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CPMS WebSocket URL chargers are relayed to
    #[arg(long)]
    cpms: Option<String>,

    /// Charger-facing listen address
    #[arg(long)]
    ocpp_host: Option<String>,

    /// Charger-facing listen port
    #[arg(long)]
    ocpp_port: Option<u16>,

    /// Snoop listen address
    #[arg(long)]
    snoop_host: Option<String>,

    /// Snoop listen port
    #[arg(long)]
    snoop_port: Option<u16>,

    /// PEM certificate chain for serving wss:// to chargers
    #[arg(long)]
    ssl_cert: Option<PathBuf>,

    /// PEM private key matching --ssl-cert
    #[arg(long)]
    ssl_key: Option<PathBuf>,

    /// Extra pinned root certificate for the CPMS connection
    #[arg(long)]
    cpms_ca: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    if let Some(cpms) = args.cpms {
        config.cpms_url = cpms;
    }
    if let Some(host) = args.ocpp_host {
        config.ocpp_host = host;
    }
    if let Some(port) = args.ocpp_port {
        config.ocpp_port = port;
    }
    if let Some(host) = args.snoop_host {
        config.snoop_host = host;
    }
    if let Some(port) = args.snoop_port {
        config.snoop_port = port;
    }
    if let Some(cert) = args.ssl_cert {
        config.ssl_cert = Some(cert);
    }
    if let Some(key) = args.ssl_key {
        config.ssl_key = Some(key);
    }
    if let Some(ca) = args.cpms_ca {
        config.cpms_ca = Some(ca);
    }

    info!(
        cpms_url = %config.cpms_url,
        ocpp_port = config.ocpp_port,
        snoop_port = config.snoop_port,
        "starting relay"
    );

    // Both listeners share one hub so snoop clients see all pairs.
    let hub = SnoopHub::spawn();

    // Local snoop binds stay plaintext even when the relay leg serves TLS.
    let snoop_tls = match (&config.ssl_cert, &config.ssl_key) {
        (Some(cert), Some(key)) if snoop_tls_enabled(&config.snoop_host) => {
            Some(tls::acceptor(cert, key)?)
        }
        _ => None,
    };
    let snoop_server = SnoopServer::new(hub.clone(), config.snoop_queue_depth, snoop_tls);
    let snoop_host = config.snoop_host.clone();
    let snoop_port = config.snoop_port;

    let relay_server = RelayServer::new(config, hub)?;

    tokio::select! {
        result = relay_server.run() => result?,
        result = snoop_server.run(&snoop_host, snoop_port) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

fn snoop_tls_enabled(snoop_host: &str) -> bool {
    snoop_host != "localhost"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snoop_tls_skipped_for_localhost_binds() {
        assert!(!snoop_tls_enabled("localhost"));
        assert!(snoop_tls_enabled("0.0.0.0"));
        assert!(snoop_tls_enabled("snoop.example"));
    }
}
