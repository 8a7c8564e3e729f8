//! Shunt Bridge Node - CLI for the OCPP-to-MQTT bridge
//!
//! # Usage
//!
//! ```bash
//! # Watch a local relay, publish to a local broker
//! shunt-bridge-node
//!
//! # Remote relay and an authenticated broker
//! shunt-bridge-node --snoop-socket ws://relay.example:8501/ \
//!     --broker-host broker.example --broker-username bridge --broker-password secret
//!
//! # Everything from a config file
//! shunt-bridge-node --config /etc/shunt/shunt.yaml
//! ```

use std::path::PathBuf;

use clap::Parser;
use shunt_bridge::{Bridge, BridgeConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Maps snooped OCPP metering traffic onto MQTT topics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file (a `bridge:` section); flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay snoop socket URL
    #[arg(long)]
    snoop_socket: Option<String>,

    /// MQTT broker host
    #[arg(long)]
    broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// MQTT username
    #[arg(long)]
    broker_username: Option<String>,

    /// MQTT password
    #[arg(long)]
    broker_password: Option<String>,

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
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(url) = args.snoop_socket {
        config.snoop_url = url;
    }
    if let Some(host) = args.broker_host {
        config.broker_host = host;
    }
    if let Some(port) = args.broker_port {
        config.broker_port = port;
    }
    if let Some(username) = args.broker_username {
        config.broker_username = Some(username);
    }
    if let Some(password) = args.broker_password {
        config.broker_password = Some(password);
    }

    info!(
        snoop_url = %config.snoop_url,
        broker = %format!("{}:{}", config.broker_host, config.broker_port),
        "starting bridge"
    );

    let bridge = Bridge::new(config)?;

    tokio::select! {
        result = bridge.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
