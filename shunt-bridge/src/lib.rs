//! # Shunt Bridge
//!
//! Consumes the relay's snoop stream and turns the metering data hidden in
//! OCPP traffic into MQTT topics, with Home Assistant device discovery. The
//! bridge never talks OCPP itself: the relay keeps forwarding blindly, and
//! this crate only watches the tagged copies.
//!
//! ```text
//! snoop socket ──► Matcher ──► DiscoveryCache ──► MqttPublisher ──► broker
//! ```
//!
//! Extraction is table-driven (see [`matcher`]): one rule per interesting
//! OCPP action, with ordered candidate paths absorbing protocol and vendor
//! dialect differences.

pub mod config;
pub mod discovery;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod publisher;
pub mod snoop_client;

pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError};
pub use matcher::{BridgeEvent, Matcher, MeteringSample, StatusUpdate};
pub use pipeline::Bridge;
pub use publisher::{BrokerEvent, MqttPublisher};
