//! # Shunt Relay
//!
//! Transparent OCPP WebSocket relay. Chargers connect to the relay as if it
//! were their CPMS; the relay opens a matching connection to the real CPMS
//! and blindly forwards every frame in both directions. A second, read-only
//! snoop port broadcasts a tagged copy of the full bidirectional stream to
//! any number of monitoring clients.
//!
//! ## Architecture
//!
//! ```text
//! Charger ◄──► RelayServer ◄──► ConnectionPair ◄──► CPMS
//!                                    │ tagged copies
//!                                    ▼
//!                               SnoopHub ──► snoop clients (read-only)
//! ```
//!
//! Blind forwarding plus the snoop copy is what lets downstream consumers
//! (see the `shunt-bridge` crate) map OCPP traffic onto other systems
//! without reimplementing OCPP.

pub mod config;
pub mod error;
pub mod frame;
pub mod relay;
pub mod snoop;
pub mod tls;

pub use config::RelayConfig;
pub use error::{ConfigError, RelayError};
pub use frame::{FrameError, MessageType, OcppFrame};
pub use relay::RelayServer;
pub use snoop::{Direction, SnoopEvent, SnoopHub, SnoopMessage, SnoopServer};
