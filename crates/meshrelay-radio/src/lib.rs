//! Meshtastic radio side of the relay
//!
//! This crate owns the connection to a Meshtastic device and turns received
//! packets into [`meshrelay_core::RelayUnit`]s.
//!
//! # Architecture
//!
//! 1. **Interface** - byte transport to the device (serial, TCP, BLE)
//! 2. **Link** - one device session: framing, node database, packet ids
//! 3. **Supervisor** - connect with retry, loss handling, health probing
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use meshrelay_core::{AsyncBridge, RelayConfig};
//! use meshrelay_radio::RadioSupervisor;
//!
//! let config = Arc::new(RelayConfig::load("relay.toml")?);
//! let bridge = Arc::new(AsyncBridge::start(tokio::runtime::Handle::current()));
//! let radio = RadioSupervisor::new(config, bridge)?;
//! let mut inbound = radio.take_inbound().expect("first call");
//! radio.connect(false).await?;
//! radio.spawn_health_check();
//! while let Some(unit) = inbound.recv().await {
//!     println!("{}: {}", unit.sender, unit.text);
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//! - `ble` - Bluetooth Low Energy interface (requires `btleplug`)
//! - `tcp` - TCP interface for networked devices (default)
//! - `full` - Enable all interfaces
//!
//! # Protocol Details
//!
//! Serial and TCP use the device's stream framing:
//! - Bytes 0-1: Magic number `0x94C3`
//! - Bytes 2-3: Payload length (big-endian u16)
//! - Bytes 4+: Protobuf payload

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod ble_manager;
pub mod cache;
pub mod config;
pub mod connector;
pub mod error;
pub mod interface;
pub mod link;
pub mod proto;
pub mod supervisor;
pub mod translator;

pub mod test_utils;

pub use ble_manager::{BleConnectPermit, BleInterfaceManager};
pub use cache::DeduplicationCache;
pub use config::{LinkTarget, MESHTASTIC_MAGIC, TEXT_PAYLOAD_LIMIT};
pub use connector::{DeviceConnector, RadioConnector};
pub use error::{ConnectFailure, MeshtasticError, Result};
pub use interface::MeshtasticInterface;
pub use link::{FramedLink, LinkId, RadioEvent, RadioEventSink, RadioLink};
pub use supervisor::RadioSupervisor;

#[cfg(feature = "serial")]
pub use interface::SerialInterface;
#[cfg(feature = "tcp")]
pub use interface::TcpInterface;
#[cfg(feature = "ble")]
pub use interface::BleInterface;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
