//! Interface implementations for radio device communication
//!
//! This module provides byte-level transports to a Meshtastic device:
//!
//! - [`SerialInterface`] - Serial port communication (requires `serial` feature)
//! - [`TcpInterface`] - TCP connection (requires `tcp` feature)
//! - [`BleInterface`] - Bluetooth LE (requires `ble` feature)
//!
//! Serial and TCP carry a framed byte stream (see [`framing`]); BLE exchanges
//! whole protobuf payloads over GATT characteristics.
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```

pub mod framing;

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialInterface;

#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tcp")]
pub use tcp::TcpInterface;

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::{force_disconnect_stale, BleInterface};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Trait for radio device interfaces
///
/// This trait abstracts over different connection methods (serial, TCP, BLE)
/// providing a unified API for reading and writing protobuf payloads.
#[async_trait]
pub trait MeshtasticInterface: Send + Sync {
    /// Connect to the device
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from the device
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read one payload from the device
    ///
    /// Returns `None` if no complete payload is available yet.
    /// Returns `Err` on connection/read errors.
    /// Must be cancel safe: it is polled inside `select!`.
    async fn read_packet(&mut self) -> Result<Option<Bytes>>;

    /// Write one payload to the device
    async fn write_packet(&mut self, packet: &[u8]) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

/// Connection state of a single interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
}

impl std::fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceState::Disconnected => write!(f, "disconnected"),
            InterfaceState::Connecting => write!(f, "connecting"),
            InterfaceState::Connected => write!(f, "connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_state_display() {
        assert_eq!(InterfaceState::Connected.to_string(), "connected");
        assert_eq!(InterfaceState::Disconnected.to_string(), "disconnected");
    }
}
