//! Radio protocol constants and link targets

use std::path::PathBuf;
use std::time::Duration;

use meshrelay_core::config::RadioConfig;
use meshrelay_core::Transport;

use crate::error::{MeshtasticError, Result};

/// Protocol magic number (first 2 bytes of every frame)
pub const MESHTASTIC_MAGIC: u16 = 0x94C3;

/// Largest frame payload the device emits
pub const MAX_FRAME_PAYLOAD: usize = 512;

/// Largest text payload a single packet carries
pub const TEXT_PAYLOAD_LIMIT: usize = meshrelay_core::RADIO_TEXT_LIMIT;

/// Default baud rate for serial devices
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default TCP port of networked devices
pub const DEFAULT_TCP_PORT: u16 = meshrelay_core::config::DEFAULT_TCP_PORT;

/// Destination meaning "all nodes"
pub const BROADCAST: u32 = meshrelay_core::BROADCAST_ADDR;

/// Default hop limit for outbound packets
pub const DEFAULT_HOP_LIMIT: u32 = 3;

/// Capacity of the normalised inbound channel
pub const INBOUND_CAPACITY: usize = 256;

/// Capacity of the raw link event channel
pub const EVENT_CAPACITY: usize = 256;

/// Bound on a graceful BLE disconnect
pub const BLE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a BLE disconnect before the adapter is reused
pub const BLE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Bound on each health probe request
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Physical endpoint of a radio link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Serial port connection
    Serial {
        /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
        port: PathBuf,
        /// Baud rate
        baud_rate: u32,
    },
    /// TCP connection (for devices with network)
    Tcp {
        /// Host address
        host: String,
        /// Port number
        port: u16,
    },
    /// Bluetooth Low Energy connection
    Ble {
        /// MAC address or advertised name
        address: String,
    },
}

impl LinkTarget {
    /// Build the target named by the radio configuration
    pub fn from_config(config: &RadioConfig) -> Result<Self> {
        match config.connection_type {
            Transport::Serial => config
                .serial_port
                .clone()
                .map(|port| LinkTarget::Serial {
                    port,
                    baud_rate: DEFAULT_BAUD_RATE,
                })
                .ok_or_else(|| MeshtasticError::MissingConfig("radio.serial_port".into())),
            Transport::Tcp => config
                .host
                .clone()
                .filter(|h| !h.is_empty())
                .map(|host| LinkTarget::Tcp {
                    host,
                    port: config.port,
                })
                .ok_or_else(|| MeshtasticError::MissingConfig("radio.host".into())),
            Transport::Ble => config
                .ble_address
                .clone()
                .filter(|a| !a.is_empty())
                .map(|address| LinkTarget::Ble { address })
                .ok_or_else(|| MeshtasticError::MissingConfig("radio.ble_address".into())),
        }
    }

    /// Transport kind
    pub fn transport(&self) -> Transport {
        match self {
            LinkTarget::Serial { .. } => Transport::Serial,
            LinkTarget::Tcp { .. } => Transport::Tcp,
            LinkTarget::Ble { .. } => Transport::Ble,
        }
    }

    /// Human-readable address
    pub fn address(&self) -> String {
        match self {
            LinkTarget::Serial { port, .. } => port.display().to_string(),
            LinkTarget::Tcp { host, port } => format!("{host}:{port}"),
            LinkTarget::Ble { address } => address.clone(),
        }
    }
}

impl std::fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.transport(), self.address())
    }
}
