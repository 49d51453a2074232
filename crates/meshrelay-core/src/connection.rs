//! Connection state reported by the supervisors

use serde::{Deserialize, Serialize};

pub use crate::config::Transport;

/// Lifecycle status of a supervised session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Never connected
    Idle,
    /// Connect attempt in progress
    Connecting,
    /// Session is live
    Connected,
    /// Lost and waiting to retry
    Reconnecting,
    /// Shut down
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one side's connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Physical transport
    pub transport: Transport,
    /// Transport address (port path, MAC, host:port)
    pub address: String,
    /// Current status
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the last success
    pub retry_count: u32,
}

impl ConnectionState {
    /// Fresh state for a transport
    pub fn new(transport: Transport, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
            status: ConnectionStatus::Idle,
            retry_count: 0,
        }
    }

    /// Whether the session is live
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}
