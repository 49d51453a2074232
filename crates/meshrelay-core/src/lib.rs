//! Meshrelay Core - Shared types and coordination for the mesh-to-chat relay
//!
//! This crate holds what the radio, chat and routing crates have in common:
//! the normalised message model, typed configuration, connection state, the
//! async bridge used to cross from callback-driven radio code into the
//! runtime, and the port traits the router sends through.
//!
//! # Modules
//!
//! - [`message`] - Inbound relay units and outbound send requests
//! - [`config`] - Typed TOML configuration and validation
//! - [`connection`] - Connection state reported by supervisors
//! - [`dispatch`] - Async bridge and task handles
//! - [`backoff`] - Retry delay schedules
//! - [`ports`] - Radio/chat capability traits
//! - [`error`] - Shared error types
//!
//! # Example
//!
//! ```rust
//! use meshrelay_core::{RelayUnit, UnitKind};
//!
//! let unit = RelayUnit::radio_text(1, 0xa1b2c3d4, meshrelay_core::BROADCAST_ADDR, 0, "hello");
//! assert_eq!(unit.sender, "!a1b2c3d4");
//! assert_eq!(unit.classify(), UnitKind::Plain);
//! ```

pub mod message;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod backoff;
pub mod ports;
pub mod error;

// Re-exports for convenience
pub use error::{BridgeError, ConfigError, RelayError, Result};

pub use message::{
    radio_node_id, ChatMsgType, IdentityMetadata, LinkId, Linkage, MessageMapping, NodeUser,
    Origin, OutboundChat, OutboundText, PortKind, RelayUnit, UnitKind, BROADCAST_ADDR,
    RADIO_TEXT_LIMIT,
};

pub use config::{ChannelBinding, InteractionConfig, RelayConfig, Transport};

pub use connection::{ConnectionState, ConnectionStatus};

pub use dispatch::{AsyncBridge, TaskHandle};

pub use backoff::{connect_retry_delay, ReconnectBackoff};

pub use ports::{ChatPort, RadioPort};
