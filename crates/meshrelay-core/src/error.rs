//! Error types shared across the relay crates
//!
//! Each transport crate keeps its own detailed error enum; this module holds
//! the errors that cross crate boundaries: configuration validation, the
//! async bridge, and the port traits the router talks to.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the configuration file failed
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File path
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// TOML parse failure
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required field is missing for the chosen option
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// A field holds an unusable value
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid {
        /// Dotted field name
        field: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Errors produced by [`crate::dispatch::AsyncBridge`] handles
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The result did not arrive within the caller's bound
    #[error("Timed out after {0:?} waiting for bridged task")]
    Timeout(Duration),

    /// The task was dropped before it produced a result
    #[error("Bridged task was cancelled")]
    Cancelled,

    /// The task panicked while running
    #[error("Bridged task panicked")]
    Panicked,

    /// No loop could run the task
    #[error("Failed to schedule bridged task: {0}")]
    Schedule(String),

    /// A blocking wait was attempted from inside a runtime thread
    #[error("Blocking wait called from inside the event loop")]
    OnLoopThread,
}

/// Errors returned by the radio/chat ports the router sends through
#[derive(Error, Debug)]
pub enum RelayError {
    /// The radio side rejected or failed the request
    #[error("Radio error: {0}")]
    Radio(String),

    /// The chat side rejected or failed the request
    #[error("Chat error: {0}")]
    Chat(String),

    /// No active session on the named side
    #[error("{0} is not connected")]
    NotConnected(&'static str),

    /// Identity store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Relay service channel closed
    #[error("Relay channel closed")]
    ChannelClosed,
}

impl RelayError {
    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            RelayError::Radio(_) => "RADIO_ERROR",
            RelayError::Chat(_) => "CHAT_ERROR",
            RelayError::NotConnected(_) => "NOT_CONNECTED",
            RelayError::Store(_) => "STORE_ERROR",
            RelayError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

/// Result alias for port operations
pub type Result<T> = std::result::Result<T, RelayError>;
