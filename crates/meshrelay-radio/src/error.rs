//! Error types for radio transport operations
//!
//! Every transport and session error maps onto a [`ConnectFailure`] class
//! so the supervisor can decide whether a connect attempt is worth retrying.

use thiserror::Error;

/// Main error type for radio transport operations
#[derive(Error, Debug)]
pub enum MeshtasticError {
    // ===== Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// The remote end refused the connection
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// The host ran out of memory while setting up the transport
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Transport read error
    #[error("Read error: {0}")]
    ReadError(String),

    /// Transport write error
    #[error("Write error: {0}")]
    WriteError(String),

    /// Device went away
    #[error("Device disconnected")]
    Disconnected,

    /// Close called on a handle that is already closed
    #[error("Interface already closed")]
    AlreadyClosed,

    /// Operation needs a live session
    #[error("Radio is not connected")]
    NotConnected,

    /// Bluetooth stack error
    #[error("BLE error: {0}")]
    Ble(String),

    /// Transport support not compiled into this build
    #[error("Transport '{0}' is not supported by this build")]
    UnsupportedTransport(String),

    // ===== Protocol Errors =====
    /// Protobuf decode error
    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(String),

    /// Invalid frame format
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    /// Payload larger than the radio accepts
    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// No response arrived for a request
    #[error("No response to {0} request")]
    NoResponse(&'static str),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// Supervisor is shutting down
    #[error("Radio supervisor is shutting down")]
    ShuttingDown,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a failed connect attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Never retried
    Fatal,
    /// Retried with backoff up to the configured attempt cap
    Retryable,
    /// Retried, but bounded by the timeout fast-fail cap
    Timeout,
}

impl MeshtasticError {
    /// Classify this error for connect retry decisions
    pub fn connect_failure(&self) -> ConnectFailure {
        match self {
            MeshtasticError::ConnectionRefused(_)
            | MeshtasticError::OutOfMemory(_)
            | MeshtasticError::InvalidConfig(_)
            | MeshtasticError::MissingConfig(_)
            | MeshtasticError::UnsupportedTransport(_) => ConnectFailure::Fatal,
            MeshtasticError::ConnectionTimeout { .. } => ConnectFailure::Timeout,
            MeshtasticError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::OutOfMemory => {
                    ConnectFailure::Fatal
                }
                std::io::ErrorKind::TimedOut => ConnectFailure::Timeout,
                _ => ConnectFailure::Retryable,
            },
            _ => ConnectFailure::Retryable,
        }
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        self.connect_failure() != ConnectFailure::Fatal
    }

    /// Errors a close path should swallow
    pub fn is_already_closed(&self) -> bool {
        match self {
            MeshtasticError::AlreadyClosed
            | MeshtasticError::Disconnected
            | MeshtasticError::NotConnected => true,
            MeshtasticError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Check if this is a protocol error (bad data from device)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            MeshtasticError::ProtobufDecode(_) | MeshtasticError::InvalidPacket(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshtasticError::PortNotFound(_) => "PORT_NOT_FOUND",
            MeshtasticError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            MeshtasticError::ConnectionRefused(_) => "CONNECTION_REFUSED",
            MeshtasticError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            MeshtasticError::OutOfMemory(_) => "OUT_OF_MEMORY",
            MeshtasticError::ReadError(_) => "READ_ERROR",
            MeshtasticError::WriteError(_) => "WRITE_ERROR",
            MeshtasticError::Disconnected => "DISCONNECTED",
            MeshtasticError::AlreadyClosed => "ALREADY_CLOSED",
            MeshtasticError::NotConnected => "NOT_CONNECTED",
            MeshtasticError::Ble(_) => "BLE_ERROR",
            MeshtasticError::UnsupportedTransport(_) => "UNSUPPORTED_TRANSPORT",
            MeshtasticError::ProtobufDecode(_) => "PROTOBUF_DECODE",
            MeshtasticError::InvalidPacket(_) => "INVALID_PACKET",
            MeshtasticError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            MeshtasticError::NoResponse(_) => "NO_RESPONSE",
            MeshtasticError::InvalidConfig(_) => "INVALID_CONFIG",
            MeshtasticError::MissingConfig(_) => "MISSING_CONFIG",
            MeshtasticError::ShuttingDown => "SHUTTING_DOWN",
            MeshtasticError::ChannelClosed => "CHANNEL_CLOSED",
            MeshtasticError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for radio operations
pub type Result<T> = std::result::Result<T, MeshtasticError>;

// Conversion from prost decode error
impl From<prost::DecodeError> for MeshtasticError {
    fn from(err: prost::DecodeError) -> Self {
        MeshtasticError::ProtobufDecode(err.to_string())
    }
}

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for MeshtasticError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => MeshtasticError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                MeshtasticError::Io(std::io::Error::new(kind, err.description))
            }
            _ => MeshtasticError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for MeshtasticError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => MeshtasticError::NotConnected,
            btleplug::Error::TimedOut(d) => MeshtasticError::ConnectionTimeout {
                duration_ms: d.as_millis() as u64,
            },
            other => MeshtasticError::Ble(other.to_string()),
        }
    }
}

impl From<MeshtasticError> for meshrelay_core::RelayError {
    fn from(err: MeshtasticError) -> Self {
        match err {
            MeshtasticError::NotConnected => meshrelay_core::RelayError::NotConnected("radio"),
            other => meshrelay_core::RelayError::Radio(other.to_string()),
        }
    }
}
