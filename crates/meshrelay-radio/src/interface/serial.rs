//! Serial port interface for radio devices
//!
//! Async serial communication using tokio-serial, framed with the
//! 0x94C3 magic header.

use crate::config::{DEFAULT_BAUD_RATE, MAX_FRAME_PAYLOAD};
use crate::error::{MeshtasticError, Result};
use crate::interface::framing::{frame_packet, FrameDecoder};
use crate::interface::{InterfaceState, MeshtasticInterface};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

/// Serial interface for radio communication
pub struct SerialInterface {
    port_path: PathBuf,
    baud_rate: u32,
    timeout: Duration,
    stream: Option<SerialStream>,
    state: InterfaceState,
    decoder: FrameDecoder,
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_secs(10),
            stream: None,
            state: InterfaceState::Disconnected,
            decoder: FrameDecoder::new(),
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Create with custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> InterfaceState {
        self.state
    }
}

#[async_trait]
impl MeshtasticInterface for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == InterfaceState::Connected {
            return Ok(());
        }

        self.state = InterfaceState::Connecting;
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Connecting to serial port");

        if !self.port_path.exists() {
            self.state = InterfaceState::Disconnected;
            return Err(MeshtasticError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                self.state = InterfaceState::Disconnected;
                MeshtasticError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = InterfaceState::Connected;
        self.decoder.clear();

        info!(port = %self.port_path.display(), "Serial port open");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.stream.take().is_none() {
            return Err(MeshtasticError::AlreadyClosed);
        }

        self.state = InterfaceState::Disconnected;
        self.decoder.clear();

        info!(port = %self.port_path.display(), "Serial port closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == InterfaceState::Connected && self.stream.is_some()
    }

    async fn read_packet(&mut self) -> Result<Option<Bytes>> {
        if let Some(frame) = self.decoder.next_frame()? {
            return Ok(Some(frame));
        }

        let stream = self.stream.as_mut().ok_or(MeshtasticError::NotConnected)?;
        let mut buf = [0u8; MAX_FRAME_PAYLOAD];

        match stream.read(&mut buf).await {
            Ok(0) => {
                self.state = InterfaceState::Disconnected;
                Err(MeshtasticError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                self.decoder.extend(&buf[..n]);
                self.decoder.next_frame()
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "Serial read error");
                self.state = InterfaceState::Disconnected;
                Err(MeshtasticError::ReadError(e.to_string()))
            }
        }
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MeshtasticError::NotConnected)?;

        let packet = frame_packet(payload)?;
        debug!(size = packet.len(), payload_size = payload.len(), "Writing frame");

        stream.write_all(&packet).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.state = InterfaceState::Disconnected;
            MeshtasticError::WriteError(e.to_string())
        })?;

        stream
            .flush()
            .await
            .map_err(|e| MeshtasticError::WriteError(format!("Flush failed: {e}")))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_state() {
        let iface = SerialInterface::new("/dev/ttyUSB0");
        assert_eq!(iface.state(), InterfaceState::Disconnected);
        assert!(!iface.is_connected());
        assert_eq!(iface.name(), "serial:/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_connect_missing_port() {
        let mut iface = SerialInterface::new("/dev/meshrelay-does-not-exist");
        assert!(matches!(
            iface.connect().await,
            Err(MeshtasticError::PortNotFound(_))
        ));
        assert_eq!(iface.state(), InterfaceState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_when_closed() {
        let mut iface = SerialInterface::new("/dev/ttyUSB0");
        let err = iface.disconnect().await.unwrap_err();
        assert!(err.is_already_closed());
    }
}
