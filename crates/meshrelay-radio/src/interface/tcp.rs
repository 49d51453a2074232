//! TCP interface for networked radio devices
//!
//! Devices with WiFi or Ethernet expose the same framed stream as the serial
//! port on TCP port 4403.

use crate::config::MAX_FRAME_PAYLOAD;
use crate::error::{MeshtasticError, Result};
use crate::interface::framing::{frame_packet, FrameDecoder};
use crate::interface::{InterfaceState, MeshtasticInterface};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// TCP interface for connecting to radio devices over the network
pub struct TcpInterface {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    state: InterfaceState,
    decoder: FrameDecoder,
    name: String,
}

impl TcpInterface {
    /// Create a new TCP interface
    ///
    /// # Arguments
    ///
    /// * `address` - The address to connect to (e.g., "192.168.1.100:4403")
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: format!("tcp:{address}"),
            address,
            connect_timeout: Duration::from_secs(30),
            stream: None,
            state: InterfaceState::Disconnected,
            decoder: FrameDecoder::new(),
        }
    }

    /// Bound the TCP handshake
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get the current connection state
    pub fn state(&self) -> InterfaceState {
        self.state
    }
}

#[async_trait]
impl MeshtasticInterface for TcpInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == InterfaceState::Connected {
            return Ok(());
        }

        self.state = InterfaceState::Connecting;
        info!(address = %self.address, "Connecting to radio over TCP");

        let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;
        let stream = match attempt {
            Err(_) => {
                self.state = InterfaceState::Disconnected;
                return Err(MeshtasticError::ConnectionTimeout {
                    duration_ms: self.connect_timeout.as_millis() as u64,
                });
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                self.state = InterfaceState::Disconnected;
                return Err(MeshtasticError::ConnectionRefused(self.address.clone()));
            }
            Ok(Err(e)) => {
                self.state = InterfaceState::Disconnected;
                return Err(MeshtasticError::Io(e));
            }
            Ok(Ok(stream)) => stream,
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.stream = Some(stream);
        self.state = InterfaceState::Connected;
        self.decoder.clear();

        info!(address = %self.address, "TCP connection established");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Err(MeshtasticError::AlreadyClosed);
        };

        self.state = InterfaceState::Disconnected;
        self.decoder.clear();

        if let Err(e) = stream.shutdown().await {
            trace!(error = %e, "TCP shutdown on closed socket");
        }
        info!(address = %self.address, "TCP connection closed");
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
                trace!(bytes = n, "Read from TCP stream");
                self.decoder.extend(&buf[..n]);
                self.decoder.next_frame()
            }
            Err(e) => {
                warn!(error = %e, "TCP read error");
                self.state = InterfaceState::Disconnected;
                Err(MeshtasticError::ReadError(e.to_string()))
            }
        }
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(MeshtasticError::NotConnected)?;

        let packet = frame_packet(payload)?;
        debug!(size = packet.len(), "Writing frame");

        stream.write_all(&packet).await.map_err(|e| {
            self.state = InterfaceState::Disconnected;
            MeshtasticError::WriteError(e.to_string())
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_exchange_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // split across writes with leading noise
            socket.write_all(b"log line\n").await.unwrap();
            let frame = frame_packet(b"from-radio").unwrap();
            socket.write_all(&frame[..3]).await.unwrap();
            socket.write_all(&frame[3..]).await.unwrap();

            let mut header = [0u8; 4];
            socket.read_exact(&mut header).await.unwrap();
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();
            body
        });

        let mut iface = TcpInterface::new(addr.to_string());
        iface.connect().await.unwrap();
        assert!(iface.is_connected());

        let mut received = None;
        for _ in 0..10 {
            if let Some(frame) = iface.read_packet().await.unwrap() {
                received = Some(frame);
                break;
            }
        }
        assert_eq!(received.unwrap().as_ref(), b"from-radio");

        iface.write_packet(b"to-radio").await.unwrap();
        assert_eq!(device.await.unwrap(), b"to-radio");

        iface.disconnect().await.unwrap();
        assert!(iface.disconnect().await.unwrap_err().is_already_closed());
    }

    #[tokio::test]
    async fn test_refused_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut iface = TcpInterface::new(addr.to_string());
        let err = iface.connect().await.unwrap_err();
        assert_eq!(err.connect_failure(), crate::error::ConnectFailure::Fatal);
    }

    #[tokio::test]
    async fn test_eof_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut iface = TcpInterface::new(addr.to_string());
        iface.connect().await.unwrap();
        accept.await.unwrap();

        assert!(matches!(
            iface.read_packet().await,
            Err(MeshtasticError::Disconnected)
        ));
    }
}
