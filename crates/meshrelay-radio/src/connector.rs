//! Link construction per transport

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LinkTarget;
use crate::error::{MeshtasticError, Result};
use crate::link::{RadioEventSink, RadioLink};

/// Builds links for the supervisor
///
/// The supervisor decides when to build and connect; implementations only
/// know how to turn a [`LinkTarget`] into an unconnected link.
#[async_trait]
pub trait RadioConnector: Send + Sync + 'static {
    /// Build an unconnected link for `target`
    fn create(
        &self,
        target: &LinkTarget,
        sink: RadioEventSink,
        timeout: Duration,
    ) -> Result<Arc<dyn RadioLink>>;

    /// Probe a serial port before opening it
    fn port_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Drop an OS-level BLE session left behind at `address`
    async fn clear_stale_ble(&self, _address: &str) -> Result<bool> {
        Ok(false)
    }
}

#[async_trait]
impl<T: RadioConnector> RadioConnector for Arc<T> {
    fn create(
        &self,
        target: &LinkTarget,
        sink: RadioEventSink,
        timeout: Duration,
    ) -> Result<Arc<dyn RadioLink>> {
        self.as_ref().create(target, sink, timeout)
    }

    fn port_exists(&self, path: &Path) -> bool {
        self.as_ref().port_exists(path)
    }

    async fn clear_stale_ble(&self, address: &str) -> Result<bool> {
        self.as_ref().clear_stale_ble(address).await
    }
}

/// Connector for real devices; transports depend on enabled features
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceConnector;

#[cfg(feature = "serial")]
fn serial_link(
    port: &Path,
    baud_rate: u32,
    sink: RadioEventSink,
    timeout: Duration,
) -> Result<Arc<dyn RadioLink>> {
    use crate::interface::SerialInterface;
    use crate::link::FramedLink;

    let iface = SerialInterface::new(port).with_baud_rate(baud_rate);
    Ok(Arc::new(FramedLink::new(iface, sink, timeout)))
}

#[cfg(not(feature = "serial"))]
fn serial_link(_: &Path, _: u32, _: RadioEventSink, _: Duration) -> Result<Arc<dyn RadioLink>> {
    Err(MeshtasticError::UnsupportedTransport("serial".into()))
}

#[cfg(feature = "tcp")]
fn tcp_link(
    host: &str,
    port: u16,
    sink: RadioEventSink,
    timeout: Duration,
) -> Result<Arc<dyn RadioLink>> {
    use crate::interface::TcpInterface;
    use crate::link::FramedLink;

    let iface = TcpInterface::new(format!("{host}:{port}")).with_timeout(timeout);
    Ok(Arc::new(FramedLink::new(iface, sink, timeout)))
}

#[cfg(not(feature = "tcp"))]
fn tcp_link(_: &str, _: u16, _: RadioEventSink, _: Duration) -> Result<Arc<dyn RadioLink>> {
    Err(MeshtasticError::UnsupportedTransport("tcp".into()))
}

#[cfg(feature = "ble")]
fn ble_link(address: &str, sink: RadioEventSink, timeout: Duration) -> Result<Arc<dyn RadioLink>> {
    use crate::interface::BleInterface;
    use crate::link::FramedLink;

    let iface = BleInterface::new(address).with_timeout(timeout);
    Ok(Arc::new(FramedLink::new(iface, sink, timeout)))
}

#[cfg(not(feature = "ble"))]
fn ble_link(_: &str, _: RadioEventSink, _: Duration) -> Result<Arc<dyn RadioLink>> {
    Err(MeshtasticError::UnsupportedTransport("ble".into()))
}

#[async_trait]
impl RadioConnector for DeviceConnector {
    fn create(
        &self,
        target: &LinkTarget,
        sink: RadioEventSink,
        timeout: Duration,
    ) -> Result<Arc<dyn RadioLink>> {
        match target {
            LinkTarget::Serial { port, baud_rate } => serial_link(port, *baud_rate, sink, timeout),
            LinkTarget::Tcp { host, port } => tcp_link(host, *port, sink, timeout),
            LinkTarget::Ble { address } => ble_link(address, sink, timeout),
        }
    }

    async fn clear_stale_ble(&self, address: &str) -> Result<bool> {
        #[cfg(feature = "ble")]
        {
            crate::interface::force_disconnect_stale(address).await
        }
        #[cfg(not(feature = "ble"))]
        {
            let _ = address;
            Ok(false)
        }
    }
}
