//! Bluetooth Low Energy interface for radio devices
//!
//! The device exposes one GATT service with three characteristics: ToRadio
//! (write), FromRadio (read, drained until empty) and FromNum (notify, bumps
//! whenever FromRadio has data).
//!
//! # Requirements
//!
//! Enable the `ble` feature in Cargo.toml to use this interface.
//!
//! On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use crate::error::{MeshtasticError, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{InterfaceState, MeshtasticInterface};

/// Radio GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
/// Write characteristic
pub const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
/// Read characteristic
pub const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);
/// Notify characteristic
pub const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

const SCAN_POLL: Duration = Duration::from_millis(500);

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// BLE interface for connecting to radio devices over Bluetooth
pub struct BleInterface {
    address: String,
    scan_timeout: Duration,
    peripheral: Option<Peripheral>,
    to_radio: Option<Characteristic>,
    from_radio: Option<Characteristic>,
    notifications: Option<NotificationStream>,
    draining: bool,
    state: InterfaceState,
    name: String,
}

impl BleInterface {
    /// Create a new BLE interface
    ///
    /// # Arguments
    ///
    /// * `address` - MAC address or advertised device name
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: format!("ble:{address}"),
            address,
            scan_timeout: Duration::from_secs(30),
            peripheral: None,
            to_radio: None,
            from_radio: None,
            notifications: None,
            draining: false,
            state: InterfaceState::Disconnected,
        }
    }

    /// Bound the scan for the device
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Device address
    pub fn address(&self) -> &str {
        &self.address
    }

    fn reset(&mut self) {
        self.peripheral = None;
        self.to_radio = None;
        self.from_radio = None;
        self.notifications = None;
        self.draining = false;
        self.state = InterfaceState::Disconnected;
    }
}

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| MeshtasticError::Ble("no Bluetooth adapter found".into()))
}

async fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    if peripheral.address().to_string().eq_ignore_ascii_case(address) {
        return true;
    }
    match peripheral.properties().await {
        Ok(Some(props)) => props.local_name.as_deref() == Some(address),
        _ => false,
    }
}

async fn known_peripheral(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>> {
    for peripheral in adapter.peripherals().await? {
        if matches_address(&peripheral, address).await {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

async fn find_peripheral(adapter: &Adapter, address: &str, timeout: Duration) -> Result<Peripheral> {
    if let Some(peripheral) = known_peripheral(adapter, address).await? {
        return Ok(peripheral);
    }

    adapter
        .start_scan(ScanFilter {
            services: vec![SERVICE_UUID],
        })
        .await?;

    let deadline = Instant::now() + timeout;
    let found = loop {
        if let Some(peripheral) = known_peripheral(adapter, address).await? {
            break Some(peripheral);
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(SCAN_POLL).await;
    };

    if let Err(e) = adapter.stop_scan().await {
        debug!(error = %e, "Failed to stop BLE scan");
    }

    found.ok_or(MeshtasticError::ConnectionTimeout {
        duration_ms: timeout.as_millis() as u64,
    })
}

/// Disconnect an OS-level session to `address` left over from a previous run
///
/// Returns whether a stale session was found.
pub async fn force_disconnect_stale(address: &str) -> Result<bool> {
    let adapter = first_adapter().await?;
    let Some(peripheral) = known_peripheral(&adapter, address).await? else {
        return Ok(false);
    };

    if !peripheral.is_connected().await.unwrap_or(false) {
        return Ok(false);
    }

    warn!(address, "Disconnecting stale BLE session");
    peripheral.disconnect().await?;
    Ok(true)
}

#[async_trait]
impl MeshtasticInterface for BleInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == InterfaceState::Connected {
            return Ok(());
        }

        self.state = InterfaceState::Connecting;
        info!(address = %self.address, "Connecting to radio over BLE");

        let result: Result<()> = async {
            let adapter = first_adapter().await?;
            let peripheral = find_peripheral(&adapter, &self.address, self.scan_timeout).await?;

            peripheral.connect().await?;
            peripheral.discover_services().await?;

            let chars = peripheral.characteristics();
            let find = |uuid: Uuid| {
                chars
                    .iter()
                    .find(|c| c.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| MeshtasticError::Ble(format!("characteristic {uuid} missing")))
            };
            let to_radio = find(TORADIO_UUID)?;
            let from_radio = find(FROMRADIO_UUID)?;
            let from_num = find(FROMNUM_UUID)?;

            peripheral.subscribe(&from_num).await?;
            let notifications = peripheral.notifications().await?;

            self.peripheral = Some(peripheral);
            self.to_radio = Some(to_radio);
            self.from_radio = Some(from_radio);
            self.notifications = Some(notifications);
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                // FromRadio may already hold queued payloads
                self.draining = true;
                self.state = InterfaceState::Connected;
                info!(address = %self.address, "BLE connection established");
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(peripheral) = self.peripheral.take() else {
            return Err(MeshtasticError::AlreadyClosed);
        };
        self.reset();

        peripheral.disconnect().await?;
        info!(address = %self.address, "BLE connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == InterfaceState::Connected && self.peripheral.is_some()
    }

    async fn read_packet(&mut self) -> Result<Option<Bytes>> {
        let (Some(peripheral), Some(from_radio)) = (&self.peripheral, &self.from_radio) else {
            return Err(MeshtasticError::NotConnected);
        };

        if self.draining {
            let data = peripheral.read(from_radio).await?;
            if !data.is_empty() {
                return Ok(Some(Bytes::from(data)));
            }
            self.draining = false;
        }

        let notifications = self
            .notifications
            .as_mut()
            .ok_or(MeshtasticError::NotConnected)?;
        match notifications.next().await {
            Some(n) if n.uuid == FROMNUM_UUID => {
                self.draining = true;
                Ok(None)
            }
            Some(_) => Ok(None),
            None => {
                self.state = InterfaceState::Disconnected;
                Err(MeshtasticError::Disconnected)
            }
        }
    }

    async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        let (Some(peripheral), Some(to_radio)) = (&self.peripheral, &self.to_radio) else {
            return Err(MeshtasticError::NotConnected);
        };
        peripheral
            .write(to_radio, packet, WriteType::WithResponse)
            .await?;
        // the reply is queued on FromRadio
        self.draining = true;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_render() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
        assert_eq!(
            FROMNUM_UUID.to_string(),
            "ed9da18c-a800-4f66-a670-aa7547e34453"
        );
    }

    #[tokio::test]
    async fn test_read_without_connection() {
        let mut iface = BleInterface::new("AA:BB:CC:DD:EE:FF");
        assert!(matches!(
            iface.read_packet().await,
            Err(MeshtasticError::NotConnected)
        ));
        assert!(iface.disconnect().await.unwrap_err().is_already_closed());
    }
}
