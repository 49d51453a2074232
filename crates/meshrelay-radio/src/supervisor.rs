//! Radio connection supervisor
//!
//! Owns the active [`RadioLink`] and drives its lifecycle:
//!
//! - `connect` retries with `min(2^attempt, 60s)` delays, never retries fatal
//!   errors and gives up after `timeout_fast_fail` timeouts even when retries
//!   are unlimited.
//! - A loss report from the active link starts exactly one reconnect loop
//!   with a doubling delay capped at five minutes.
//! - Non-BLE links are probed periodically; BLE reports its own disconnects.
//!
//! Inbound packets leave through a bounded channel of normalised
//! [`RelayUnit`]s, see [`RadioSupervisor::take_inbound`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use meshrelay_core::{
    connect_retry_delay, AsyncBridge, ConnectionState, ConnectionStatus, NodeUser, OutboundText,
    RadioPort, ReconnectBackoff, RelayConfig, RelayUnit, Transport,
};

use crate::ble_manager::BleInterfaceManager;
use crate::cache::DeduplicationCache;
use crate::config::{LinkTarget, BLE_SETTLE_DELAY, EVENT_CAPACITY, INBOUND_CAPACITY, PROBE_TIMEOUT};
use crate::connector::{DeviceConnector, RadioConnector};
use crate::error::{ConnectFailure, MeshtasticError, Result};
use crate::link::{LinkId, RadioEvent, RadioEventSink, RadioLink};
use crate::translator;

/// Supervisor of the radio side
pub struct RadioSupervisor<C: RadioConnector = DeviceConnector> {
    config: Arc<RelayConfig>,
    target: LinkTarget,
    connector: C,
    bridge: Arc<AsyncBridge>,
    active: Mutex<Option<Arc<dyn RadioLink>>>,
    ble: BleInterfaceManager,
    state: Mutex<ConnectionState>,
    reconnecting: AtomicBool,
    subscribed: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    next_link_id: AtomicU64,
    events_tx: mpsc::Sender<RadioEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RadioEvent>>>,
    inbound_tx: mpsc::Sender<RelayUnit>,
    inbound_rx: Mutex<Option<mpsc::Receiver<RelayUnit>>>,
    dedup: DeduplicationCache,
    backoff: Mutex<ReconnectBackoff>,
}

impl RadioSupervisor<DeviceConnector> {
    /// Supervisor for a real device
    pub fn new(config: Arc<RelayConfig>, bridge: Arc<AsyncBridge>) -> Result<Arc<Self>> {
        Self::with_connector(config, DeviceConnector, bridge)
    }
}

impl<C: RadioConnector> RadioSupervisor<C> {
    /// Supervisor building links through `connector`
    pub fn with_connector(
        config: Arc<RelayConfig>,
        connector: C,
        bridge: Arc<AsyncBridge>,
    ) -> Result<Arc<Self>> {
        let target = LinkTarget::from_config(&config.radio)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            state: Mutex::new(ConnectionState::new(target.transport(), target.address())),
            backoff: Mutex::new(ReconnectBackoff::new(config.radio.reconnect_floor)),
            config,
            target,
            connector,
            bridge,
            active: Mutex::new(None),
            ble: BleInterfaceManager::new(),
            reconnecting: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            next_link_id: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            dedup: DeduplicationCache::new(),
        }))
    }

    /// Physical endpoint being supervised
    pub fn target(&self) -> &LinkTarget {
        &self.target
    }

    /// Link factory in use
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Snapshot of the connection state
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Whether a live link is installed
    pub fn is_connected(&self) -> bool {
        self.active().is_some_and(|link| link.is_connected())
    }

    /// Whether a reconnect loop is running
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Receiver of normalised inbound units; `None` after the first call
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<RelayUnit>> {
        self.inbound_rx.lock().take()
    }

    fn active(&self) -> Option<Arc<dyn RadioLink>> {
        self.active.lock().clone()
    }

    fn is_active(&self, link_id: LinkId) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|link| link.link_id() == link_id)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    fn new_sink(&self) -> RadioEventSink {
        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        RadioEventSink::new(link_id, self.events_tx.clone())
    }

    /// Sleep unless shutdown starts first; `false` means shutting down
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_shutting_down(),
            _ = shutdown_signal(&mut shutdown) => false,
        }
    }

    /// Connect to the configured radio, retrying per configuration
    ///
    /// Does nothing while shutting down ([`MeshtasticError::ShuttingDown`])
    /// or while a reconnect loop owns the session, unless `force_replace`.
    pub async fn connect(self: &Arc<Self>, force_replace: bool) -> Result<()> {
        if self.is_shutting_down() {
            return Err(MeshtasticError::ShuttingDown);
        }
        if self.is_reconnecting() && !force_replace {
            debug!("Reconnect in progress, skipping connect");
            return Ok(());
        }

        let retries = self.config.radio.retries;
        let fast_fail = self.config.radio.timeout_fast_fail.max(1);
        let mut failures = 0u32;
        let mut timeouts = 0u32;

        self.set_status(ConnectionStatus::Connecting);
        loop {
            if self.is_shutting_down() {
                return Err(MeshtasticError::ShuttingDown);
            }

            info!(target = %self.target, attempt = failures + 1, "Connecting to radio");
            let err = match self.open_link().await {
                Ok(link) => {
                    self.install(link);
                    return Ok(());
                }
                Err(err) => err,
            };

            failures += 1;
            self.state.lock().retry_count = failures;

            match err.connect_failure() {
                ConnectFailure::Fatal => {
                    error!(target = %self.target, error = %err, "Radio connect failed, not retrying");
                    self.set_status(ConnectionStatus::Idle);
                    return Err(err);
                }
                ConnectFailure::Timeout => {
                    timeouts += 1;
                    if timeouts >= fast_fail {
                        error!(target = %self.target, timeouts, "Radio connect keeps timing out, giving up");
                        self.set_status(ConnectionStatus::Idle);
                        return Err(err);
                    }
                }
                ConnectFailure::Retryable => {}
            }

            if retries != 0 && failures > retries {
                error!(target = %self.target, attempts = failures, error = %err, "Radio connect retries exhausted");
                self.set_status(ConnectionStatus::Idle);
                return Err(err);
            }

            let delay = connect_retry_delay(failures);
            warn!(target = %self.target, error = %err, retry_in = ?delay, "Radio connect failed");
            if !self.wait_or_shutdown(delay).await {
                return Err(MeshtasticError::ShuttingDown);
            }
        }
    }

    async fn open_link(&self) -> Result<Arc<dyn RadioLink>> {
        let timeout = self.config.radio.timeout;

        if let LinkTarget::Ble { address } = &self.target {
            let permit = self.ble.lock_connect().await;
            if self.ble.current_address().as_deref() != Some(address.as_str()) {
                match self.connector.clear_stale_ble(address).await {
                    Ok(true) => info!(address = %address, "Cleared stale BLE session"),
                    Ok(false) => {}
                    Err(e) => warn!(address = %address, error = %e, "Stale BLE cleanup failed"),
                }
            }
            let link = self
                .ble
                .acquire(&permit, address, || {
                    self.connector.create(&self.target, self.new_sink(), timeout)
                })
                .await?;
            link.connect().await?;
            return Ok(link);
        }

        self.close_active().await;
        if let LinkTarget::Serial { port, .. } = &self.target {
            if !self.connector.port_exists(port) {
                return Err(MeshtasticError::PortNotFound(port.display().to_string()));
            }
        }
        let link = self
            .connector
            .create(&self.target, self.new_sink(), timeout)?;
        link.connect().await?;
        Ok(link)
    }

    fn install(self: &Arc<Self>, link: Arc<dyn RadioLink>) {
        info!(link = link.name(), link_id = link.link_id(), "Radio connected");
        *self.active.lock() = Some(link);
        {
            let mut state = self.state.lock();
            state.status = ConnectionStatus::Connected;
            state.retry_count = 0;
        }
        self.backoff.lock().reset();
        self.ensure_subscribed();
    }

    async fn close_active(&self) {
        let previous = self.active.lock().take();
        if let Some(link) = previous {
            close_quietly(link.as_ref()).await;
        }
    }

    /// Start the event pump once per supervisor
    fn ensure_subscribed(self: &Arc<Self>) {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut events) = self.events_rx.lock().take() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown_signal(&mut shutdown) => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(this) = weak.upgrade() else { break };
                this.handle_event(event);
            }
            debug!("Radio event pump stopped");
        });
    }

    fn handle_event(self: &Arc<Self>, event: RadioEvent) {
        match event {
            RadioEvent::Packet { link_id, packet } => {
                if !self.is_active(link_id) {
                    trace!(link_id, "Dropping packet from inactive link");
                    return;
                }
                if packet.id != 0 && self.dedup.check_and_record(packet.from, packet.id) {
                    return;
                }
                let Some(unit) = translator::normalize(&packet, &self.config.radio.meshnet_name)
                else {
                    return;
                };
                match self.inbound_tx.try_send(unit) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(packet_id = packet.id, "Inbound queue full, dropping radio message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Inbound queue closed");
                    }
                }
            }
            RadioEvent::ConnectionLost { link_id, source } => {
                self.on_connection_lost(link_id, &source);
            }
        }
    }

    /// React to a dead link
    ///
    /// Only the first report for the active link counts; the rest are
    /// ignored until the reconnect loop finishes.
    pub fn on_connection_lost(self: &Arc<Self>, link_id: LinkId, source: &str) {
        if self.is_shutting_down() {
            debug!(source, "Ignoring connection loss during shutdown");
            return;
        }
        if !self.is_active(link_id) {
            debug!(link_id, source, "Ignoring connection loss from stale link");
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!(source, "Reconnect already in progress");
            return;
        }

        warn!(link_id, source, "Radio connection lost");
        let dead = self.active.lock().take();
        self.set_status(ConnectionStatus::Reconnecting);

        let this = Arc::clone(self);
        self.bridge.fire_and_forget("radio-reconnect", async move {
            if let Some(link) = dead {
                this.retire(link).await;
            }
            this.reconnect_loop().await;
            Ok::<(), MeshtasticError>(())
        });
    }

    async fn retire(&self, link: Arc<dyn RadioLink>) {
        if self.target.transport() == Transport::Ble {
            self.ble.release().await;
            self.wait_or_shutdown(BLE_SETTLE_DELAY).await;
        } else {
            close_quietly(link.as_ref()).await;
        }
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        loop {
            let delay = self.backoff.lock().next_delay();
            info!(delay = ?delay, "Reconnecting to radio");
            if !self.wait_or_shutdown(delay).await {
                debug!("Reconnect loop stopped by shutdown");
                break;
            }

            match self.connect(true).await {
                Ok(()) => {
                    info!("Radio reconnected");
                    break;
                }
                Err(MeshtasticError::ShuttingDown) => break,
                Err(e) if e.connect_failure() == ConnectFailure::Fatal => {
                    error!(error = %e, "Radio reconnect abandoned");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Radio reconnect attempt failed");
                    self.set_status(ConnectionStatus::Reconnecting);
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Start periodic liveness probing; `None` when disabled or on BLE
    pub fn spawn_health_check(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let health = &self.config.radio.health_check;
        if !health.enabled {
            debug!("Radio health check disabled");
            return None;
        }
        if self.target.transport() == Transport::Ble {
            debug!("Skipping health check for BLE");
            return None;
        }

        let period = health.heartbeat_interval;
        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_signal(&mut shutdown) => break,
                    _ = ticker.tick() => {}
                }
                let Some(this) = weak.upgrade() else { break };
                this.probe().await;
            }
        }))
    }

    /// Two-tier probe: device metadata, then node info
    async fn probe(self: &Arc<Self>) {
        if self.is_reconnecting() {
            return;
        }
        let Some(link) = self.active() else { return };

        match link.device_metadata(PROBE_TIMEOUT).await {
            Ok(metadata) => {
                trace!(firmware = %metadata.firmware_version, "Radio health check passed");
                return;
            }
            Err(e) => debug!(error = %e, "Metadata probe failed, falling back to node info"),
        }

        match link.my_node_info(PROBE_TIMEOUT).await {
            Ok(info) => debug!(node = info.my_node_num, "Node info probe passed"),
            Err(e) => {
                warn!(link = link.name(), error = %e, "Radio health check failed");
                self.on_connection_lost(link.link_id(), &format!("health check failed: {e}"));
            }
        }
    }

    /// Transmit a text on the active link
    pub async fn send_text(&self, message: &OutboundText) -> Result<u32> {
        let link = self.active().ok_or(MeshtasticError::NotConnected)?;
        link.send_text(message).await
    }

    /// Stop reconnecting and close the session
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down radio supervisor");
        self.shutdown_tx.send_replace(true);
        self.close_active().await;
        self.ble.release().await;
        self.set_status(ConnectionStatus::Closed);
    }
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn close_quietly(link: &dyn RadioLink) {
    match link.close().await {
        Ok(()) => debug!(link = link.name(), "Closed radio link"),
        Err(e) if e.is_already_closed() => trace!(link = link.name(), "Radio link already closed"),
        Err(e) => warn!(link = link.name(), error = %e, "Failed to close radio link"),
    }
}

#[async_trait]
impl<C: RadioConnector> RadioPort for RadioSupervisor<C> {
    async fn send_text(&self, message: OutboundText) -> meshrelay_core::Result<u32> {
        Ok(RadioSupervisor::send_text(self, &message).await?)
    }

    fn node_user(&self, node: u32) -> Option<NodeUser> {
        self.active()?.lookup_node(node)
    }

    fn my_node_num(&self) -> Option<u32> {
        self.active()?.my_node_num()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockConnector, MOCK_NODE_NUM, MOCK_PEER_NUM};
    use tokio::runtime::Handle;

    const BASE: &str = r#"
        [chat]
        homeserver = "https://matrix.example.org"
        access_token = "token"

        [[rooms]]
        id = "!room:example.org"
        radio_channel = 0
    "#;

    fn config(radio: &str) -> Arc<RelayConfig> {
        let toml = format!("[radio]\nmeshnet_name = \"Home\"\n{radio}\n{BASE}");
        Arc::new(RelayConfig::from_toml_str(&toml).unwrap())
    }

    fn tcp(extra: &str) -> Arc<RelayConfig> {
        config(&format!("connection_type = \"tcp\"\nhost = \"radio.lan\"\n{extra}"))
    }

    fn supervisor(config: Arc<RelayConfig>) -> Arc<RadioSupervisor<MockConnector>> {
        let bridge = Arc::new(AsyncBridge::start(Handle::current()));
        RadioSupervisor::with_connector(config, MockConnector::new(), bridge).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_reports_state() {
        let sup = supervisor(tcp(""));
        sup.connect(false).await.unwrap();

        let state = sup.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.address, "radio.lan:4403");
        assert!(sup.is_connected());
        assert_eq!(RadioPort::my_node_num(sup.as_ref()), Some(MOCK_NODE_NUM));
        assert_eq!(
            sup.node_user(MOCK_PEER_NUM).map(|u| u.short_name),
            Some("ALI".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let sup = supervisor(tcp(""));
        sup.connector.fail_always(|| MeshtasticError::ConnectionRefused("radio.lan".into()));

        let err = sup.connect(false).await.unwrap_err();
        assert!(matches!(err, MeshtasticError::ConnectionRefused(_)));
        assert_eq!(sup.connector.connect_attempts(), 1);
        assert_eq!(sup.state().status, ConnectionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_fail_fast_with_unlimited_retries() {
        let sup = supervisor(tcp("retries = 0\ntimeout_fast_fail = 3"));
        sup.connector
            .fail_always(|| MeshtasticError::ConnectionTimeout { duration_ms: 30_000 });

        let err = sup.connect(false).await.unwrap_err();
        assert!(matches!(err, MeshtasticError::ConnectionTimeout { .. }));
        assert_eq!(sup.connector.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_respect_retry_cap() {
        let sup = supervisor(tcp("retries = 2"));
        sup.connector
            .fail_always(|| MeshtasticError::ReadError("garbled".into()));

        assert!(sup.connect(false).await.is_err());
        assert_eq!(sup.connector.connect_attempts(), 3);

        sup.connector.heal();
        sup.connector.fail_next(|| MeshtasticError::ReadError("garbled".into()));
        sup.connect(false).await.unwrap();
        assert_eq!(sup.state().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_serial_port_never_opens() {
        let sup = supervisor(config(
            "connection_type = \"serial\"\nserial_port = \"/dev/ttyUSB9\"\nretries = 1",
        ));
        sup.connector.set_ports_present(false);

        let err = sup.connect(false).await.unwrap_err();
        assert!(matches!(err, MeshtasticError::PortNotFound(_)));
        assert_eq!(sup.connector.creations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_closes_previous_link() {
        let sup = supervisor(tcp(""));
        sup.connect(false).await.unwrap();
        sup.connect(true).await.unwrap();

        let links = sup.connector.links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].close_calls(), 1);
        assert!(!links[0].is_connected());
        assert!(links[1].is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_from_stale_link_is_ignored() {
        let sup = supervisor(tcp(""));
        sup.connect(false).await.unwrap();
        sup.connect(true).await.unwrap();

        sup.connector.links()[0].lose("old cable");
        settle().await;

        assert!(!sup.is_reconnecting());
        assert_eq!(sup.state().status, ConnectionStatus::Connected);
        assert_eq!(sup.connector.creations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_reconnects_once() {
        let sup = supervisor(tcp("reconnect_floor = \"10s\""));
        sup.connect(false).await.unwrap();
        let first = sup.connector.last_link().unwrap();

        first.lose("unplugged");
        first.lose("unplugged again");
        settle().await;

        assert!(sup.is_reconnecting());
        assert_eq!(sup.state().status, ConnectionStatus::Reconnecting);

        // Plain connects defer to the running reconnect loop
        sup.connect(false).await.unwrap();
        assert_eq!(sup.connector.creations(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sup.connector.creations(), 2);
        assert!(!sup.is_reconnecting());
        assert_eq!(sup.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_trying_after_failures() {
        let sup = supervisor(tcp("retries = 1\nreconnect_floor = \"10s\""));
        sup.connect(false).await.unwrap();

        sup.connector.fail_always(|| MeshtasticError::ReadError("no device".into()));
        sup.connector.last_link().unwrap().lose("reset");
        settle().await;

        // floor 10s, then two attempts with a 2s pause, then 20s
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(sup.is_reconnecting());
        let attempts = sup.connector.connect_attempts();
        assert!(attempts >= 3);

        sup.connector.heal();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!sup.is_reconnecting());
        assert!(sup.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_same_address_builds_one_link() {
        let sup = supervisor(config(
            "connection_type = \"ble\"\nble_address = \"AA:BB:CC:DD:EE:FF\"",
        ));
        sup.connect(false).await.unwrap();
        sup.connect(false).await.unwrap();

        assert_eq!(sup.connector.creations(), 1);
        assert_eq!(sup.connector.connect_attempts(), 2);
        assert_eq!(sup.connector.stale_cleared(), vec!["AA:BB:CC:DD:EE:FF"]);
        assert!(sup.spawn_health_check().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_loss_releases_and_rebuilds() {
        let sup = supervisor(config(
            "connection_type = \"ble\"\nble_address = \"AA:BB:CC:DD:EE:FF\"\nreconnect_floor = \"5s\"",
        ));
        sup.connect(false).await.unwrap();
        sup.connector.last_link().unwrap().lose("notify stopped");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sup.connector.creations(), 2);
        assert_eq!(sup.connector.stale_cleared().len(), 2);
        assert!(sup.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_failure_triggers_reconnect() {
        let sup = supervisor(tcp(
            "reconnect_floor = \"10s\"\n[radio.health_check]\nenabled = true\nheartbeat_interval = \"60s\"",
        ));
        sup.connect(false).await.unwrap();
        let health = sup.spawn_health_check().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(sup.connector.creations(), 1);

        sup.connector.last_link().unwrap().set_healthy(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(sup.is_reconnecting());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sup.connector.creations(), 2);
        assert!(sup.is_connected());

        sup.shutdown().await;
        health.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_is_normalised_and_deduplicated() {
        let sup = supervisor(tcp(""));
        let mut inbound = sup.take_inbound().unwrap();
        assert!(sup.take_inbound().is_none());
        sup.connect(false).await.unwrap();

        let link = sup.connector.last_link().unwrap();
        link.push_text(MOCK_PEER_NUM, 0, 41, "hello");
        link.push_text(MOCK_PEER_NUM, 0, 41, "hello");
        link.push_text(MOCK_PEER_NUM, 0, 42, "again");
        settle().await;

        let first = inbound.recv().await.unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(first.meshnet.as_deref(), Some("Home"));
        assert_eq!(inbound.recv().await.unwrap().text, "again");
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let sup = supervisor(tcp(""));
        sup.connect(false).await.unwrap();
        let link = sup.connector.last_link().unwrap();

        sup.shutdown().await;
        assert_eq!(sup.state().status, ConnectionStatus::Closed);
        assert!(!link.is_connected());

        link.lose("late");
        settle().await;
        assert!(!sup.is_reconnecting());
        assert!(matches!(
            sup.connect(true).await,
            Err(MeshtasticError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_link() {
        let sup = supervisor(tcp(""));
        let message = OutboundText::broadcast("hi", 0);
        assert!(matches!(
            sup.send_text(&message).await,
            Err(MeshtasticError::NotConnected)
        ));

        sup.connect(false).await.unwrap();
        sup.send_text(&message).await.unwrap();
        assert_eq!(sup.connector.last_link().unwrap().sent().len(), 1);
    }
}
