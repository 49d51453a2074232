//! Test doubles for radio sessions
//!
//! - [`MockInterface`] / [`MockDevice`]: a byte-level interface driven by the
//!   test, answering config and metadata requests like a real device.
//! - [`MockLink`]: a scripted [`RadioLink`] for supervisor tests.
//! - [`MockConnector`]: hands out [`MockLink`]s and records what was built.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshrelay_radio::test_utils::MockInterface;
//!
//! let (iface, device) = MockInterface::new();
//! device.push_text(0x1234, 0, 1, "hello");
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use meshrelay_core::{NodeUser, OutboundText};

use crate::config::{LinkTarget, BROADCAST};
use crate::connector::RadioConnector;
use crate::error::{MeshtasticError, Result};
use crate::interface::MeshtasticInterface;
use crate::link::{LinkId, RadioEventSink, RadioLink};
use crate::proto::{
    port, AdminMessage, Data, DeviceMetadata, FromRadio, MeshPacket, MyNodeInfo, NodeInfo, ToRadio,
    User,
};

/// Node number of the simulated local radio
pub const MOCK_NODE_NUM: u32 = 0x0bad_c0de;

/// Node number of a simulated peer in the node database
pub const MOCK_PEER_NUM: u32 = 0x0000_1234;

/// Firmware version reported by the simulated device
pub const MOCK_FIRMWARE: &str = "2.3.2.mock";

enum Feed {
    Frame(Bytes),
    Fail(String),
}

struct DeviceState {
    sent: Vec<ToRadio>,
    answer_config: bool,
    answer_metadata: bool,
}

/// Test side of a [`MockInterface`]
#[derive(Clone)]
pub struct MockDevice {
    feed: mpsc::UnboundedSender<Feed>,
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    /// Deliver a raw payload as if read from the device
    pub fn push_raw(&self, payload: impl Into<Bytes>) {
        let _ = self.feed.send(Feed::Frame(payload.into()));
    }

    /// Deliver a `FromRadio` envelope
    pub fn push(&self, msg: FromRadio) {
        self.push_raw(msg.encode_to_vec());
    }

    /// Deliver a received packet
    pub fn push_packet(&self, packet: MeshPacket) {
        self.push(FromRadio {
            packet: Some(packet),
            ..Default::default()
        });
    }

    /// Deliver a broadcast text packet
    pub fn push_text(&self, from: u32, channel: u32, id: u32, text: &str) {
        self.push_packet(text_packet(from, BROADCAST, channel, id, text));
    }

    /// Make the next read fail like a pulled cable
    pub fn fail(&self, reason: &str) {
        let _ = self.feed.send(Feed::Fail(reason.to_string()));
    }

    /// Whether `want_config_id` requests are answered
    pub fn set_answer_config(&self, answer: bool) {
        self.state.lock().answer_config = answer;
    }

    /// Whether metadata requests are answered
    pub fn set_answer_metadata(&self, answer: bool) {
        self.state.lock().answer_metadata = answer;
    }

    /// Packets written by the client
    pub fn sent_packets(&self) -> Vec<MeshPacket> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| m.packet.clone())
            .collect()
    }

    /// Every envelope written by the client
    pub fn sent(&self) -> Vec<ToRadio> {
        self.state.lock().sent.clone()
    }
}

/// Build a text packet
pub fn text_packet(from: u32, to: u32, channel: u32, id: u32, text: &str) -> MeshPacket {
    MeshPacket {
        from,
        to,
        channel,
        id,
        decoded: Some(Data {
            portnum: port::TEXT_MESSAGE,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Simulated device interface
pub struct MockInterface {
    name: String,
    connected: bool,
    feed_tx: mpsc::UnboundedSender<Feed>,
    feed_rx: mpsc::UnboundedReceiver<Feed>,
    state: Arc<Mutex<DeviceState>>,
}

impl MockInterface {
    /// Create an interface and its test handle
    pub fn new() -> (Self, MockDevice) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(DeviceState {
            sent: Vec::new(),
            answer_config: true,
            answer_metadata: true,
        }));
        let device = MockDevice {
            feed: feed_tx.clone(),
            state: state.clone(),
        };
        let iface = Self {
            name: "mock".to_string(),
            connected: false,
            feed_tx,
            feed_rx,
            state,
        };
        (iface, device)
    }

    fn answer(&self, request: &ToRadio) {
        let state = self.state.lock();
        let mut replies = Vec::new();

        if request.want_config_id != 0 && state.answer_config {
            replies.push(FromRadio {
                my_info: Some(MyNodeInfo {
                    my_node_num: MOCK_NODE_NUM,
                }),
                ..Default::default()
            });
            for (num, long, short) in [
                (MOCK_NODE_NUM, "Relay Node", "RLY"),
                (MOCK_PEER_NUM, "Alice Node", "ALI"),
            ] {
                replies.push(FromRadio {
                    node_info: Some(NodeInfo {
                        num,
                        user: Some(User {
                            id: meshrelay_core::radio_node_id(num),
                            long_name: long.into(),
                            short_name: short.into(),
                        }),
                    }),
                    ..Default::default()
                });
            }
            replies.push(FromRadio {
                config_complete_id: request.want_config_id,
                ..Default::default()
            });
        }

        let metadata_request = request
            .packet
            .as_ref()
            .and_then(|p| p.decoded.as_ref())
            .filter(|d| d.portnum == port::ADMIN)
            .and_then(|d| AdminMessage::decode(d.payload.as_slice()).ok())
            .map_or(false, |admin| admin.get_device_metadata_request);
        if metadata_request && state.answer_metadata {
            replies.push(FromRadio {
                metadata: Some(DeviceMetadata {
                    firmware_version: MOCK_FIRMWARE.into(),
                }),
                ..Default::default()
            });
        }

        for reply in replies {
            let _ = self.feed_tx.send(Feed::Frame(reply.encode_to_vec().into()));
        }
    }
}

#[async_trait]
impl MeshtasticInterface for MockInterface {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Err(MeshtasticError::AlreadyClosed);
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_packet(&mut self) -> Result<Option<Bytes>> {
        match self.feed_rx.recv().await {
            Some(Feed::Frame(frame)) => Ok(Some(frame)),
            Some(Feed::Fail(reason)) => {
                self.connected = false;
                Err(MeshtasticError::ReadError(reason))
            }
            None => std::future::pending().await,
        }
    }

    async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(MeshtasticError::NotConnected);
        }
        let request = ToRadio::decode(packet)?;
        self.answer(&request);
        self.state.lock().sent.push(request);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Scripted [`RadioLink`]
pub struct MockLink {
    sink: RadioEventSink,
    name: String,
    address: String,
    connected: AtomicBool,
    script: Arc<ConnectScript>,
    close_calls: AtomicUsize,
    healthy: AtomicBool,
    next_id: AtomicU32,
    sent: Mutex<Vec<OutboundText>>,
    nodes: Mutex<HashMap<u32, NodeUser>>,
}

impl MockLink {
    /// Link with its own script
    pub fn new(sink: RadioEventSink, address: &str) -> Self {
        Self::with_script(sink, address, Arc::new(ConnectScript::default()))
    }

    fn with_script(sink: RadioEventSink, address: &str, script: Arc<ConnectScript>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            MOCK_PEER_NUM,
            NodeUser {
                id: meshrelay_core::radio_node_id(MOCK_PEER_NUM),
                long_name: "Alice Node".into(),
                short_name: "ALI".into(),
            },
        );
        Self {
            name: format!("mock:{address}"),
            address: address.to_string(),
            sink,
            connected: AtomicBool::new(false),
            script,
            close_calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            next_id: AtomicU32::new(1000),
            sent: Mutex::new(Vec::new()),
            nodes: Mutex::new(nodes),
        }
    }

    /// Address this link was built for
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Simulate the library reporting a lost connection
    pub fn lose(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.sink.connection_lost(reason);
    }

    /// Deliver a text packet through the sink
    pub fn push_text(&self, from: u32, channel: u32, id: u32, text: &str) {
        self.sink.packet(text_packet(from, BROADCAST, channel, id, text));
    }

    /// Deliver any packet through the sink
    pub fn push_packet(&self, packet: MeshPacket) {
        self.sink.packet(packet);
    }

    /// Make health probes fail
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of close calls
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Texts sent through this link
    pub fn sent(&self) -> Vec<OutboundText> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl RadioLink for MockLink {
    fn link_id(&self) -> LinkId {
        self.sink.link_id()
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        self.script.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.next_failure() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshtasticError::AlreadyClosed)
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, message: &OutboundText) -> Result<u32> {
        if !self.is_connected() {
            return Err(MeshtasticError::NotConnected);
        }
        self.sent.lock().push(message.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn device_metadata(&self, _timeout: Duration) -> Result<DeviceMetadata> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(DeviceMetadata {
                firmware_version: MOCK_FIRMWARE.into(),
            })
        } else {
            Err(MeshtasticError::NoResponse("device metadata"))
        }
    }

    async fn my_node_info(&self, _timeout: Duration) -> Result<MyNodeInfo> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(MyNodeInfo {
                my_node_num: MOCK_NODE_NUM,
            })
        } else {
            Err(MeshtasticError::NoResponse("node info"))
        }
    }

    fn lookup_node(&self, num: u32) -> Option<NodeUser> {
        self.nodes.lock().get(&num).cloned()
    }

    fn my_node_num(&self) -> Option<u32> {
        self.is_connected().then_some(MOCK_NODE_NUM)
    }
}

/// Connect outcomes shared by every link a [`MockConnector`] builds
#[derive(Default)]
pub struct ConnectScript {
    failures: Mutex<VecDeque<fn() -> MeshtasticError>>,
    always: Mutex<Option<fn() -> MeshtasticError>>,
    attempts: AtomicUsize,
}

impl ConnectScript {
    fn next_failure(&self) -> Option<MeshtasticError> {
        if let Some(make) = self.failures.lock().pop_front() {
            return Some(make());
        }
        (*self.always.lock()).map(|make| make())
    }
}

/// [`RadioConnector`] producing [`MockLink`]s
pub struct MockConnector {
    script: Arc<ConnectScript>,
    links: Mutex<Vec<Arc<MockLink>>>,
    ports_present: AtomicBool,
    stale_cleared: Mutex<Vec<String>>,
}

impl MockConnector {
    /// Connector whose links connect on the first try
    pub fn new() -> Self {
        Self {
            script: Arc::new(ConnectScript::default()),
            links: Mutex::new(Vec::new()),
            ports_present: AtomicBool::new(true),
            stale_cleared: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next connect attempt with the given error
    pub fn fail_next(&self, make: fn() -> MeshtasticError) {
        self.script.failures.lock().push_back(make);
    }

    /// Fail every connect attempt after the scripted ones
    pub fn fail_always(&self, make: fn() -> MeshtasticError) {
        *self.script.always.lock() = Some(make);
    }

    /// Let connect attempts succeed again
    pub fn heal(&self) {
        *self.script.always.lock() = None;
        self.script.failures.lock().clear();
    }

    /// Whether serial ports appear to exist
    pub fn set_ports_present(&self, present: bool) {
        self.ports_present.store(present, Ordering::SeqCst);
    }

    /// Connect attempts across all links
    pub fn connect_attempts(&self) -> usize {
        self.script.attempts.load(Ordering::SeqCst)
    }

    /// Number of links built
    pub fn creations(&self) -> usize {
        self.links.lock().len()
    }

    /// Every link built, oldest first
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    /// Most recently built link
    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        self.links.lock().last().cloned()
    }

    /// Addresses passed to stale-session cleanup
    pub fn stale_cleared(&self) -> Vec<String> {
        self.stale_cleared.lock().clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioConnector for MockConnector {
    fn create(
        &self,
        target: &LinkTarget,
        sink: RadioEventSink,
        _timeout: Duration,
    ) -> Result<Arc<dyn RadioLink>> {
        let link = Arc::new(MockLink::with_script(
            sink,
            &target.address(),
            self.script.clone(),
        ));
        self.links.lock().push(link.clone());
        Ok(link)
    }

    fn port_exists(&self, _path: &Path) -> bool {
        self.ports_present.load(Ordering::SeqCst)
    }

    async fn clear_stale_ble(&self, address: &str) -> Result<bool> {
        self.stale_cleared.lock().push(address.to_string());
        Ok(false)
    }
}
