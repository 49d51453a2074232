//! Radio sessions
//!
//! A [`RadioLink`] is one session with a device. [`FramedLink`] implements it
//! over any [`MeshtasticInterface`]: an I/O task owns the interface, reads
//! `FromRadio` envelopes and executes write commands, mirroring the event loop
//! of a device client library. Inbound packets and connection loss leave the
//! task through a non-blocking [`RadioEventSink`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use meshrelay_core::{radio_node_id, NodeUser, OutboundText};

use crate::config::{BROADCAST, DEFAULT_HOP_LIMIT, TEXT_PAYLOAD_LIMIT};
use crate::error::{MeshtasticError, Result};
use crate::interface::MeshtasticInterface;
use crate::proto::{port, AdminMessage, Data, DeviceMetadata, FromRadio, MeshPacket, MyNodeInfo, ToRadio, User};

/// Identifies one link instance for the lifetime of the process
pub type LinkId = u64;

/// Event emitted by a link's I/O task
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A packet arrived
    Packet {
        /// Emitting link
        link_id: LinkId,
        /// The packet
        packet: MeshPacket,
    },
    /// The link died
    ConnectionLost {
        /// Emitting link
        link_id: LinkId,
        /// What ended it
        source: String,
    },
}

/// Non-blocking event outlet handed to a link
#[derive(Debug, Clone)]
pub struct RadioEventSink {
    link_id: LinkId,
    tx: mpsc::Sender<RadioEvent>,
}

impl RadioEventSink {
    /// Sink tagging events with `link_id`
    pub fn new(link_id: LinkId, tx: mpsc::Sender<RadioEvent>) -> Self {
        Self { link_id, tx }
    }

    /// Link id this sink tags events with
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Forward a packet; dropped with a warning when the pump is behind
    pub fn packet(&self, packet: MeshPacket) {
        let event = RadioEvent::Packet {
            link_id: self.link_id,
            packet,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(link_id = self.link_id, "Radio event queue full, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(link_id = self.link_id, "Radio event queue closed");
            }
        }
    }

    /// Report connection loss; never dropped for a full queue
    pub fn connection_lost(&self, source: impl Into<String>) {
        let event = RadioEvent::ConnectionLost {
            link_id: self.link_id,
            source: source.into(),
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

/// One session with a radio device
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Process-unique id
    fn link_id(&self) -> LinkId;

    /// Name for logging
    fn name(&self) -> &str;

    /// Open the session and load the node database
    async fn connect(&self) -> Result<()>;

    /// Close the session; [`MeshtasticError::AlreadyClosed`] when not open
    async fn close(&self) -> Result<()>;

    /// Whether the session is live
    fn is_connected(&self) -> bool;

    /// Transmit a text packet; returns its packet id
    async fn send_text(&self, message: &OutboundText) -> Result<u32>;

    /// Ask the local device for its metadata
    async fn device_metadata(&self, timeout: Duration) -> Result<DeviceMetadata>;

    /// Re-read the local node identity through a config round trip
    async fn my_node_info(&self, timeout: Duration) -> Result<MyNodeInfo>;

    /// Node database lookup
    fn lookup_node(&self, num: u32) -> Option<NodeUser>;

    /// Local node number, once learned
    fn my_node_num(&self) -> Option<u32>;
}

enum LinkCommand {
    Write {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Metadata,
    ConfigComplete(u32),
}

enum Reply {
    Metadata(DeviceMetadata),
    ConfigComplete,
}

struct Waiter {
    kind: WaitKind,
    tx: oneshot::Sender<Reply>,
}

/// State shared between a link and its I/O task
struct LinkShared {
    link_id: LinkId,
    connected: AtomicBool,
    nodes: RwLock<HashMap<u32, NodeUser>>,
    my_node_num: RwLock<Option<u32>>,
    waiters: Mutex<Vec<Waiter>>,
}

impl LinkShared {
    fn register(&self, kind: WaitKind) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        waiters.retain(|w| !w.tx.is_closed());
        waiters.push(Waiter { kind, tx });
        rx
    }

    fn resolve(&self, kind: WaitKind, reply: impl Fn() -> Reply) {
        let mut waiters = self.waiters.lock();
        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].kind == kind {
                let waiter = waiters.swap_remove(i);
                let _ = waiter.tx.send(reply());
            } else {
                i += 1;
            }
        }
    }

    fn learn_user(&self, num: u32, user: User) {
        let id = if user.id.is_empty() {
            radio_node_id(num)
        } else {
            user.id
        };
        trace!(node = %id, long_name = %user.long_name, "Node database updated");
        self.nodes.write().insert(
            num,
            NodeUser {
                id,
                long_name: user.long_name,
                short_name: user.short_name,
            },
        );
    }

    fn handle_frame(&self, frame: &[u8], sink: &RadioEventSink) {
        let msg = match decode_frame(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(link_id = self.link_id, error = %e, code = e.error_code(), "Dropping undecodable frame");
                return;
            }
        };

        if let Some(info) = msg.my_info {
            debug!(link_id = self.link_id, node = %radio_node_id(info.my_node_num), "Learned local node");
            *self.my_node_num.write() = Some(info.my_node_num);
        }
        if let Some(node) = msg.node_info {
            if let Some(user) = node.user {
                self.learn_user(node.num, user);
            }
        }
        if let Some(metadata) = msg.metadata {
            self.resolve(WaitKind::Metadata, || Reply::Metadata(metadata.clone()));
        }
        if msg.config_complete_id != 0 {
            self.resolve(WaitKind::ConfigComplete(msg.config_complete_id), || {
                Reply::ConfigComplete
            });
        }

        let Some(packet) = msg.packet else {
            return;
        };

        match packet.portnum() {
            port::ADMIN => {
                let payload = packet.decoded.as_ref().map(|d| d.payload.as_slice()).unwrap_or_default();
                match AdminMessage::decode(payload) {
                    Ok(admin) => {
                        if let Some(metadata) = admin.get_device_metadata_response {
                            self.resolve(WaitKind::Metadata, || Reply::Metadata(metadata.clone()));
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring undecodable admin payload"),
                }
                return;
            }
            port::NODEINFO => {
                let payload = packet.decoded.as_ref().map(|d| d.payload.as_slice()).unwrap_or_default();
                if let Ok(user) = User::decode(payload) {
                    self.learn_user(packet.from, user);
                }
            }
            _ => {}
        }

        sink.packet(packet);
    }
}

/// Decode one frame payload from the device
fn decode_frame(frame: &[u8]) -> Result<FromRadio> {
    Ok(FromRadio::decode(frame)?)
}

async fn run_io<I: MeshtasticInterface>(
    mut iface: I,
    mut commands: mpsc::Receiver<LinkCommand>,
    shared: Arc<LinkShared>,
    sink: RadioEventSink,
) -> I {
    let link_id = shared.link_id;
    debug!(link_id, interface = iface.name(), "Radio I/O task started");

    loop {
        tokio::select! {
            read = iface.read_packet() => match read {
                Ok(Some(frame)) => shared.handle_frame(&frame, &sink),
                Ok(None) => {}
                Err(e) if e.is_protocol_error() => {
                    warn!(link_id, error = %e, "Dropping malformed frame");
                }
                Err(e) => {
                    warn!(link_id, error = %e, code = e.error_code(), "Radio connection lost");
                    shared.connected.store(false, Ordering::SeqCst);
                    sink.connection_lost(e.to_string());
                    break;
                }
            },

            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Write { payload, reply }) => {
                    let result = iface.write_packet(&payload).await;
                    let _ = reply.send(result);
                }
                Some(LinkCommand::Shutdown) | None => {
                    let bye = ToRadio {
                        disconnect: true,
                        ..Default::default()
                    };
                    if let Err(e) = iface.write_packet(&bye.encode_to_vec()).await {
                        trace!(link_id, error = %e, "Disconnect notice not delivered");
                    }
                    break;
                }
            },
        }
    }

    debug!(link_id, "Radio I/O task stopped");
    iface
}

struct IoHandle<I> {
    commands: mpsc::Sender<LinkCommand>,
    task: JoinHandle<I>,
}

/// [`RadioLink`] over a byte-level interface
pub struct FramedLink<I: MeshtasticInterface + 'static> {
    name: String,
    interface: tokio::sync::Mutex<Option<I>>,
    io: Mutex<Option<IoHandle<I>>>,
    shared: Arc<LinkShared>,
    sink: RadioEventSink,
    next_packet_id: AtomicU32,
    connect_timeout: Duration,
}

impl<I: MeshtasticInterface + 'static> FramedLink<I> {
    /// Wrap an unconnected interface
    pub fn new(interface: I, sink: RadioEventSink, connect_timeout: Duration) -> Self {
        let link_id = sink.link_id();
        Self {
            name: interface.name().to_string(),
            interface: tokio::sync::Mutex::new(Some(interface)),
            io: Mutex::new(None),
            shared: Arc::new(LinkShared {
                link_id,
                connected: AtomicBool::new(false),
                nodes: RwLock::new(HashMap::new()),
                my_node_num: RwLock::new(None),
                waiters: Mutex::new(Vec::new()),
            }),
            sink,
            next_packet_id: AtomicU32::new(rand::random::<u32>() | 1),
            connect_timeout,
        }
    }

    fn next_packet_id(&self) -> u32 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Stop the I/O task and take the interface back
    async fn reclaim(&self, slot: &mut Option<I>) -> Result<()> {
        let handle = self.io.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        self.shared.connected.store(false, Ordering::SeqCst);

        let _ = handle.commands.send(LinkCommand::Shutdown).await;
        let iface = handle
            .task
            .await
            .map_err(|e| MeshtasticError::ReadError(format!("I/O task failed: {e}")))?;
        *slot = Some(iface);
        Ok(())
    }

    async fn write(&self, payload: Vec<u8>) -> Result<()> {
        let commands = self
            .io
            .lock()
            .as_ref()
            .map(|h| h.commands.clone())
            .ok_or(MeshtasticError::NotConnected)?;

        let (reply, rx) = oneshot::channel();
        commands
            .send(LinkCommand::Write { payload, reply })
            .await
            .map_err(|_| MeshtasticError::NotConnected)?;
        rx.await.map_err(|_| MeshtasticError::NotConnected)?
    }

    async fn config_round_trip(&self, timeout: Duration) -> Result<()> {
        let nonce = rand::random::<u32>().max(1);
        let done = self.shared.register(WaitKind::ConfigComplete(nonce));
        let want = ToRadio {
            want_config_id: nonce,
            ..Default::default()
        };
        self.write(want.encode_to_vec()).await?;

        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MeshtasticError::ChannelClosed),
            Err(_) => Err(MeshtasticError::NoResponse("config")),
        }
    }
}

#[async_trait]
impl<I: MeshtasticInterface + 'static> RadioLink for FramedLink<I> {
    fn link_id(&self) -> LinkId {
        self.shared.link_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.interface.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.reclaim(&mut slot).await?;

        let mut iface = slot
            .take()
            .ok_or_else(|| MeshtasticError::InvalidConfig(format!("{} has no interface", self.name)))?;

        let opened = tokio::time::timeout(self.connect_timeout, iface.connect()).await;
        match opened {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                *slot = Some(iface);
                return Err(e);
            }
            Err(_) => {
                *slot = Some(iface);
                return Err(MeshtasticError::ConnectionTimeout {
                    duration_ms: self.connect_timeout.as_millis() as u64,
                });
            }
        }

        let (commands, rx) = mpsc::channel(32);
        self.shared.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(run_io(iface, rx, self.shared.clone(), self.sink.clone()));
        *self.io.lock() = Some(IoHandle { commands, task });

        if let Err(e) = self.config_round_trip(self.connect_timeout).await {
            warn!(link = %self.name, error = %e, "Device did not deliver its configuration");
            if let Err(close_err) = self.reclaim(&mut slot).await {
                debug!(error = %close_err, "Failed to stop I/O task");
            }
            if let Some(iface) = slot.as_mut() {
                let _ = iface.disconnect().await;
            }
            return Err(match e {
                MeshtasticError::NoResponse(_) => MeshtasticError::ConnectionTimeout {
                    duration_ms: self.connect_timeout.as_millis() as u64,
                },
                other => other,
            });
        }

        info!(
            link = %self.name,
            node = ?self.my_node_num().map(radio_node_id),
            nodes = self.shared.nodes.read().len(),
            "Radio session established"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.interface.lock().await;
        if self.io.lock().is_none() {
            return Err(MeshtasticError::AlreadyClosed);
        }
        self.reclaim(&mut slot).await?;

        match slot.as_mut() {
            Some(iface) => match iface.disconnect().await {
                Err(e) if !e.is_already_closed() => Err(e),
                _ => {
                    info!(link = %self.name, "Radio session closed");
                    Ok(())
                }
            },
            None => Err(MeshtasticError::AlreadyClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, message: &OutboundText) -> Result<u32> {
        if !self.is_connected() {
            return Err(MeshtasticError::NotConnected);
        }
        if message.text.len() > TEXT_PAYLOAD_LIMIT {
            return Err(MeshtasticError::MessageTooLarge {
                size: message.text.len(),
                max: TEXT_PAYLOAD_LIMIT,
            });
        }

        let id = self.next_packet_id();
        let packet = MeshPacket {
            to: message.destination,
            channel: message.channel,
            decoded: Some(Data {
                portnum: port::TEXT_MESSAGE,
                payload: message.text.as_bytes().to_vec(),
                reply_id: message.reply_id.unwrap_or(0),
                emoji: u32::from(message.emoji),
                ..Default::default()
            }),
            id,
            hop_limit: DEFAULT_HOP_LIMIT,
            want_ack: message.destination != BROADCAST,
            ..Default::default()
        };
        let envelope = ToRadio {
            packet: Some(packet),
            ..Default::default()
        };

        self.write(envelope.encode_to_vec()).await?;
        debug!(link = %self.name, packet_id = id, channel = message.channel, "Text packet queued");
        Ok(id)
    }

    async fn device_metadata(&self, timeout: Duration) -> Result<DeviceMetadata> {
        let me = self.my_node_num().ok_or(MeshtasticError::NotConnected)?;
        let answer = self.shared.register(WaitKind::Metadata);

        let request = AdminMessage {
            get_device_metadata_request: true,
            ..Default::default()
        };
        let packet = MeshPacket {
            to: me,
            decoded: Some(Data {
                portnum: port::ADMIN,
                payload: request.encode_to_vec(),
                want_response: true,
                ..Default::default()
            }),
            id: self.next_packet_id(),
            hop_limit: 0,
            want_ack: true,
            ..Default::default()
        };
        let envelope = ToRadio {
            packet: Some(packet),
            ..Default::default()
        };
        self.write(envelope.encode_to_vec()).await?;

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(Reply::Metadata(metadata))) => Ok(metadata),
            Ok(Ok(Reply::ConfigComplete)) | Ok(Err(_)) => Err(MeshtasticError::ChannelClosed),
            Err(_) => Err(MeshtasticError::NoResponse("device metadata")),
        }
    }

    async fn my_node_info(&self, timeout: Duration) -> Result<MyNodeInfo> {
        self.config_round_trip(timeout).await?;
        self.my_node_num()
            .map(|my_node_num| MyNodeInfo { my_node_num })
            .ok_or(MeshtasticError::NoResponse("node info"))
    }

    fn lookup_node(&self, num: u32) -> Option<NodeUser> {
        self.shared.nodes.read().get(&num).cloned()
    }

    fn my_node_num(&self) -> Option<u32> {
        *self.shared.my_node_num.read()
    }
}
