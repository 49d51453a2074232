//! Relay service - owns the inbound queues and drives the router
//!
//! [`RelayService::run`] spawns one consumer per side. Each consumer drains
//! every receiver attached to that side, drops units it has already seen and
//! hands the rest to the [`Router`]. A panic inside the router is caught at
//! the consumer boundary so the pipeline stays up.
//!
//! [`RelayHandle`] is the cloneable front door: direct sends, the two inbound
//! registration points, stats and shutdown.

use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use meshrelay_core::{IdentityMetadata, Origin, RelayError, RelayUnit, Result};

use crate::router::{RouteOutcome, Router};

/// Capacity of each inbound queue
pub const INBOUND_CAPACITY: usize = 256;

/// Capacity of the command queue
pub const COMMAND_CAPACITY: usize = 64;

/// Recently seen inbound units remembered for duplicate suppression
pub const SEEN_CAPACITY: usize = 1024;

/// Commands sent to the relay service
#[derive(Debug)]
pub enum RelayCommand {
    /// Broadcast text on a radio channel
    Send {
        text: String,
        channel: u32,
        response: oneshot::Sender<Result<u32>>,
    },
    /// Post a message to a chat room
    Relay {
        room_id: String,
        message: String,
        identity: Option<IdentityMetadata>,
        response: oneshot::Sender<Result<String>>,
    },
    /// Get relay statistics
    GetStats { response: oneshot::Sender<RelayStats> },
    /// Shutdown
    Shutdown,
}

/// Relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Units received from the radio
    pub radio_units: u64,
    /// Units received from chat
    pub chat_units: u64,
    /// Units relayed to the other side
    pub relayed: u64,
    /// Units the router dropped
    pub dropped: u64,
    /// Units consumed by plugins
    pub plugin_handled: u64,
    /// Repeat deliveries suppressed
    pub duplicates: u64,
    /// Router panics caught
    pub panics: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    radio_units: AtomicU64,
    chat_units: AtomicU64,
    relayed: AtomicU64,
    dropped: AtomicU64,
    plugin_handled: AtomicU64,
    duplicates: AtomicU64,
    panics: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: &RouteOutcome) {
        match outcome {
            RouteOutcome::Relayed { .. } => Self::bump(&self.relayed),
            RouteOutcome::Dropped(_) => Self::bump(&self.dropped),
            RouteOutcome::PluginHandled => Self::bump(&self.plugin_handled),
        }
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            radio_units: self.radio_units.load(Ordering::Relaxed),
            chat_units: self.chat_units.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            plugin_handled: self.plugin_handled.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// Remembers recent inbound units by identity
///
/// Mesh rebroadcasts and sync retries can deliver the same packet or event
/// more than once.
struct SeenCache {
    seen: Mutex<LruCache<String, ()>>,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(cap)),
        }
    }

    /// True the first time a unit is offered
    ///
    /// Radio packets without an id (0) cannot be told apart and always pass.
    fn first_sighting(&self, unit: &RelayUnit) -> bool {
        let key = match &unit.origin {
            Origin::Radio { packet_id: 0, .. } => return true,
            Origin::Radio {
                packet_id, from, ..
            } => format!("radio:{from}:{packet_id}"),
            Origin::Chat { event_id, .. } => format!("chat:{event_id}"),
        };
        self.seen.lock().put(key, ()).is_none()
    }
}

/// Handle for interacting with the relay service
#[derive(Clone)]
pub struct RelayHandle {
    command_tx: mpsc::Sender<RelayCommand>,
    radio_tx: mpsc::Sender<RelayUnit>,
    chat_tx: mpsc::Sender<RelayUnit>,
}

impl RelayHandle {
    /// Broadcast text on a radio channel; returns the packet id
    pub async fn send(&self, text: impl Into<String>, channel: u32) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RelayCommand::Send {
                text: text.into(),
                channel,
                response: tx,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;
        rx.await.map_err(|_| RelayError::ChannelClosed)?
    }

    /// Post a message to a chat room; returns the event id
    pub async fn relay(
        &self,
        room_id: impl Into<String>,
        message: impl Into<String>,
        identity: Option<IdentityMetadata>,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RelayCommand::Relay {
                room_id: room_id.into(),
                message: message.into(),
                identity,
                response: tx,
            })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;
        rx.await.map_err(|_| RelayError::ChannelClosed)?
    }

    /// Queue a normalised radio packet; false when it was dropped
    pub fn on_inbound_radio_packet(&self, unit: RelayUnit) -> bool {
        enqueue(&self.radio_tx, unit, "radio")
    }

    /// Queue a normalised chat event; false when it was dropped
    pub fn on_inbound_chat_event(&self, unit: RelayUnit) -> bool {
        enqueue(&self.chat_tx, unit, "chat")
    }

    /// Get relay statistics
    pub async fn stats(&self) -> Result<RelayStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RelayCommand::GetStats { response: tx })
            .await
            .map_err(|_| RelayError::ChannelClosed)?;
        rx.await.map_err(|_| RelayError::ChannelClosed)
    }

    /// Stop the service and its consumers
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(RelayCommand::Shutdown)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }
}

fn enqueue(tx: &mpsc::Sender<RelayUnit>, unit: RelayUnit, side: &'static str) -> bool {
    match tx.try_send(unit) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(unit)) => {
            warn!(side, sender = %unit.sender, "Inbound queue full, dropping message");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(side, "Inbound queue closed");
            false
        }
    }
}

/// Owns the inbound queues and the router
pub struct RelayService {
    router: Arc<Router>,
    command_rx: mpsc::Receiver<RelayCommand>,
    radio_rx: Vec<mpsc::Receiver<RelayUnit>>,
    chat_rx: Vec<mpsc::Receiver<RelayUnit>>,
    stats: Arc<StatsCounters>,
}

impl RelayService {
    /// Create the service and its handle
    pub fn new(router: Router) -> (Self, RelayHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (radio_tx, radio_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (chat_tx, chat_rx) = mpsc::channel(INBOUND_CAPACITY);

        let handle = RelayHandle {
            command_tx,
            radio_tx,
            chat_tx,
        };
        let service = Self {
            router: Arc::new(router),
            command_rx,
            radio_rx: vec![radio_rx],
            chat_rx: vec![chat_rx],
            stats: Arc::new(StatsCounters::default()),
        };
        (service, handle)
    }

    /// Also consume radio units from a supervisor queue
    pub fn attach_radio(&mut self, rx: mpsc::Receiver<RelayUnit>) {
        self.radio_rx.push(rx);
    }

    /// Also consume chat units from a supervisor queue
    pub fn attach_chat(&mut self, rx: mpsc::Receiver<RelayUnit>) {
        self.chat_rx.push(rx);
    }

    /// The router units are dispatched to
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(self) -> Result<()> {
        let RelayService {
            router,
            mut command_rx,
            radio_rx,
            chat_rx,
            stats,
        } = self;
        info!(
            bindings = router.bindings().len(),
            radio_queues = radio_rx.len(),
            chat_queues = chat_rx.len(),
            "Starting relay service"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let seen = Arc::new(SeenCache::new(SEEN_CAPACITY));
        let consumers = [
            tokio::spawn(consume(
                "radio",
                merge(radio_rx),
                Arc::clone(&router),
                Arc::clone(&stats),
                Arc::clone(&seen),
                shutdown_rx.clone(),
            )),
            tokio::spawn(consume(
                "chat",
                merge(chat_rx),
                Arc::clone(&router),
                Arc::clone(&stats),
                seen,
                shutdown_rx,
            )),
        ];

        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                RelayCommand::Send {
                    text,
                    channel,
                    response,
                } => {
                    let router = Arc::clone(&router);
                    tokio::spawn(async move {
                        let _ = response.send(router.send(&text, channel).await);
                    });
                }
                RelayCommand::Relay {
                    room_id,
                    message,
                    identity,
                    response,
                } => {
                    let router = Arc::clone(&router);
                    tokio::spawn(async move {
                        let _ = response.send(router.relay(&room_id, &message, identity).await);
                    });
                }
                RelayCommand::GetStats { response } => {
                    let _ = response.send(stats.snapshot());
                }
                RelayCommand::Shutdown => break,
            }
        }

        info!("Shutting down relay service");
        shutdown_tx.send_replace(true);
        for consumer in consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "Inbound consumer ended abnormally");
            }
        }
        Ok(())
    }
}

/// Fold several receivers into one stream
fn merge(receivers: Vec<mpsc::Receiver<RelayUnit>>) -> BoxStream<'static, RelayUnit> {
    stream::select_all(receivers.into_iter().map(|rx| {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|unit| (unit, rx)) }).boxed()
    }))
    .boxed()
}

async fn consume(
    side: &'static str,
    mut inbound: BoxStream<'static, RelayUnit>,
    router: Arc<Router>,
    stats: Arc<StatsCounters>,
    seen: Arc<SeenCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let unit = tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            next = inbound.next() => match next {
                Some(unit) => unit,
                None => break,
            },
        };

        if unit.is_radio() {
            StatsCounters::bump(&stats.radio_units);
        } else {
            StatsCounters::bump(&stats.chat_units);
        }
        if !seen.first_sighting(&unit) {
            StatsCounters::bump(&stats.duplicates);
            debug!(side, sender = %unit.sender, "Duplicate delivery ignored");
            continue;
        }

        match AssertUnwindSafe(router.handle(unit)).catch_unwind().await {
            Ok(outcome) => stats.record(&outcome),
            Err(_) => {
                StatsCounters::bump(&stats.panics);
                error!(side, "Router panicked while handling a message");
            }
        }
    }
    debug!(side, "Inbound consumer stopped");
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
