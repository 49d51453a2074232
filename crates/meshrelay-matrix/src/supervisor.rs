//! Chat session supervisor
//!
//! Logs in with the configured token, joins every bound room and then keeps
//! an incremental `/sync` loop running. History that predates startup is
//! skipped by an initial zero-timeout sync. Failed syncs back off with the
//! same doubling schedule the radio side uses; a rejected token ends the
//! loop.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use meshrelay_core::{
    ChannelBinding, ChatPort, ConnectionStatus, OutboundChat, ReconnectBackoff, RelayConfig,
    RelayUnit,
};

use crate::client::{MatrixApi, MatrixClient};
use crate::error::{MatrixError, Result};
use crate::sync::{message_content, SyncResponse};

/// Capacity of the inbound unit channel
pub const INBOUND_CAPACITY: usize = 256;

/// Cap of the sync retry delay
const SYNC_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Supervisor of the chat side
pub struct ChatSupervisor<A: MatrixApi = MatrixClient> {
    config: Arc<RelayConfig>,
    api: A,
    user_id: RwLock<Option<String>>,
    /// Configured room id or alias → joined room id
    joined: RwLock<HashMap<String, String>>,
    status: Mutex<ConnectionStatus>,
    since: Mutex<Option<String>>,
    syncing: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    inbound_tx: mpsc::Sender<RelayUnit>,
    inbound_rx: Mutex<Option<mpsc::Receiver<RelayUnit>>>,
    backoff: Mutex<ReconnectBackoff>,
}

impl ChatSupervisor<MatrixClient> {
    /// Supervisor talking to the configured homeserver
    pub fn new(config: Arc<RelayConfig>) -> Result<Arc<Self>> {
        let api = MatrixClient::new(&config.chat.homeserver, config.chat.access_token.clone())?;
        Ok(Self::with_api(config, api))
    }
}

impl<A: MatrixApi> ChatSupervisor<A> {
    /// Supervisor over any [`MatrixApi`]
    pub fn with_api(config: Arc<RelayConfig>, api: A) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let floor = config.radio.reconnect_floor.min(SYNC_BACKOFF_CAP);

        Arc::new(Self {
            user_id: RwLock::new(config.chat.user_id.clone()),
            config,
            api,
            joined: RwLock::new(HashMap::new()),
            status: Mutex::new(ConnectionStatus::Idle),
            since: Mutex::new(None),
            syncing: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            backoff: Mutex::new(ReconnectBackoff::with_cap(floor, SYNC_BACKOFF_CAP)),
        })
    }

    /// Underlying API client
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Current session status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Receiver of normalised inbound units; `None` after the first call
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<RelayUnit>> {
        self.inbound_rx.lock().take()
    }

    /// Room bindings with aliases replaced by joined room ids
    ///
    /// Rooms that could not be joined are left out.
    pub fn bindings(&self) -> Vec<ChannelBinding> {
        let joined = self.joined.read();
        self.config
            .rooms
            .iter()
            .filter_map(|binding| {
                joined.get(&binding.id).map(|room_id| ChannelBinding {
                    id: room_id.clone(),
                    radio_channel: binding.radio_channel,
                })
            })
            .collect()
    }

    fn joined_room_ids(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.joined.read().values().cloned().collect();
        rooms.sort();
        rooms.dedup();
        rooms
    }

    fn resolve_room(&self, room: &str) -> String {
        self.joined
            .read()
            .get(room)
            .cloned()
            .unwrap_or_else(|| room.to_string())
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_shutting_down(),
            _ = shutdown_signal(&mut shutdown) => false,
        }
    }

    /// Log in, join bound rooms and skip past existing history
    ///
    /// Transient homeserver failures are retried; a rejected token or an
    /// invalid URL is returned immediately.
    pub async fn start(&self) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting);
        loop {
            if self.is_shutting_down() {
                return Err(MatrixError::ShuttingDown);
            }
            match self.establish().await {
                Ok(()) => {
                    self.backoff.lock().reset();
                    self.set_status(ConnectionStatus::Connected);
                    return Ok(());
                }
                Err(e) if e.is_retriable() => {
                    let delay = self.backoff.lock().next_delay();
                    warn!(error = %e, retry_in = ?delay, "Homeserver unavailable");
                    if !self.wait_or_shutdown(delay).await {
                        return Err(MatrixError::ShuttingDown);
                    }
                }
                Err(e) => {
                    error!(error = %e, code = e.error_code(), "Chat login failed");
                    self.set_status(ConnectionStatus::Idle);
                    return Err(e);
                }
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let user_id = self.api.whoami().await?;
        if let Some(configured) = self.config.chat.user_id.as_deref() {
            if configured != user_id {
                warn!(configured, actual = %user_id, "Configured user id does not match token owner");
            }
        }
        info!(user_id = %user_id, homeserver = %self.config.chat.homeserver, "Logged in to homeserver");
        *self.user_id.write() = Some(user_id);

        for binding in &self.config.rooms {
            if self.joined.read().contains_key(&binding.id) {
                continue;
            }
            match self.api.join(&binding.id).await {
                Ok(room_id) => {
                    info!(room = %binding.id, room_id = %room_id, channel = binding.radio_channel, "Joined bound room");
                    self.joined.write().insert(binding.id.clone(), room_id);
                }
                Err(e) if e.is_retriable() => return Err(e),
                Err(e) => error!(room = %binding.id, error = %e, "Could not join room"),
            }
        }
        if self.joined.read().is_empty() {
            warn!("No bound rooms joined, nothing will be relayed");
        }

        if self.since.lock().is_none() {
            let initial = self.api.sync(None, Duration::ZERO).await?;
            debug!(next_batch = %initial.next_batch, "Skipped room history");
            *self.since.lock() = Some(initial.next_batch);
        }
        Ok(())
    }

    /// Start the sync loop once; later calls return `None`
    pub fn spawn_sync_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            this.sync_loop().await;
            this.syncing.store(false, Ordering::SeqCst);
        }))
    }

    async fn sync_loop(&self) {
        let timeout = self.config.chat.sync_timeout;
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if self.is_shutting_down() {
                break;
            }
            let since = self.since.lock().clone();
            let result = tokio::select! {
                _ = shutdown_signal(&mut shutdown) => break,
                result = self.api.sync(since.as_deref(), timeout) => result,
            };

            match result {
                Ok(response) => {
                    if self.status() != ConnectionStatus::Connected {
                        info!("Chat sync resumed");
                        self.set_status(ConnectionStatus::Connected);
                    }
                    self.backoff.lock().reset();
                    self.deliver(&response);
                    *self.since.lock() = Some(response.next_batch);
                }
                Err(e) if e.is_auth_failure() => {
                    error!(error = %e, "Access token rejected, stopping chat sync");
                    self.set_status(ConnectionStatus::Closed);
                    break;
                }
                Err(e) => {
                    let delay = self.backoff.lock().next_delay();
                    warn!(error = %e, code = e.error_code(), retry_in = ?delay, "Chat sync failed");
                    self.set_status(ConnectionStatus::Reconnecting);
                    if !self.wait_or_shutdown(delay).await {
                        break;
                    }
                }
            }
        }
        debug!("Chat sync loop stopped");
    }

    fn deliver(&self, response: &SyncResponse) {
        let rooms = self.joined_room_ids();
        for unit in response.units_for(rooms.iter().map(String::as_str)) {
            match self.inbound_tx.try_send(unit) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(unit)) => {
                    warn!(sender = %unit.sender, "Inbound queue full, dropping chat event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("Inbound queue closed");
                    return;
                }
            }
        }
    }

    /// Send a message to a room (id or bound alias)
    pub async fn send(&self, room: &str, message: &OutboundChat) -> Result<String> {
        if self.is_shutting_down() {
            return Err(MatrixError::ShuttingDown);
        }
        if self.user_id.read().is_none() {
            return Err(MatrixError::NotLoggedIn);
        }
        let room_id = self.resolve_room(room);
        self.api
            .send_event(&room_id, "m.room.message", message_content(message))
            .await
    }

    /// Stop syncing
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down chat supervisor");
        self.shutdown_tx.send_replace(true);
        self.set_status(ConnectionStatus::Closed);
    }
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[async_trait]
impl<A: MatrixApi> ChatPort for ChatSupervisor<A> {
    async fn send_message(&self, room_id: &str, message: OutboundChat) -> meshrelay_core::Result<String> {
        Ok(self.send(room_id, &message).await?)
    }

    async fn display_name(&self, user_id: &str) -> Option<String> {
        match self.api.display_name(user_id).await {
            Ok(name) => name,
            Err(e) => {
                debug!(user_id, error = %e, "Display name lookup failed");
                None
            }
        }
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{message_event, sync_batch, FakeMatrix};

    const CONFIG: &str = r##"
        [radio]
        connection_type = "tcp"
        host = "radio.lan"
        meshnet_name = "Home"
        reconnect_floor = "2s"

        [chat]
        homeserver = "https://matrix.example.org"
        access_token = "token"
        sync_timeout = "30s"

        [[rooms]]
        id = "#mesh:example.org"
        radio_channel = 0

        [[rooms]]
        id = "!second:example.org"
        radio_channel = 1
    "##;

    fn supervisor() -> Arc<ChatSupervisor<Arc<FakeMatrix>>> {
        let config = Arc::new(RelayConfig::from_toml_str(CONFIG).unwrap());
        let api = Arc::new(FakeMatrix::new("@relay:example.org"));
        api.alias("#mesh:example.org", "!mesh:example.org");
        ChatSupervisor::with_api(config, api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_joins_and_resolves_aliases() {
        let chat = supervisor();
        chat.start().await.unwrap();

        assert_eq!(chat.status(), ConnectionStatus::Connected);
        assert_eq!(ChatPort::user_id(chat.as_ref()).as_deref(), Some("@relay:example.org"));
        assert_eq!(
            chat.bindings(),
            vec![
                ChannelBinding { id: "!mesh:example.org".into(), radio_channel: 0 },
                ChannelBinding { id: "!second:example.org".into(), radio_channel: 1 },
            ]
        );
        // Initial sync only, history skipped
        assert_eq!(chat.api().sync_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retries_transient_failures() {
        let chat = supervisor();
        chat.api().fail_whoami(2, 502);
        chat.start().await.unwrap();
        assert_eq!(chat.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_bad_token() {
        let chat = supervisor();
        chat.api().fail_whoami(1, 401);
        let err = chat.start().await.unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(chat.status(), ConnectionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unjoinable_room_is_skipped() {
        let chat = supervisor();
        chat.api().forbid_join("!second:example.org");
        chat.start().await.unwrap();
        assert_eq!(chat.bindings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_delivers_bound_room_events() {
        let chat = supervisor();
        let mut inbound = chat.take_inbound().unwrap();
        chat.start().await.unwrap();

        chat.api().push_sync(Ok(sync_batch(
            "s2",
            &[
                ("!mesh:example.org", message_event("$1", "@alice:example.org", "hi")),
                ("!unbound:example.org", message_event("$2", "@alice:example.org", "no")),
            ],
        )));
        chat.spawn_sync_loop().unwrap();

        let unit = inbound.recv().await.unwrap();
        assert_eq!(unit.text, "hi");
        assert!(inbound.try_recv().is_err());
        chat.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_failure_backs_off_and_recovers() {
        let chat = supervisor();
        let mut inbound = chat.take_inbound().unwrap();
        chat.start().await.unwrap();

        chat.api().push_sync(Err(MatrixError::Api {
            status: 503,
            errcode: "M_UNKNOWN".into(),
            message: "down".into(),
        }));
        chat.api().push_sync(Ok(sync_batch(
            "s3",
            &[("!second:example.org", message_event("$9", "@bob:example.org", "back"))],
        )));
        chat.spawn_sync_loop().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(chat.status(), ConnectionStatus::Reconnecting);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(inbound.recv().await.unwrap().text, "back");
        assert_eq!(chat.status(), ConnectionStatus::Connected);
        chat.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_stops_sync() {
        let chat = supervisor();
        chat.start().await.unwrap();
        chat.api().push_sync(Err(MatrixError::Api {
            status: 401,
            errcode: "M_UNKNOWN_TOKEN".into(),
            message: "gone".into(),
        }));

        let handle = chat.spawn_sync_loop().unwrap();
        handle.await.unwrap();
        assert_eq!(chat.status(), ConnectionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_resolves_alias_and_attaches_reply() {
        let chat = supervisor();
        chat.start().await.unwrap();

        let mut message = OutboundChat::text("ALI[Home]: hello");
        message.reply_to = Some("$orig".into());
        let event_id = ChatPort::send_message(chat.as_ref(), "#mesh:example.org", message)
            .await
            .unwrap();

        let sent = chat.api().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_id, event_id);
        assert_eq!(sent[0].room_id, "!mesh:example.org");
        assert_eq!(sent[0].content["m.relates_to"]["m.in_reply_to"]["event_id"], "$orig");
    }

    #[tokio::test]
    async fn test_send_before_login_fails() {
        let chat = supervisor();
        let err = chat.send("!second:example.org", &OutboundChat::text("x")).await.unwrap_err();
        assert!(matches!(err, MatrixError::NotLoggedIn));
    }

    #[tokio::test]
    async fn test_display_name_errors_read_as_missing() {
        let chat = supervisor();
        chat.api().set_display_name("@alice:example.org", "Alice");
        assert_eq!(
            ChatPort::display_name(chat.as_ref(), "@alice:example.org").await.as_deref(),
            Some("Alice")
        );
        assert_eq!(ChatPort::display_name(chat.as_ref(), "@nobody:example.org").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_sync_loop() {
        let chat = supervisor();
        chat.start().await.unwrap();
        let handle = chat.spawn_sync_loop().unwrap();
        assert!(chat.spawn_sync_loop().is_none());

        chat.shutdown();
        handle.await.unwrap();
        assert_eq!(chat.status(), ConnectionStatus::Closed);
        assert!(matches!(
            chat.send("!second:example.org", &OutboundChat::text("x")).await,
            Err(MatrixError::ShuttingDown)
        ));
    }
}
