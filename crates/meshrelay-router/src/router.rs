//! Relay decisions between the mesh and chat rooms
//!
//! [`Router::handle`] classifies one inbound unit, applies the channel/room
//! bindings and interaction policy, consults the identity store for replies
//! and reactions, and schedules the outbound sends on the [`AsyncBridge`].
//! The decision is returned as a [`RouteOutcome`]; the sends themselves
//! complete in the background.
//!
//! Replies and reactions whose target has no stored mapping are dropped
//! quietly. Relayed reactions are never stored, so a reaction to a reaction
//! can never find a target and chains stop after one hop.

use std::sync::Arc;
use tracing::{debug, info, warn};

use meshrelay_core::{
    AsyncBridge, ChannelBinding, ChatMsgType, ChatPort, IdentityMetadata, LinkId, Linkage,
    MessageMapping, NodeUser, Origin, OutboundChat, OutboundText, RadioPort, RelayConfig,
    RelayError, RelayUnit, Result, UnitKind, BROADCAST_ADDR,
};
use meshrelay_state::MessageIdentityStore;

use crate::format;
use crate::names::NameCache;
use crate::plugin::{offer, NoPlugins, PluginHost};

/// Where a relayed message went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    /// Chat room id
    Room(String),
    /// Radio channel index
    Channel(u32),
}

/// Why a unit was not relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Radio channel bound to no room
    UnboundChannel,
    /// Chat room bound to no channel
    UnboundRoom,
    /// Reply/reaction target not in the identity store
    MappingMissing,
    /// Radio message not addressed to everyone
    DirectMessage,
    /// Chat event carrying this meshnet's own radio identity
    Loopback,
    /// Chat event sent by the relay account itself
    OwnMessage,
    /// Chat→radio relaying disabled
    BroadcastDisabled,
    /// Radio packet on a non-text port
    NonText,
    /// Reply/reaction bridging disabled for this kind
    InteractionDisabled,
    /// Nothing to relay
    Empty,
}

impl DropReason {
    /// Label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnboundChannel => "unbound_channel",
            DropReason::UnboundRoom => "unbound_room",
            DropReason::MappingMissing => "mapping_missing",
            DropReason::DirectMessage => "direct_message",
            DropReason::Loopback => "loopback",
            DropReason::OwnMessage => "own_message",
            DropReason::BroadcastDisabled => "broadcast_disabled",
            DropReason::NonText => "non_text",
            DropReason::InteractionDisabled => "interaction_disabled",
            DropReason::Empty => "empty",
        }
    }
}

/// Decision taken for one inbound unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sends were scheduled
    Relayed {
        /// Destinations, one per send
        targets: Vec<RelayTarget>,
    },
    /// Nothing was sent
    Dropped(DropReason),
    /// A plugin consumed the message
    PluginHandled,
}

impl RouteOutcome {
    fn relayed(targets: Vec<RelayTarget>) -> Self {
        RouteOutcome::Relayed { targets }
    }
}

/// Chat event waiting for the radio packet id of its relayed copy
struct PendingChatMapping {
    event_id: String,
    room_id: String,
    text: String,
}

/// Routes inbound units to the other side
pub struct Router {
    config: Arc<RelayConfig>,
    bindings: Vec<ChannelBinding>,
    radio: Arc<dyn RadioPort>,
    chat: Arc<dyn ChatPort>,
    store: MessageIdentityStore,
    plugins: Arc<dyn PluginHost>,
    names: NameCache,
    bridge: Arc<AsyncBridge>,
}

impl Router {
    /// Router over the configured room bindings with no plugins
    pub fn new(
        config: Arc<RelayConfig>,
        radio: Arc<dyn RadioPort>,
        chat: Arc<dyn ChatPort>,
        store: MessageIdentityStore,
        bridge: Arc<AsyncBridge>,
    ) -> Self {
        Self {
            bindings: config.rooms.clone(),
            config,
            radio,
            chat,
            store,
            plugins: Arc::new(NoPlugins),
            names: NameCache::default(),
            bridge,
        }
    }

    /// Use bindings with resolved room ids
    pub fn with_bindings(mut self, bindings: Vec<ChannelBinding>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Offer messages to a plugin host
    pub fn with_plugins(mut self, plugins: Arc<dyn PluginHost>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Active channel↔room bindings
    pub fn bindings(&self) -> &[ChannelBinding] {
        &self.bindings
    }

    /// Identity store in use
    pub fn store(&self) -> &MessageIdentityStore {
        &self.store
    }

    fn meshnet(&self) -> &str {
        &self.config.radio.meshnet_name
    }

    fn rooms_for_channel(&self, channel: u32) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.radio_channel == channel)
            .map(|b| b.id.clone())
            .collect();
        rooms.dedup();
        rooms
    }

    fn channel_for_room(&self, room_id: &str) -> Option<u32> {
        self.bindings
            .iter()
            .find(|b| b.id == room_id)
            .map(|b| b.radio_channel)
    }

    /// Store handle when mappings are being recorded at all
    fn recording_store(&self) -> Option<MessageIdentityStore> {
        self.config
            .message_interactions
            .storage_enabled()
            .then(|| self.store.clone())
    }

    /// Route one inbound unit
    pub async fn handle(&self, unit: RelayUnit) -> RouteOutcome {
        let outcome = match &unit.origin {
            Origin::Radio {
                packet_id,
                from,
                to,
                channel,
                ..
            } => {
                self.route_radio(&unit, *packet_id, *from, *to, *channel)
                    .await
            }
            Origin::Chat {
                room_id, event_id, ..
            } => self.route_chat(&unit, room_id, event_id).await,
        };

        match &outcome {
            RouteOutcome::Relayed { targets } => {
                info!(sender = %unit.sender, targets = targets.len(), kind = ?unit.classify(), "Relaying message");
            }
            RouteOutcome::Dropped(reason) => {
                debug!(sender = %unit.sender, reason = reason.as_str(), "Message not relayed");
            }
            RouteOutcome::PluginHandled => {
                debug!(sender = %unit.sender, "Message handled by plugin");
            }
        }
        outcome
    }

    // ---------------------------------------------------------------- radio

    async fn route_radio(
        &self,
        unit: &RelayUnit,
        packet_id: u32,
        from: u32,
        to: u32,
        channel: u32,
    ) -> RouteOutcome {
        let node = self.names.node(from, self.radio.as_ref());

        if unit.classify() == UnitKind::NonText {
            return if self.offer_radio(unit, &node).await {
                RouteOutcome::PluginHandled
            } else {
                RouteOutcome::Dropped(DropReason::NonText)
            };
        }
        if unit.text.trim().is_empty() {
            return RouteOutcome::Dropped(DropReason::Empty);
        }
        if to != BROADCAST_ADDR {
            let to_us = self.radio.my_node_num() == Some(to);
            if to_us && self.offer_radio(unit, &node).await {
                return RouteOutcome::PluginHandled;
            }
            return RouteOutcome::Dropped(DropReason::DirectMessage);
        }

        let rooms = self.rooms_for_channel(channel);
        if rooms.is_empty() {
            return RouteOutcome::Dropped(DropReason::UnboundChannel);
        }

        let interactions = self.config.message_interactions;
        match &unit.linkage {
            Linkage::Reaction { target, emoji } => {
                if !interactions.reactions {
                    return RouteOutcome::Dropped(DropReason::InteractionDisabled);
                }
                let mappings = self.mappings_for_radio(target).await;
                if mappings.is_empty() {
                    return RouteOutcome::Dropped(DropReason::MappingMissing);
                }

                let mut targets = Vec::with_capacity(mappings.len());
                for mapping in mappings {
                    let body = format!(
                        "[{}/{}] reacted {} to \"{}\"",
                        node.long_name,
                        self.meshnet(),
                        emoji,
                        format::abbreviate(&mapping.text)
                    );
                    let message = OutboundChat {
                        body,
                        msgtype: ChatMsgType::Emote,
                        reply_to: None,
                        identity: Some(IdentityMetadata {
                            reply_id: Some(mapping.radio_id),
                            text: Some(mapping.text.clone()),
                            emote: Some(true),
                            ..self.radio_identity(&node, packet_id, unit)
                        }),
                    };
                    self.spawn_chat_send(mapping.chat_room_id.clone(), message, None);
                    targets.push(RelayTarget::Room(mapping.chat_room_id));
                }
                RouteOutcome::relayed(targets)
            }
            Linkage::Reply(target) if interactions.replies => {
                let mappings = self.mappings_for_radio(target).await;
                if mappings.is_empty() {
                    return RouteOutcome::Dropped(DropReason::MappingMissing);
                }
                if self.offer_radio(unit, &node).await {
                    return RouteOutcome::PluginHandled;
                }

                let body = self.radio_body(&node, &unit.text);
                let mut targets = Vec::with_capacity(mappings.len());
                for mapping in mappings {
                    let message = OutboundChat {
                        body: body.clone(),
                        msgtype: ChatMsgType::Text,
                        reply_to: Some(mapping.chat_event_id.clone()),
                        identity: Some(self.radio_identity(&node, packet_id, unit)),
                    };
                    self.spawn_chat_send(
                        mapping.chat_room_id.clone(),
                        message,
                        Some((packet_id, unit.text.clone())),
                    );
                    targets.push(RelayTarget::Room(mapping.chat_room_id));
                }
                RouteOutcome::relayed(targets)
            }
            _ => {
                if self.offer_radio(unit, &node).await {
                    return RouteOutcome::PluginHandled;
                }

                let body = self.radio_body(&node, &unit.text);
                let mut targets = Vec::with_capacity(rooms.len());
                for room_id in rooms {
                    let message = OutboundChat {
                        identity: Some(self.radio_identity(&node, packet_id, unit)),
                        ..OutboundChat::text(body.clone())
                    };
                    self.spawn_chat_send(
                        room_id.clone(),
                        message,
                        Some((packet_id, unit.text.clone())),
                    );
                    targets.push(RelayTarget::Room(room_id));
                }
                RouteOutcome::relayed(targets)
            }
        }
    }

    async fn offer_radio(&self, unit: &RelayUnit, node: &NodeUser) -> bool {
        offer(
            self.config.radio.plugin_timeout,
            "radio",
            self.plugins
                .on_radio_message(unit, &node.long_name, self.meshnet()),
        )
        .await
    }

    fn radio_body(&self, node: &NodeUser, text: &str) -> String {
        let radio = &self.config.radio;
        if !radio.prefix_enabled {
            return text.to_string();
        }
        let prefix = format::radio_prefix(
            &radio.prefix_format,
            &node.long_name,
            &node.short_name,
            self.meshnet(),
        );
        format!("{prefix}{text}")
    }

    fn radio_identity(&self, node: &NodeUser, packet_id: u32, unit: &RelayUnit) -> IdentityMetadata {
        let portnum = match &unit.origin {
            Origin::Radio { port, .. } => Some(port.label()),
            Origin::Chat { .. } => None,
        };
        IdentityMetadata {
            longname: Some(node.long_name.clone()),
            shortname: Some(node.short_name.clone()),
            meshnet: Some(self.meshnet().to_string()),
            portnum,
            id: Some(packet_id),
            reply_id: None,
            text: Some(unit.text.clone()),
            emote: None,
        }
    }

    async fn mappings_for_radio(&self, target: &LinkId) -> Vec<MessageMapping> {
        let LinkId::Radio(radio_id) = target else {
            return Vec::new();
        };
        match self.store.find_by_radio_id(*radio_id).await {
            Ok(mappings) => {
                if mappings.is_empty() {
                    debug!(radio_id, "No stored mapping for radio message");
                }
                mappings
            }
            Err(e) => {
                warn!(radio_id, error = %e, "Identity lookup failed");
                Vec::new()
            }
        }
    }

    /// Send to chat in the background, then record the mapping if asked
    fn spawn_chat_send(&self, room_id: String, message: OutboundChat, record: Option<(u32, String)>) {
        let chat = Arc::clone(&self.chat);
        let store = record.is_some().then(|| self.recording_store()).flatten();
        let meshnet = self.meshnet().to_string();
        let keep = self.config.database.msgs_to_keep;

        self.bridge.fire_and_forget("relay-to-chat", async move {
            let event_id = chat.send_message(&room_id, message).await?;
            if let (Some(store), Some((radio_id, text))) = (store, record) {
                let mapping = MessageMapping {
                    radio_id,
                    chat_event_id: event_id,
                    chat_room_id: room_id,
                    text,
                    meshnet,
                };
                persist(&store, &mapping, keep).await?;
            }
            Ok::<(), RelayError>(())
        });
    }

    // ----------------------------------------------------------------- chat

    async fn route_chat(&self, unit: &RelayUnit, room_id: &str, event_id: &str) -> RouteOutcome {
        let Some(channel) = self.channel_for_room(room_id) else {
            return RouteOutcome::Dropped(DropReason::UnboundRoom);
        };

        let remote = match unit.identity.as_ref() {
            Some(identity) => match identity.meshnet.as_deref() {
                Some(meshnet) if meshnet == self.meshnet() => {
                    return RouteOutcome::Dropped(DropReason::Loopback);
                }
                Some(_) => Some(identity),
                None => None,
            },
            None => None,
        };
        if remote.is_none() && self.chat.user_id().as_deref() == Some(unit.sender.as_str()) {
            return RouteOutcome::Dropped(DropReason::OwnMessage);
        }
        if !self.config.radio.broadcast_enabled {
            return RouteOutcome::Dropped(DropReason::BroadcastDisabled);
        }
        if unit.text.trim().is_empty() {
            return RouteOutcome::Dropped(DropReason::Empty);
        }

        let interactions = self.config.message_interactions;
        let relayed = RouteOutcome::relayed(vec![RelayTarget::Channel(channel)]);
        match &unit.linkage {
            Linkage::Reaction { target, emoji } => {
                if !interactions.reactions {
                    return RouteOutcome::Dropped(DropReason::InteractionDisabled);
                }
                let Some(mapping) = self.mapping_for_chat(target).await else {
                    return RouteOutcome::Dropped(DropReason::MappingMissing);
                };
                let prefix = self.chat_prefix(unit).await;
                let text = format!(
                    "{prefix}reacted {emoji} to \"{}\"",
                    format::abbreviate(&mapping.text)
                );
                self.spawn_radio_send(OutboundText::broadcast(text, channel), None);
                relayed
            }
            Linkage::Reply(target) if interactions.replies => {
                let Some(mapping) = self.mapping_for_chat(target).await else {
                    return RouteOutcome::Dropped(DropReason::MappingMissing);
                };
                if self.offer_chat(room_id, unit).await {
                    return RouteOutcome::PluginHandled;
                }
                let (text, original) = self.chat_radio_text(unit, remote).await;
                let record = self.pending_chat(event_id, room_id, original);
                self.spawn_radio_send(
                    OutboundText::broadcast(text, channel).replying_to(mapping.radio_id),
                    record,
                );
                relayed
            }
            _ => {
                if let Some(identity) = remote.filter(|i| i.emote == Some(true)) {
                    // Reaction relayed by another meshnet's bridge
                    if !interactions.reactions {
                        return RouteOutcome::Dropped(DropReason::InteractionDisabled);
                    }
                    let text = format!(
                        "{} {}",
                        remote_tag(identity),
                        format::strip_bracket_label(&unit.text)
                    );
                    self.spawn_radio_send(OutboundText::broadcast(text, channel), None);
                    return relayed;
                }

                if self.offer_chat(room_id, unit).await {
                    return RouteOutcome::PluginHandled;
                }
                let (text, original) = self.chat_radio_text(unit, remote).await;
                let record = self.pending_chat(event_id, room_id, original);
                self.spawn_radio_send(OutboundText::broadcast(text, channel), record);
                relayed
            }
        }
    }

    async fn offer_chat(&self, room_id: &str, unit: &RelayUnit) -> bool {
        offer(
            self.config.radio.plugin_timeout,
            "chat",
            self.plugins.on_chat_message(room_id, unit),
        )
        .await
    }

    async fn chat_prefix(&self, unit: &RelayUnit) -> String {
        let chat = &self.config.chat;
        if !chat.prefix_enabled {
            return String::new();
        }
        let display = self.names.display(&unit.sender, self.chat.as_ref()).await;
        format::chat_prefix(&chat.prefix_format, &display, &unit.sender)
    }

    /// Radio text for a chat message, plus the unprefixed original
    async fn chat_radio_text(
        &self,
        unit: &RelayUnit,
        remote: Option<&IdentityMetadata>,
    ) -> (String, String) {
        match remote {
            Some(identity) => {
                let original = identity
                    .text
                    .clone()
                    .unwrap_or_else(|| format::strip_reply_fallback(&unit.text));
                (format!("{}: {original}", remote_tag(identity)), original)
            }
            None => {
                let original = format::strip_reply_fallback(&unit.text);
                let prefix = self.chat_prefix(unit).await;
                (format!("{prefix}{original}"), original)
            }
        }
    }

    fn pending_chat(&self, event_id: &str, room_id: &str, text: String) -> Option<PendingChatMapping> {
        self.config
            .message_interactions
            .storage_enabled()
            .then(|| PendingChatMapping {
                event_id: event_id.to_string(),
                room_id: room_id.to_string(),
                text,
            })
    }

    async fn mapping_for_chat(&self, target: &LinkId) -> Option<MessageMapping> {
        let LinkId::Chat(event_id) = target else {
            return None;
        };
        match self.store.get_by_chat_event_id(event_id).await {
            Ok(Some(mapping)) => Some(mapping),
            Ok(None) => {
                debug!(event_id = %event_id, "No stored mapping for chat event");
                None
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Identity lookup failed");
                None
            }
        }
    }

    /// Send to the radio in the background, then record the mapping if asked
    fn spawn_radio_send(&self, message: OutboundText, record: Option<PendingChatMapping>) {
        let text = format::truncate_for_radio(&message.text).to_string();
        if text.len() < message.text.len() {
            debug!(from = message.text.len(), to = text.len(), "Truncated text for radio");
        }
        let message = OutboundText { text, ..message };

        let radio = Arc::clone(&self.radio);
        let store = self.store.clone();
        let meshnet = self.meshnet().to_string();
        let keep = self.config.database.msgs_to_keep;

        self.bridge.fire_and_forget("relay-to-radio", async move {
            let radio_id = radio.send_text(message).await?;
            if let Some(pending) = record {
                let mapping = MessageMapping {
                    radio_id,
                    chat_event_id: pending.event_id,
                    chat_room_id: pending.room_id,
                    text: pending.text,
                    meshnet,
                };
                persist(&store, &mapping, keep).await?;
            }
            Ok::<(), RelayError>(())
        });
    }

    // ---------------------------------------------------------- direct API

    /// Broadcast text on a radio channel; returns the packet id
    pub async fn send(&self, text: &str, channel: u32) -> Result<u32> {
        let radio = Arc::clone(&self.radio);
        let message = OutboundText::broadcast(format::truncate_for_radio(text), channel);
        self.bridge
            .submit(async move { radio.send_text(message).await })
            .join()
            .await
            .map_err(|e| RelayError::Radio(e.to_string()))?
    }

    /// Post a message to a chat room; returns the event id
    ///
    /// When `identity` names a radio packet and mappings are recorded, the
    /// new event is linked to it.
    pub async fn relay(
        &self,
        room_id: &str,
        message: &str,
        identity: Option<IdentityMetadata>,
    ) -> Result<String> {
        let chat = Arc::clone(&self.chat);
        let room = room_id.to_string();
        let outbound = OutboundChat {
            identity: identity.clone(),
            ..OutboundChat::text(message)
        };
        let event_id = self
            .bridge
            .submit(async move { chat.send_message(&room, outbound).await })
            .join()
            .await
            .map_err(|e| RelayError::Chat(e.to_string()))??;

        if let (Some(store), Some(identity)) = (self.recording_store(), identity) {
            if let Some(radio_id) = identity.id {
                let mapping = MessageMapping {
                    radio_id,
                    chat_event_id: event_id.clone(),
                    chat_room_id: room_id.to_string(),
                    text: identity.text.unwrap_or_else(|| message.to_string()),
                    meshnet: identity
                        .meshnet
                        .unwrap_or_else(|| self.meshnet().to_string()),
                };
                if let Err(e) = persist(&store, &mapping, self.config.database.msgs_to_keep).await {
                    warn!(event_id = %event_id, error = %e, "Failed to record relayed message");
                }
            }
        }
        Ok(event_id)
    }
}

fn remote_tag(identity: &IdentityMetadata) -> String {
    format::remote_tag(
        identity.shortname.as_deref().unwrap_or("???"),
        identity.meshnet.as_deref().unwrap_or_default(),
    )
}

async fn persist(store: &MessageIdentityStore, mapping: &MessageMapping, keep: i64) -> Result<()> {
    store.put(mapping).await?;
    store.prune(keep).await?;
    Ok(())
}
