//! Message types crossing the relay
//!
//! Inbound traffic from either side is normalised into a [`RelayUnit`] before
//! it reaches the router. Outbound traffic leaves as an [`OutboundText`]
//! (radio) or an [`OutboundChat`] (chat).

use serde::{Deserialize, Serialize};

/// Radio destination meaning "all nodes"
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Largest text payload, in bytes, a single radio packet carries
pub const RADIO_TEXT_LIMIT: usize = 227;

/// Render a radio node number the way the mesh prints it (`!a1b2c3d4`)
pub fn radio_node_id(num: u32) -> String {
    format!("!{num:08x}")
}

/// Radio application port of an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    /// Plain text messages
    Text,
    /// Any other application port, by number
    Other(i32),
}

impl PortKind {
    /// Name used in the `meshtastic_portnum` metadata field
    pub fn label(&self) -> String {
        match self {
            PortKind::Text => "TEXT_MESSAGE_APP".to_string(),
            PortKind::Other(n) => format!("PORT_{n}"),
        }
    }
}

/// Chat message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMsgType {
    /// `m.text`
    #[serde(rename = "m.text")]
    Text,
    /// `m.emote`
    #[serde(rename = "m.emote")]
    Emote,
    /// `m.notice`
    #[serde(rename = "m.notice")]
    Notice,
}

impl ChatMsgType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMsgType::Text => "m.text",
            ChatMsgType::Emote => "m.emote",
            ChatMsgType::Notice => "m.notice",
        }
    }

    /// Parse a wire name; unknown types are not relayed
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "m.text" => Some(ChatMsgType::Text),
            "m.emote" => Some(ChatMsgType::Emote),
            "m.notice" => Some(ChatMsgType::Notice),
            _ => None,
        }
    }
}

/// Where an inbound unit came from, with its transport routing data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Received from the radio mesh
    Radio {
        /// Packet id assigned by the sender
        packet_id: u32,
        /// Sender node number
        from: u32,
        /// Destination node number
        to: u32,
        /// Channel index
        channel: u32,
        /// Application port
        port: PortKind,
    },
    /// Received from the chat homeserver
    Chat {
        /// Room the event was sent to
        room_id: String,
        /// Event id
        event_id: String,
        /// Message type (reactions carry `m.text`)
        msgtype: ChatMsgType,
    },
}

/// Identifier of a message on one side of the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkId {
    /// Radio packet id
    Radio(u32),
    /// Chat event id
    Chat(String),
}

/// Reply/reaction linkage of an inbound unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Linkage {
    /// Standalone message
    #[default]
    None,
    /// Reply to another message
    Reply(LinkId),
    /// Reaction to another message
    Reaction {
        /// Message reacted to
        target: LinkId,
        /// Reaction key
        emoji: String,
    },
}

/// Routing class of an inbound unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Plain text
    Plain,
    /// Reply to a previous message
    Reply,
    /// Reaction to a previous message
    Reaction,
    /// Not text; offered to plugins only
    NonText,
}

/// Radio identity attached to chat events the relay emitted
///
/// Serialized flat into event content under the `meshtastic_*` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMetadata {
    /// Sender long name
    #[serde(rename = "meshtastic_longname", default, skip_serializing_if = "Option::is_none")]
    pub longname: Option<String>,

    /// Sender short name
    #[serde(rename = "meshtastic_shortname", default, skip_serializing_if = "Option::is_none")]
    pub shortname: Option<String>,

    /// Meshnet the message originated on
    #[serde(rename = "meshtastic_meshnet", default, skip_serializing_if = "Option::is_none")]
    pub meshnet: Option<String>,

    /// Radio port label
    #[serde(rename = "meshtastic_portnum", default, skip_serializing_if = "Option::is_none")]
    pub portnum: Option<String>,

    /// Radio packet id
    #[serde(rename = "meshtastic_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,

    /// Radio packet id this message replies or reacts to
    #[serde(rename = "meshtastic_replyId", default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<u32>,

    /// Original text without prefix
    #[serde(rename = "meshtastic_text", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Whether the event is a relayed reaction
    #[serde(rename = "meshtastic_emote", default, skip_serializing_if = "Option::is_none")]
    pub emote: Option<bool>,
}

impl IdentityMetadata {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        *self == IdentityMetadata::default()
    }
}

/// Normalised inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUnit {
    /// Origin transport and routing data
    pub origin: Origin,
    /// Sender: radio node id (`!xxxxxxxx`) or chat user id
    pub sender: String,
    /// Message text (reaction key for chat reactions)
    pub text: String,
    /// Reply/reaction linkage
    pub linkage: Linkage,
    /// Meshnet tag, when known
    pub meshnet: Option<String>,
    /// Radio identity carried by chat events
    pub identity: Option<IdentityMetadata>,
}

impl RelayUnit {
    /// Text unit from the radio side
    pub fn radio_text(packet_id: u32, from: u32, to: u32, channel: u32, text: impl Into<String>) -> Self {
        Self {
            origin: Origin::Radio {
                packet_id,
                from,
                to,
                channel,
                port: PortKind::Text,
            },
            sender: radio_node_id(from),
            text: text.into(),
            linkage: Linkage::None,
            meshnet: None,
            identity: None,
        }
    }

    /// Text unit from the chat side
    pub fn chat_text(
        room_id: impl Into<String>,
        event_id: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            origin: Origin::Chat {
                room_id: room_id.into(),
                event_id: event_id.into(),
                msgtype: ChatMsgType::Text,
            },
            sender: sender.into(),
            text: text.into(),
            linkage: Linkage::None,
            meshnet: None,
            identity: None,
        }
    }

    /// Attach linkage
    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    /// Attach identity metadata
    pub fn with_identity(mut self, identity: IdentityMetadata) -> Self {
        self.meshnet = identity.meshnet.clone().or(self.meshnet);
        self.identity = Some(identity);
        self
    }

    /// Classify for routing
    pub fn classify(&self) -> UnitKind {
        if let Origin::Radio { port, .. } = self.origin {
            if port != PortKind::Text {
                return UnitKind::NonText;
            }
        }
        match self.linkage {
            Linkage::None => UnitKind::Plain,
            Linkage::Reply(_) => UnitKind::Reply,
            Linkage::Reaction { .. } => UnitKind::Reaction,
        }
    }

    /// True for radio-origin units
    pub fn is_radio(&self) -> bool {
        matches!(self.origin, Origin::Radio { .. })
    }
}

/// Persistent link between a radio message and the chat event it became
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMapping {
    /// Radio packet id
    pub radio_id: u32,
    /// Chat event id (unique key)
    pub chat_event_id: String,
    /// Chat room holding the event
    pub chat_room_id: String,
    /// Original text without prefix
    pub text: String,
    /// Meshnet the message belongs to
    pub meshnet: String,
}

/// Radio node identity from the node database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUser {
    /// Node id (`!xxxxxxxx`)
    pub id: String,
    /// Long name
    pub long_name: String,
    /// Short name (up to 4 characters)
    pub short_name: String,
}

/// One radio send request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundText {
    /// Payload text
    pub text: String,
    /// Channel index
    pub channel: u32,
    /// Destination node number
    pub destination: u32,
    /// Packet id this replies to
    pub reply_id: Option<u32>,
    /// Mark the payload as an emoji reaction
    pub emoji: bool,
}

impl OutboundText {
    /// Broadcast text on a channel
    pub fn broadcast(text: impl Into<String>, channel: u32) -> Self {
        Self {
            text: text.into(),
            channel,
            destination: BROADCAST_ADDR,
            reply_id: None,
            emoji: false,
        }
    }

    /// Set the reply target
    pub fn replying_to(mut self, reply_id: u32) -> Self {
        self.reply_id = Some(reply_id);
        self
    }
}

/// One chat send request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChat {
    /// Body text
    pub body: String,
    /// Message type
    pub msgtype: ChatMsgType,
    /// Event id this replies to
    pub reply_to: Option<String>,
    /// Radio identity to attach
    pub identity: Option<IdentityMetadata>,
}

impl OutboundChat {
    /// Plain text message
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            msgtype: ChatMsgType::Text,
            reply_to: None,
            identity: None,
        }
    }
}
