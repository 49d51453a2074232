//! `/sync` response shapes and event normalisation
//!
//! Only the parts the relay reads are modelled; everything else in the
//! response is ignored by serde.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, trace};

use meshrelay_core::{ChatMsgType, IdentityMetadata, LinkId, Linkage, Origin, OutboundChat, RelayUnit};

/// Body of a `/sync` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncResponse {
    /// Token for the next incremental sync
    pub next_batch: String,
    /// Per-room updates
    #[serde(default)]
    pub rooms: SyncRooms,
}

/// Room section of a sync response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    /// Rooms the account is joined to
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

/// Updates for one joined room
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoom {
    /// New timeline events
    #[serde(default)]
    pub timeline: Timeline,
}

/// Timeline slice
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timeline {
    /// Events, oldest first
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

/// One timeline event
#[derive(Debug, Clone, Deserialize)]
pub struct RoomEvent {
    /// Event id
    pub event_id: String,
    /// Sender user id
    pub sender: String,
    /// Event type (`m.room.message`, `m.reaction`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Event content
    #[serde(default)]
    pub content: Value,
}

impl SyncResponse {
    /// Normalised units for the given rooms, in timeline order
    pub fn units_for<'a>(&'a self, rooms: impl IntoIterator<Item = &'a str>) -> Vec<RelayUnit> {
        let mut units = Vec::new();
        for room_id in rooms {
            let Some(room) = self.rooms.join.get(room_id) else {
                continue;
            };
            units.extend(
                room.timeline
                    .events
                    .iter()
                    .filter_map(|event| normalize_event(room_id, event)),
            );
        }
        units
    }
}

fn relates_to(content: &Value) -> Option<&Map<String, Value>> {
    content.get("m.relates_to")?.as_object()
}

/// Turn a room event into a relay unit
///
/// Messages (`m.text`, `m.emote`, `m.notice`) and `m.annotation` reactions
/// are kept. Edits, redactions, state and unknown message types are not.
pub fn normalize_event(room_id: &str, event: &RoomEvent) -> Option<RelayUnit> {
    match event.kind.as_str() {
        "m.room.message" => normalize_message(room_id, event),
        "m.reaction" => normalize_reaction(room_id, event),
        other => {
            trace!(event_id = %event.event_id, kind = other, "Ignoring event type");
            None
        }
    }
}

fn normalize_message(room_id: &str, event: &RoomEvent) -> Option<RelayUnit> {
    let content = &event.content;
    let Some(msgtype) = content
        .get("msgtype")
        .and_then(Value::as_str)
        .and_then(ChatMsgType::parse)
    else {
        debug!(event_id = %event.event_id, "Ignoring message without relayable msgtype");
        return None;
    };
    let body = content.get("body").and_then(Value::as_str)?;

    let relation = relates_to(content);
    if relation
        .and_then(|r| r.get("rel_type"))
        .and_then(Value::as_str)
        == Some("m.replace")
    {
        debug!(event_id = %event.event_id, "Ignoring edit");
        return None;
    }

    let mut unit = RelayUnit::chat_text(room_id, &event.event_id, &event.sender, body);
    if let Origin::Chat { msgtype: kind, .. } = &mut unit.origin {
        *kind = msgtype;
    }

    if let Some(target) = relation
        .and_then(|r| r.get("m.in_reply_to"))
        .and_then(|r| r.get("event_id"))
        .and_then(Value::as_str)
    {
        unit.linkage = Linkage::Reply(LinkId::Chat(target.to_string()));
    }

    let identity = identity_from_content(&event.event_id, content);
    if !identity.is_empty() {
        unit = unit.with_identity(identity);
    }

    Some(unit)
}

/// Read the `meshtastic_*` fields one at a time
///
/// A field with an unexpected type is skipped on its own; the rest of the
/// identity, the meshnet in particular, still applies.
fn identity_from_content(event_id: &str, content: &Value) -> IdentityMetadata {
    IdentityMetadata {
        longname: metadata_field(event_id, content, "meshtastic_longname"),
        shortname: metadata_field(event_id, content, "meshtastic_shortname"),
        meshnet: metadata_field(event_id, content, "meshtastic_meshnet"),
        portnum: metadata_field(event_id, content, "meshtastic_portnum"),
        id: metadata_field(event_id, content, "meshtastic_id"),
        reply_id: metadata_field(event_id, content, "meshtastic_replyId"),
        text: metadata_field(event_id, content, "meshtastic_text"),
        emote: content
            .get("meshtastic_emote")
            .and_then(|v| v.as_bool().or_else(|| v.as_i64().map(|n| n != 0))),
    }
}

fn metadata_field<T: DeserializeOwned>(event_id: &str, content: &Value, key: &'static str) -> Option<T> {
    let value = content.get(key).filter(|v| !v.is_null())?;
    match T::deserialize(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!(event_id = %event_id, field = key, error = %e, "Ignoring malformed relay metadata field");
            None
        }
    }
}

fn normalize_reaction(room_id: &str, event: &RoomEvent) -> Option<RelayUnit> {
    let relation = relates_to(&event.content)?;
    if relation.get("rel_type").and_then(Value::as_str) != Some("m.annotation") {
        return None;
    }
    let target = relation.get("event_id").and_then(Value::as_str)?;
    let key = relation.get("key").and_then(Value::as_str)?;

    Some(
        RelayUnit::chat_text(room_id, &event.event_id, &event.sender, key).with_linkage(
            Linkage::Reaction {
                target: LinkId::Chat(target.to_string()),
                emoji: key.to_string(),
            },
        ),
    )
}

/// Event content for an outbound message
pub fn message_content(message: &OutboundChat) -> Value {
    let mut content = Map::new();
    if let Some(identity) = &message.identity {
        if let Ok(Value::Object(fields)) = serde_json::to_value(identity) {
            content.extend(fields);
        }
    }
    content.insert("msgtype".into(), json!(message.msgtype.as_str()));
    content.insert("body".into(), json!(message.body));
    if let Some(reply_to) = &message.reply_to {
        content.insert(
            "m.relates_to".into(),
            json!({ "m.in_reply_to": { "event_id": reply_to } }),
        );
    }
    Value::Object(content)
}
