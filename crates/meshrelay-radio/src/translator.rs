//! Packet to relay unit normalisation

use meshrelay_core::{LinkId, Linkage, PortKind, RelayUnit};
use tracing::trace;

use crate::proto::{port, MeshPacket};

/// Normalise a received packet
///
/// Returns `None` for packets the device could not decode. Text packets
/// carrying a `reply_id` become replies, or reactions when the emoji flag is
/// set (the payload is then the reaction key). Other ports pass through as
/// non-text units so plugins can see them.
pub fn normalize(packet: &MeshPacket, meshnet: &str) -> Option<RelayUnit> {
    let Some(data) = packet.decoded.as_ref() else {
        trace!(id = packet.id, from = packet.from, "Skipping undecoded packet");
        return None;
    };

    let text = String::from_utf8_lossy(&data.payload).into_owned();
    let mut unit = RelayUnit::radio_text(packet.id, packet.from, packet.to, packet.channel, text);
    unit.meshnet = Some(meshnet.to_string());

    if data.portnum != port::TEXT_MESSAGE {
        if let meshrelay_core::Origin::Radio { port, .. } = &mut unit.origin {
            *port = PortKind::Other(data.portnum);
        }
        return Some(unit);
    }

    if data.reply_id != 0 {
        let target = LinkId::Radio(data.reply_id);
        unit.linkage = if data.emoji != 0 {
            Linkage::Reaction {
                target,
                emoji: unit.text.clone(),
            }
        } else {
            Linkage::Reply(target)
        };
    }

    Some(unit)
}
