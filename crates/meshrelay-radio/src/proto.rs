//! Protobuf subset of the radio client API
//!
//! Only the messages and fields the relay reads or writes are declared. Field
//! numbers follow the device schema, so unknown fields in device output are
//! skipped by prost. Protobuf `oneof` members are declared as plain optional
//! fields; on the wire the two are indistinguishable.

/// Application port numbers
pub mod port {
    /// UTF-8 text message
    pub const TEXT_MESSAGE: i32 = 1;
    /// Node identity broadcast
    pub const NODEINFO: i32 = 4;
    /// Device administration
    pub const ADMIN: i32 = 6;
}

/// Decoded packet payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    /// Application port
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    /// Application payload
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    /// Ask the destination to answer
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    /// Final destination (routing)
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    /// Original sender (routing)
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    /// Packet this answers
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    /// Packet this replies or reacts to
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    /// Non-zero when the payload is an emoji reaction
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

/// One packet on the mesh
#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    /// Sender node number
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    /// Destination node number
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    /// Channel index
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    /// Decoded payload (absent when the packet could not be decrypted)
    #[prost(message, optional, tag = "4")]
    pub decoded: Option<Data>,
    /// Packet id
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    /// Receive time (epoch seconds)
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    /// Remaining hops
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    /// Request an acknowledgement
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
}

/// Identity of the locally attached node
#[derive(Clone, PartialEq, prost::Message)]
pub struct MyNodeInfo {
    /// Node number
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

/// User-facing identity of a node
#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    /// Node id (`!xxxxxxxx`)
    #[prost(string, tag = "1")]
    pub id: String,
    /// Long name
    #[prost(string, tag = "2")]
    pub long_name: String,
    /// Short name
    #[prost(string, tag = "3")]
    pub short_name: String,
}

/// Node database entry
#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeInfo {
    /// Node number
    #[prost(uint32, tag = "1")]
    pub num: u32,
    /// Identity, when known
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
}

/// Firmware description
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceMetadata {
    /// Firmware version string
    #[prost(string, tag = "1")]
    pub firmware_version: String,
}

/// Administration request/response payload (port [`port::ADMIN`])
#[derive(Clone, PartialEq, prost::Message)]
pub struct AdminMessage {
    /// Ask for the device metadata
    #[prost(bool, tag = "12")]
    pub get_device_metadata_request: bool,
    /// Device metadata answer
    #[prost(message, optional, tag = "13")]
    pub get_device_metadata_response: Option<DeviceMetadata>,
}

/// Envelope sent by the device
#[derive(Clone, PartialEq, prost::Message)]
pub struct FromRadio {
    /// Monotonic envelope id
    #[prost(uint32, tag = "1")]
    pub id: u32,
    /// Received packet
    #[prost(message, optional, tag = "2")]
    pub packet: Option<MeshPacket>,
    /// Local node identity
    #[prost(message, optional, tag = "3")]
    pub my_info: Option<MyNodeInfo>,
    /// Node database entry
    #[prost(message, optional, tag = "4")]
    pub node_info: Option<NodeInfo>,
    /// End of the config dump started by `want_config_id`
    #[prost(uint32, tag = "7")]
    pub config_complete_id: u32,
    /// Device metadata
    #[prost(message, optional, tag = "13")]
    pub metadata: Option<DeviceMetadata>,
}

/// Envelope sent to the device
#[derive(Clone, PartialEq, prost::Message)]
pub struct ToRadio {
    /// Packet to transmit
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    /// Start a config dump tagged with this nonce
    #[prost(uint32, tag = "3")]
    pub want_config_id: u32,
    /// Tell the device the client is leaving
    #[prost(bool, tag = "4")]
    pub disconnect: bool,
}

impl MeshPacket {
    /// Text payload, when this is a decodable text packet
    pub fn text(&self) -> Option<String> {
        let data = self.decoded.as_ref()?;
        if data.portnum != port::TEXT_MESSAGE {
            return None;
        }
        Some(String::from_utf8_lossy(&data.payload).into_owned())
    }

    /// Application port, or 0 when not decoded
    pub fn portnum(&self) -> i32 {
        self.decoded.as_ref().map_or(0, |d| d.portnum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_packet_wire_tags() {
        let packet = MeshPacket {
            from: 0x0a0b0c0d,
            to: 0xffffffff,
            channel: 1,
            decoded: Some(Data {
                portnum: port::TEXT_MESSAGE,
                payload: b"hi".to_vec(),
                reply_id: 77,
                emoji: 1,
                ..Default::default()
            }),
            id: 42,
            ..Default::default()
        };
        let bytes = packet.encode_to_vec();
        // field 1, wire type 5 (fixed32)
        assert_eq!(bytes[0], 0x0d);
        assert_eq!(&bytes[1..5], &0x0a0b0c0du32.to_le_bytes());

        let decoded = MeshPacket::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.text().as_deref(), Some("hi"));
        assert_eq!(decoded.decoded.unwrap().reply_id, 77);
    }

    #[test]
    fn test_skips_unknown_fields() {
        // FromRadio with field 5 (config, length-delimited) and config_complete_id = 9
        let bytes = [0x2a, 0x02, 0x08, 0x01, 0x38, 0x09];
        let msg = FromRadio::decode(&bytes[..]).unwrap();
        assert_eq!(msg.config_complete_id, 9);
        assert!(msg.packet.is_none());
    }

    #[test]
    fn test_non_text_has_no_text() {
        let packet = MeshPacket {
            decoded: Some(Data {
                portnum: port::NODEINFO,
                payload: vec![1, 2, 3],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(packet.text().is_none());
        assert_eq!(packet.portnum(), port::NODEINFO);
    }
}
