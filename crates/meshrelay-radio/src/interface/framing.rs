//! Stream framing shared by the serial and TCP interfaces
//!
//! Frame layout:
//! - Bytes 0-1: Magic (0x94C3, big-endian)
//! - Bytes 2-3: Length (big-endian u16)
//! - Bytes 4+: Protobuf payload

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::{MAX_FRAME_PAYLOAD, MESHTASTIC_MAGIC};
use crate::error::{MeshtasticError, Result};

/// Magic + length
const HEADER_SIZE: usize = 4;

/// Incremental frame extractor over a byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_PAYLOAD * 2),
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop any buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Buffered byte count
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to extract one complete frame payload
    ///
    /// Bytes before the next magic are discarded. An oversize length skips the
    /// magic and reports [`MeshtasticError::InvalidPacket`]; the caller may
    /// keep decoding.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
        if magic != MESHTASTIC_MAGIC {
            match self.find_magic() {
                Some(pos) => {
                    // device debug output is interleaved with frames
                    trace!(discarded = pos, "Discarding bytes before magic number");
                    self.buffer.advance(pos);
                }
                None => {
                    let keep = usize::from(self.buffer.last() == Some(&0x94));
                    let discard = self.buffer.len() - keep;
                    trace!(discarded = discard, "Discarding buffer without magic");
                    self.buffer.advance(discard);
                    return Ok(None);
                }
            }

            if self.buffer.len() < HEADER_SIZE {
                return Ok(None);
            }
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            warn!(length, "Frame length too large, likely corrupt");
            self.buffer.advance(2);
            return Err(MeshtasticError::InvalidPacket(format!(
                "Frame length {length} exceeds maximum"
            )));
        }

        let total_size = HEADER_SIZE + length;
        if self.buffer.len() < total_size {
            trace!(have = self.buffer.len(), need = total_size, "Waiting for complete frame");
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total_size);
        frame.advance(HEADER_SIZE);
        debug!(size = frame.len(), "Received complete frame");
        Ok(Some(frame.freeze()))
    }

    fn find_magic(&self) -> Option<usize> {
        self.buffer
            .windows(2)
            .position(|w| w == MESHTASTIC_MAGIC.to_be_bytes())
    }
}

/// Prefix a payload with the frame header
pub fn frame_packet(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(MeshtasticError::MessageTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.extend_from_slice(&MESHTASTIC_MAGIC.to_be_bytes());
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}
