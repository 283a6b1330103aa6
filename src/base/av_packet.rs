// Access unit produced by RTP depacketization

use bytes::Bytes;

/// Payload kind of an access unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AvPacketPayloadType {
    Avc,
    Hevc,
    Aac,
}

/// One complete access unit.
///
/// Video payloads are length prefixed NAL units (4 bytes, big endian).
/// Audio payloads are raw AAC frames without ADTS header.
#[derive(Clone, Debug)]
pub struct AvPacket {
    pub payload_type: AvPacketPayloadType,

    /// Decoding timestamp (milliseconds)
    pub timestamp: i64,

    /// Presentation timestamp (milliseconds)
    pub pts: i64,

    pub payload: Bytes,
}

impl AvPacket {
    pub fn is_audio(&self) -> bool {
        self.payload_type == AvPacketPayloadType::Aac
    }

    pub fn is_video(&self) -> bool {
        !self.is_audio()
    }
}
