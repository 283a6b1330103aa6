// RTMP constants

// Handshake
pub const RTMP_VERSION: u8 = 3;
pub const RTMP_HANDSHAKE_SIZE: usize = 1536;
pub const RTMP_HANDSHAKE_TIMEOUT_SECONDS: u64 = 10;

// Chunk types
// 11-bytes: timestamp(3) + length(3) + stream type(1) + stream id(4)
pub const RTMP_CHUNK_TYPE_0: u8 = 0;
pub const RTMP_CHUNK_TYPE_1: u8 = 1; // 7-bytes: delta(3) + length(3) + stream type(1)
pub const RTMP_CHUNK_TYPE_2: u8 = 2; // 3-bytes: delta(3)
pub const RTMP_CHUNK_TYPE_3: u8 = 3; // 0-byte

/// Timestamp field value announcing an extended timestamp
pub const RTMP_EXTENDED_TIMESTAMP: u32 = 0xffffff;

/// Chunk size both ends start with
pub const RTMP_DEFAULT_CHUNK_SIZE: u32 = 128;

/// Largest chunk size a peer may announce
pub const RTMP_MAX_CHUNK_SIZE: u32 = 0x7fffffff;

// Chunk stream ids
pub const RTMP_CSID_PROTOCOL_CONTROL: u32 = 2;
pub const RTMP_CSID_OVER_CONNECTION: u32 = 3;
pub const RTMP_CSID_OVER_STREAM: u32 = 5;
pub const RTMP_CSID_AMF: u32 = 5;
pub const RTMP_CSID_AUDIO: u32 = 6;
pub const RTMP_CSID_VIDEO: u32 = 7;

/// Message stream id used for media and stream status
pub const RTMP_MSID_MEDIA: u32 = 1;

// Packet types

/* Protocol Control Messages */
pub const RTMP_TYPE_SET_CHUNK_SIZE: u8 = 1;
pub const RTMP_TYPE_ABORT: u8 = 2;
pub const RTMP_TYPE_ACKNOWLEDGEMENT: u8 = 3; // bytes read report
pub const RTMP_TYPE_WINDOW_ACKNOWLEDGEMENT_SIZE: u8 = 5; // server bandwidth
pub const RTMP_TYPE_SET_PEER_BANDWIDTH: u8 = 6; // client bandwidth

/* User Control Messages Event (4) */
pub const RTMP_TYPE_EVENT: u8 = 4;

pub const RTMP_TYPE_AUDIO: u8 = 8;
pub const RTMP_TYPE_VIDEO: u8 = 9;

/* Data Message */
pub const RTMP_TYPE_FLEX_STREAM: u8 = 15; // AMF3
pub const RTMP_TYPE_DATA: u8 = 18; // AMF0

/* Command Message */
pub const RTMP_TYPE_FLEX_MESSAGE: u8 = 17; // AMF3
pub const RTMP_TYPE_INVOKE: u8 = 20; // AMF0

/* Aggregate Message */
pub const RTMP_TYPE_AGGREGATE: u8 = 22;

// User control events
pub const RTMP_EVENT_STREAM_BEGIN: u16 = 0x00;
pub const RTMP_EVENT_STREAM_EOF: u16 = 0x01;
pub const RTMP_EVENT_PING_REQUEST: u16 = 0x06;
pub const RTMP_EVENT_PING_RESPONSE: u16 = 0x07;

// Bandwidth announced to peers
pub const RTMP_WINDOW_ACK_SIZE: u32 = 5_000_000;
pub const RTMP_PEER_BANDWIDTH: u32 = 5_000_000;
pub const RTMP_PEER_BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;
