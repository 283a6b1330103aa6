// RTMP chunk codec

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{Buf, Bytes, BytesMut};

use crate::base::{AvMsg, AvMsgHeader, StreamError, StreamResult};

use super::{
    RTMP_CHUNK_TYPE_0, RTMP_CHUNK_TYPE_1, RTMP_CHUNK_TYPE_2, RTMP_CHUNK_TYPE_3,
    RTMP_DEFAULT_CHUNK_SIZE, RTMP_EXTENDED_TIMESTAMP, RTMP_MAX_CHUNK_SIZE, RTMP_TYPE_ABORT,
    RTMP_TYPE_SET_CHUNK_SIZE,
};

/// Default limit for an assembled message
pub const RTMP_DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the message header for each chunk type
fn get_rtmp_header_size(format: u8) -> usize {
    match format {
        RTMP_CHUNK_TYPE_0 => 11,
        RTMP_CHUNK_TYPE_1 => 7,
        RTMP_CHUNK_TYPE_2 => 3,
        _ => 0,
    }
}

/// Assembly state of one chunk stream
#[derive(Default)]
struct ChunkStreamState {
    header: AvMsgHeader,
    timestamp_delta: u32,
    has_extended_timestamp: bool,
    payload: BytesMut,
}

/// Chunk stream reader.
///
/// Bytes are fed as they arrive from the socket, in any split.
/// Complete messages are returned in arrival order.
pub struct ChunkComposer {
    peer_chunk_size: u32,
    max_message_size: u32,
    buffer: BytesMut,
    streams: HashMap<u32, ChunkStreamState>,
}

impl ChunkComposer {
    /// Creates a reader
    ///
    /// # Arguments
    ///
    /// * `max_message_size` - Messages announcing a bigger length are rejected
    pub fn new(max_message_size: u32) -> ChunkComposer {
        ChunkComposer {
            peer_chunk_size: RTMP_DEFAULT_CHUNK_SIZE,
            max_message_size,
            buffer: BytesMut::with_capacity(4096),
            streams: HashMap::new(),
        }
    }

    /// Chunk size the peer is currently using
    pub fn peer_chunk_size(&self) -> u32 {
        self.peer_chunk_size
    }

    /// Feeds bytes read from the connection
    ///
    /// # Return value
    ///
    /// Returns every message completed by these bytes.
    /// Partial chunks stay buffered until the next call.
    pub fn feed(&mut self, data: &[u8]) -> StreamResult<Vec<AvMsg>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();

        while let Some(completed) = self.read_chunk()? {
            if let Some(msg) = completed {
                messages.push(msg);
            }
        }

        Ok(messages)
    }

    /// Reads one chunk from the buffer
    ///
    /// Returns None when the buffer does not hold a full chunk yet.
    /// Nothing is consumed in that case.
    fn read_chunk(&mut self) -> StreamResult<Option<Option<AvMsg>>> {
        let buf = &self.buffer[..];

        if buf.is_empty() {
            return Ok(None);
        }

        // Basic header

        let format = buf[0] >> 6;

        let (csid, mut pos) = match buf[0] & 0x3f {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (64 + buf[1] as u32, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (64 + buf[1] as u32 + ((buf[2] as u32) << 8), 3)
            }
            n => (n as u32, 1),
        };

        if csid < 2 {
            return Err(StreamError::MalformedChunk(format!("invalid csid {}", csid)));
        }

        // Message header

        let header_size = get_rtmp_header_size(format);

        if buf.len() < pos + header_size {
            return Ok(None);
        }

        let (prev_header, prev_delta, prev_extended, collected) = match self.streams.get(&csid) {
            Some(s) => (
                s.header.clone(),
                s.timestamp_delta,
                s.has_extended_timestamp,
                s.payload.len() as u32,
            ),
            None => {
                if format != RTMP_CHUNK_TYPE_0 {
                    return Err(StreamError::MalformedChunk(format!(
                        "chunk type {} on csid {} without a previous header",
                        format, csid
                    )));
                }
                (AvMsgHeader::default(), 0, false, 0)
            }
        };

        let starts_message = collected == 0;

        if !starts_message && format != RTMP_CHUNK_TYPE_3 {
            return Err(StreamError::MalformedChunk(format!(
                "chunk type {} on csid {} in the middle of a message",
                format, csid
            )));
        }

        let mut header = prev_header;
        header.csid = csid;

        let mut raw_timestamp: u32 = 0;

        if format <= RTMP_CHUNK_TYPE_2 {
            raw_timestamp = BigEndian::read_u24(&buf[pos..pos + 3]);
        }

        if format <= RTMP_CHUNK_TYPE_1 {
            header.msg_len = BigEndian::read_u24(&buf[pos + 3..pos + 6]);
            header.msg_type_id = buf[pos + 6];
        }

        if format == RTMP_CHUNK_TYPE_0 {
            header.msg_stream_id = LittleEndian::read_u32(&buf[pos + 7..pos + 11]);
        }

        pos += header_size;

        let has_extended_timestamp = if format == RTMP_CHUNK_TYPE_3 {
            prev_extended
        } else {
            raw_timestamp == RTMP_EXTENDED_TIMESTAMP
        };

        let mut timestamp_value = raw_timestamp;

        if has_extended_timestamp {
            if buf.len() < pos + 4 {
                return Ok(None);
            }

            timestamp_value = BigEndian::read_u32(&buf[pos..pos + 4]);
            pos += 4;
        }

        let mut timestamp_delta = prev_delta;

        match format {
            RTMP_CHUNK_TYPE_0 => {
                header.timestamp_abs = timestamp_value;
                timestamp_delta = timestamp_value;
            }
            RTMP_CHUNK_TYPE_1 | RTMP_CHUNK_TYPE_2 => {
                timestamp_delta = timestamp_value;
                header.timestamp_abs = header.timestamp_abs.wrapping_add(timestamp_delta);
            }
            _ => {
                if starts_message {
                    header.timestamp_abs = header.timestamp_abs.wrapping_add(timestamp_delta);
                }
            }
        }

        if header.msg_len > self.max_message_size {
            return Err(StreamError::MalformedChunk(format!(
                "message length {} exceeds the limit of {}",
                header.msg_len, self.max_message_size
            )));
        }

        // Payload

        if collected > header.msg_len {
            return Err(StreamError::MalformedChunk(format!(
                "message length on csid {} shrank below the collected payload",
                csid
            )));
        }

        let take = (header.msg_len - collected).min(self.peer_chunk_size) as usize;

        if buf.len() < pos + take {
            return Ok(None);
        }

        // The whole chunk is available, commit

        let chunk_payload = self.buffer[pos..pos + take].to_vec();
        self.buffer.advance(pos + take);

        let stream = self.streams.entry(csid).or_default();

        stream.header = header;
        stream.timestamp_delta = timestamp_delta;
        stream.has_extended_timestamp = has_extended_timestamp;
        stream.payload.extend_from_slice(&chunk_payload);

        if stream.payload.len() < stream.header.msg_len as usize {
            return Ok(Some(None));
        }

        let payload: Bytes = stream.payload.split().freeze();

        let msg = AvMsg {
            header: stream.header.clone(),
            payload,
        };

        self.intercept_control(&msg)?;

        Ok(Some(Some(msg)))
    }

    /// Applies protocol control messages that affect framing
    fn intercept_control(&mut self, msg: &AvMsg) -> StreamResult<()> {
        match msg.header.msg_type_id {
            RTMP_TYPE_SET_CHUNK_SIZE => {
                if msg.payload.len() < 4 {
                    return Err(StreamError::MalformedChunk(
                        "truncated set chunk size".to_string(),
                    ));
                }

                let size = BigEndian::read_u32(&msg.payload[0..4]);

                if size == 0 || size > RTMP_MAX_CHUNK_SIZE {
                    return Err(StreamError::MalformedChunk(format!(
                        "invalid chunk size {}",
                        size
                    )));
                }

                self.peer_chunk_size = size;
            }
            RTMP_TYPE_ABORT => {
                if msg.payload.len() >= 4 {
                    let csid = BigEndian::read_u32(&msg.payload[0..4]);

                    if let Some(s) = self.streams.get_mut(&csid) {
                        s.payload.clear();
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Serializes a basic header for a chunk
///
/// # Arguments
///
/// * `format` - Chunk type
/// * `csid` - Chunk stream id
fn serialize_basic_header(out: &mut Vec<u8>, format: u8, csid: u32) {
    if csid >= 64 + 256 {
        let id = csid - 64;
        out.push((format << 6) | 1);
        out.push((id & 0xff) as u8);
        out.push(((id >> 8) & 0xff) as u8);
    } else if csid >= 64 {
        out.push(format << 6);
        out.push((csid - 64) as u8);
    } else {
        out.push((format << 6) | (csid as u8));
    }
}

/// Splits a message into chunks
///
/// Always one type 0 chunk followed by type 3 continuations,
/// so the output does not depend on what was sent before and
/// can be shared by every receiver of the message.
///
/// # Arguments
///
/// * `header` - Message header
/// * `payload` - Message payload
/// * `chunk_size` - Outgoing chunk size
pub fn message_to_chunks(header: &AvMsgHeader, payload: &[u8], chunk_size: u32) -> Vec<u8> {
    let chunk_size = chunk_size.max(1) as usize;
    let use_extended_timestamp = header.timestamp_abs >= RTMP_EXTENDED_TIMESTAMP;
    let chunk_count = if payload.is_empty() {
        1
    } else {
        payload.len().div_ceil(chunk_size)
    };

    let mut out: Vec<u8> = Vec::with_capacity(payload.len() + 18 + chunk_count * 8);

    serialize_basic_header(&mut out, RTMP_CHUNK_TYPE_0, header.csid);

    let mut b = [0u8; 4];

    BigEndian::write_u24(
        &mut b[0..3],
        header.timestamp_abs.min(RTMP_EXTENDED_TIMESTAMP),
    );
    out.extend_from_slice(&b[0..3]);

    BigEndian::write_u24(&mut b[0..3], payload.len() as u32);
    out.extend_from_slice(&b[0..3]);

    out.push(header.msg_type_id);

    LittleEndian::write_u32(&mut b, header.msg_stream_id);
    out.extend_from_slice(&b);

    BigEndian::write_u32(&mut b, header.timestamp_abs);

    if use_extended_timestamp {
        out.extend_from_slice(&b);
    }

    for (i, piece) in payload.chunks(chunk_size).enumerate() {
        if i > 0 {
            serialize_basic_header(&mut out, RTMP_CHUNK_TYPE_3, header.csid);

            if use_extended_timestamp {
                out.extend_from_slice(&b);
            }
        }

        out.extend_from_slice(piece);
    }

    out
}

/// Splits a message into chunks, returning shareable bytes
pub fn encode_av_msg(msg: &AvMsg, chunk_size: u32) -> Bytes {
    let mut header = msg.header.clone();
    header.msg_len = msg.payload.len() as u32;

    Bytes::from(message_to_chunks(&header, &msg.payload, chunk_size))
}

// Tests
