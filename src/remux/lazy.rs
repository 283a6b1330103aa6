// Per-message conversion memos

use bytes::Bytes;

use crate::{base::AvMsg, rtmp::encode_av_msg};

use super::av_msg_to_flv_tag;

/// Chunk stream bytes of one message, encoded on first use.
///
/// Lives on the fan-out stack for a single message; every RTMP
/// subscriber of that message receives the same buffer.
pub struct LazyChunkDivider<'a> {
    msg: &'a AvMsg,
    chunk_size: u32,
    chunks: Option<Bytes>,
}

impl<'a> LazyChunkDivider<'a> {
    pub fn new(msg: &'a AvMsg, chunk_size: u32) -> LazyChunkDivider<'a> {
        LazyChunkDivider {
            msg,
            chunk_size,
            chunks: None,
        }
    }

    pub fn get(&mut self) -> Bytes {
        self.chunks
            .get_or_insert_with(|| encode_av_msg(&self.msg.normalized(), self.chunk_size))
            .clone()
    }

    pub fn is_encoded(&self) -> bool {
        self.chunks.is_some()
    }
}

/// FLV tag bytes of one message, encoded on first use
pub struct LazyFlvTag<'a> {
    msg: &'a AvMsg,
    tag: Option<Bytes>,
}

impl<'a> LazyFlvTag<'a> {
    pub fn new(msg: &'a AvMsg) -> LazyFlvTag<'a> {
        LazyFlvTag { msg, tag: None }
    }

    pub fn get(&mut self) -> Bytes {
        self.tag
            .get_or_insert_with(|| av_msg_to_flv_tag(self.msg).encode())
            .clone()
    }
}

// Tests
