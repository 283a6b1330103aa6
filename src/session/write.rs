// Session write utilities

use std::io::Error;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{base::AvMsg, rtmp::encode_av_msg};

/// Writes bytes to the session write stream
///
/// # Arguments
///
/// * `write_stream` - The stream to write to the peer
/// * `bytes` - The bytes to write
pub async fn session_write_bytes<TW: AsyncWrite + Send + Unpin>(
    write_stream: &Mutex<TW>,
    bytes: &[u8],
) -> Result<(), Error> {
    let mut write_stream_v = write_stream.lock().await;

    (*write_stream_v).write_all(bytes).await
}

/// Writes RTMP messages as chunks, in one locked write
///
/// # Arguments
///
/// * `write_stream` - The stream to write to the peer
/// * `msgs` - Messages to send, in order
/// * `chunk_size` - Local chunk size
pub async fn session_write_msgs<TW: AsyncWrite + Send + Unpin>(
    write_stream: &Mutex<TW>,
    msgs: &[AvMsg],
    chunk_size: u32,
) -> Result<(), Error> {
    let mut buf: Vec<u8> = Vec::new();

    for msg in msgs {
        buf.extend_from_slice(&encode_av_msg(msg, chunk_size));
    }

    session_write_bytes(write_stream, &buf).await
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::{pack_set_chunk_size, ChunkComposer, RTMP_TYPE_SET_CHUNK_SIZE};

    #[tokio::test]
    async fn test_session_write_msgs() {
        let write_stream = Mutex::new(Vec::<u8>::new());

        session_write_msgs(&write_stream, &[pack_set_chunk_size(4096)], 128)
            .await
            .unwrap();

        let written = write_stream.lock().await.clone();

        let mut composer = ChunkComposer::new(1024);
        let msgs = composer.feed(&written).unwrap();

        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.msg_type_id, RTMP_TYPE_SET_CHUNK_SIZE);
        assert_eq!(composer.peer_chunk_size(), 4096);
    }
}
