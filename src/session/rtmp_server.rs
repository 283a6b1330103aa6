// RTMP server session

use std::{sync::Arc, time::Duration};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, Mutex},
};

use crate::{
    amf::{AMF0Value, AMFDecodingCursor},
    base::{AvMsg, PubSubInfo, StreamError},
    group::Group,
    log::Logger,
    log_debug, log_info, log_trace,
    remux::FlvTagReader,
    rtmp::{
        pack_acknowledgement, pack_connect_result, pack_create_stream_result,
        pack_on_status_error, pack_on_status_play_start, pack_on_status_publish_start,
        pack_peer_bandwidth, pack_sample_access, pack_set_chunk_size, pack_stream_begin,
        pack_window_ack_size, server_handshake, strip_set_data_frame, ChunkComposer, RtmpCommand,
        RTMP_HANDSHAKE_TIMEOUT_SECONDS, RTMP_MSID_MEDIA, RTMP_PEER_BANDWIDTH,
        RTMP_PEER_BANDWIDTH_LIMIT_DYNAMIC, RTMP_TYPE_AGGREGATE, RTMP_TYPE_AUDIO, RTMP_TYPE_DATA,
        RTMP_TYPE_FLEX_MESSAGE, RTMP_TYPE_FLEX_STREAM, RTMP_TYPE_INVOKE, RTMP_TYPE_VIDEO,
        RTMP_TYPE_WINDOW_ACKNOWLEDGEMENT_SIZE, RTMP_WINDOW_ACK_SIZE,
    },
    server::{check_stream_sign, AuthTarget, ServerContext},
    utils::split_query,
};

use super::{session_write_bytes, session_write_msgs, SessionHandle, SessionProtocol};

/// Size of the read buffer
const READ_BUFFER_SIZE: usize = 4096;

/// Signalling state of a server session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtmpSessionState {
    WaitConnect,
    WaitCreateStream,
    WaitPublishOrPlay,
    Publishing,
    Playing,
}

impl RtmpSessionState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, RtmpSessionState::Publishing | RtmpSessionState::Playing)
    }
}

/// Server side of one RTMP connection
struct RtmpServerSession<TW: AsyncWrite + Send + Unpin + 'static> {
    logger: Arc<Logger>,
    ctx: ServerContext,
    session_id: u64,
    remote_addr: String,
    write_stream: Arc<Mutex<TW>>,

    state: RtmpSessionState,
    app_name: String,

    handle: Option<Arc<SessionHandle>>,
    group: Option<Arc<Group>>,

    /// Window announced by the peer, 0 until it sends one
    peer_window_ack_size: u32,
    total_read: u64,
    last_ack_sent_at: u64,
}

/// Handles an accepted RTMP connection until it closes
///
/// # Arguments
///
/// * `logger` - Server logger
/// * `ctx` - Server context
/// * `stream` - Accepted connection
/// * `remote_addr` - Address of the peer
pub async fn handle_rtmp_server_session<S>(
    logger: Arc<Logger>,
    ctx: ServerContext,
    mut stream: S,
    remote_addr: String,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session_id = ctx.session_id_generator.generate_id();
    let logger = Arc::new(logger.make_child_logger(&format!("[#{}] ", session_id)));

    log_debug!(logger, format!("Connection accepted from {}", remote_addr));

    ////////////////////
    //    Handshake   //
    ////////////////////

    if let Err(e) = server_handshake(&mut stream, &logger).await {
        log_debug!(logger, format!("BAD HANDSHAKE: {}", e));
        return;
    }

    log_trace!(logger, "Handshake successful. Entering main loop...");

    ////////////////////
    //    Main loop   //
    ////////////////////

    let (mut read_stream, write_stream) = tokio::io::split(stream);

    let mut session = RtmpServerSession {
        logger: logger.clone(),
        session_id,
        remote_addr,
        write_stream: Arc::new(Mutex::new(write_stream)),
        state: RtmpSessionState::WaitConnect,
        app_name: "".to_string(),
        handle: None,
        group: None,
        peer_window_ack_size: 0,
        total_read: 0,
        last_ack_sent_at: 0,
        ctx,
    };

    let mut composer = ChunkComposer::new(session.ctx.config.group.max_message_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match session.read_bytes(&mut read_stream, &mut buf).await {
            Some(n) => n,
            None => break,
        };

        let msgs = match composer.feed(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                log_debug!(logger, format!("Chunk read error: {}", e));
                break;
            }
        };

        let mut should_continue = true;

        for msg in msgs {
            if !session.handle_message(msg).await {
                should_continue = false;
                break;
            }
        }

        if !should_continue || !session.send_ack_if_needed(n).await {
            break;
        }
    }

    session.cleanup().await;

    log_debug!(logger, "Connection closed");
}

impl<TW: AsyncWrite + Send + Unpin + 'static> RtmpServerSession<TW> {
    /// Reads bytes from the peer
    ///
    /// Returns None when the connection ends, times out in signalling,
    /// or the session is disposed.
    async fn read_bytes<TR: AsyncRead + Unpin>(
        &self,
        read_stream: &mut TR,
        buf: &mut [u8],
    ) -> Option<usize> {
        let logger = &self.logger;
        let signalling = !self.state.is_streaming();

        let read = async {
            if signalling {
                tokio::time::timeout(
                    Duration::from_secs(RTMP_HANDSHAKE_TIMEOUT_SECONDS),
                    read_stream.read(buf),
                )
                .await
                .map_err(|_| StreamError::timed_out("signalling"))?
                .map_err(StreamError::from)
            } else {
                read_stream.read(buf).await.map_err(StreamError::from)
            }
        };

        let handle = self.handle.clone();

        let disposed = async move {
            match handle {
                Some(h) => h.closed().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = disposed => {
                log_debug!(logger, "Session disposed");
                None
            }
            r = read => match r {
                Ok(0) => None,
                Ok(n) => {
                    if let Some(h) = &self.handle {
                        h.add_read_bytes(n);
                    }
                    Some(n)
                }
                Err(e) => {
                    log_debug!(logger, format!("Read error: {}", e));
                    None
                }
            },
        }
    }

    /// Writes messages to the peer, returning false on error
    async fn send(&self, msgs: &[AvMsg]) -> bool {
        let logger = &self.logger;
        let chunk_size = self.ctx.config.group.chunk_size;

        match session_write_msgs(&self.write_stream, msgs, chunk_size).await {
            Ok(()) => true,
            Err(e) => {
                log_debug!(logger, format!("Send error: {}", e));
                false
            }
        }
    }

    /// Sends an Acknowledgement once the peer window is reached
    async fn send_ack_if_needed(&mut self, n: usize) -> bool {
        self.total_read += n as u64;

        if self.peer_window_ack_size == 0
            || self.total_read - self.last_ack_sent_at < self.peer_window_ack_size as u64
        {
            return true;
        }

        self.last_ack_sent_at = self.total_read;

        // The sequence number wraps at 32 bits
        self.send(&[pack_acknowledgement(self.total_read as u32)])
            .await
    }

    /// Handles a message. Returns false to close the session.
    async fn handle_message(&mut self, msg: AvMsg) -> bool {
        let logger = &self.logger;

        match msg.header.msg_type_id {
            RTMP_TYPE_WINDOW_ACKNOWLEDGEMENT_SIZE => {
                if msg.payload.len() >= 4 {
                    self.peer_window_ack_size = BigEndian::read_u32(&msg.payload[0..4]);
                }
                true
            }
            RTMP_TYPE_INVOKE | RTMP_TYPE_FLEX_MESSAGE => {
                match RtmpCommand::decode(&msg.payload, msg.header.msg_type_id) {
                    Ok(cmd) => self.handle_command(cmd).await,
                    Err(e) => {
                        log_debug!(logger, format!("Invalid command: {}", e));
                        false
                    }
                }
            }
            RTMP_TYPE_DATA | RTMP_TYPE_FLEX_STREAM => self.handle_data(msg).await,
            RTMP_TYPE_AUDIO | RTMP_TYPE_VIDEO => {
                if self.state == RtmpSessionState::Publishing {
                    self.publish(msg).await;
                }
                true
            }
            RTMP_TYPE_AGGREGATE => {
                if self.state == RtmpSessionState::Publishing {
                    for sub_msg in split_aggregate(&msg) {
                        self.publish(sub_msg).await;
                    }
                }
                true
            }
            t => {
                log_trace!(logger, format!("Ignored message of type {}", t));
                true
            }
        }
    }

    async fn publish(&self, msg: AvMsg) {
        if let Some(group) = &self.group {
            group.on_av_msg(self.session_id, msg).await;
        }
    }

    /// Passes onMetaData to the group, drops other data messages
    async fn handle_data(&mut self, msg: AvMsg) -> bool {
        if self.state != RtmpSessionState::Publishing {
            return true;
        }

        let is_flex = msg.header.msg_type_id == RTMP_TYPE_FLEX_STREAM;

        let payload = if is_flex && !msg.payload.is_empty() {
            msg.payload.slice(1..)
        } else {
            msg.payload.clone()
        };

        let payload = match strip_set_data_frame(&payload) {
            Ok(p) => p,
            Err(_) => return true,
        };

        let mut cursor = AMFDecodingCursor::new(&payload);

        let is_metadata = matches!(
            AMF0Value::read(&mut cursor),
            Ok(v) if v.get_string() == Some("onMetaData")
        );

        if is_metadata {
            self.publish(AvMsg::new_media(RTMP_TYPE_DATA, msg.header.timestamp_abs, payload))
                .await;
        }

        true
    }

    /// Handles a command. Returns false to close the session.
    async fn handle_command(&mut self, cmd: RtmpCommand) -> bool {
        let logger = &self.logger;

        log_trace!(logger, format!("Command: {}", cmd.name));

        match cmd.name.as_str() {
            "connect" => self.handle_connect(&cmd).await,
            "createStream" => self.handle_create_stream(&cmd).await,
            "publish" => self.handle_publish(&cmd).await,
            "play" => self.handle_play(&cmd).await,
            "deleteStream" | "closeStream" => {
                log_debug!(logger, format!("Stream closed by the peer ({})", cmd.name));
                false
            }
            _ => true,
        }
    }

    fn protocol_violation(&self, what: &str) -> bool {
        let logger = &self.logger;
        log_debug!(
            logger,
            format!(
                "{}",
                StreamError::ProtocolViolation(format!("{} in state {:?}", what, self.state))
            )
        );
        false
    }

    async fn handle_connect(&mut self, cmd: &RtmpCommand) -> bool {
        if self.state != RtmpSessionState::WaitConnect {
            return self.protocol_violation("connect");
        }

        let app = cmd
            .command_object
            .get_property("app")
            .and_then(|a| a.get_string())
            .unwrap_or("");

        let (app, _) = split_query(app);

        self.app_name = app.trim_matches('/').to_string();

        let object_encoding = cmd
            .command_object
            .get_property("objectEncoding")
            .and_then(|o| o.get_float());

        self.state = RtmpSessionState::WaitCreateStream;

        // SetChunkSize first, the result may need the bigger chunks
        self.send(&[
            pack_set_chunk_size(self.ctx.config.group.chunk_size),
            pack_window_ack_size(RTMP_WINDOW_ACK_SIZE),
            pack_peer_bandwidth(RTMP_PEER_BANDWIDTH, RTMP_PEER_BANDWIDTH_LIMIT_DYNAMIC),
            pack_connect_result(cmd.transaction_id, object_encoding),
        ])
        .await
    }

    async fn handle_create_stream(&mut self, cmd: &RtmpCommand) -> bool {
        match self.state {
            RtmpSessionState::WaitCreateStream | RtmpSessionState::WaitPublishOrPlay => {}
            _ => return self.protocol_violation("createStream"),
        }

        self.state = RtmpSessionState::WaitPublishOrPlay;

        self.send(&[pack_create_stream_result(cmd.transaction_id, RTMP_MSID_MEDIA)])
            .await
    }

    /// Reads the stream name and query of publish / play
    fn stream_name_arg(cmd: &RtmpCommand) -> Option<(String, String)> {
        let raw = cmd.get_string_arg(0)?;
        let (name, query) = split_query(raw);

        if name.is_empty() {
            return None;
        }

        Some((name.to_string(), query.to_string()))
    }

    fn make_info(
        &self,
        protocol: SessionProtocol,
        stream_name: &str,
        raw_query: &str,
    ) -> PubSubInfo {
        PubSubInfo {
            session_id: self.session_id,
            protocol: protocol.as_str().to_string(),
            app_name: self.app_name.clone(),
            stream_name: stream_name.to_string(),
            raw_query: raw_query.to_string(),
            remote_addr: self.remote_addr.clone(),
        }
    }

    /// Sends an error status and closes
    async fn refuse(&self, code: &str, error: &StreamError) -> bool {
        let logger = &self.logger;
        log_info!(logger, format!("Refused ({}): {}", code, error));

        self.send(&[pack_on_status_error(code, &error.to_string())])
            .await;

        false
    }

    async fn handle_publish(&mut self, cmd: &RtmpCommand) -> bool {
        if self.state != RtmpSessionState::WaitPublishOrPlay {
            return self.protocol_violation("publish");
        }

        let (stream_name, raw_query) = match Self::stream_name_arg(cmd) {
            Some(s) => s,
            None => return self.protocol_violation("publish without stream name"),
        };

        let auth = &self.ctx.config.auth;

        if let Err(e) = check_stream_sign(auth, AuthTarget::RtmpPub, &stream_name, &raw_query) {
            return self.refuse("NetStream.Publish.Unauthorized", &e).await;
        }

        let handle = Arc::new(SessionHandle::new(
            self.session_id,
            SessionProtocol::RtmpPub,
            &self.remote_addr,
            self.ctx.clock.clone(),
        ));

        let (group, _) = self.ctx.group_manager.get_or_create(&self.app_name, &stream_name);

        let info = self.make_info(SessionProtocol::RtmpPub, &stream_name, &raw_query);

        if let Err(e) = group.add_rtmp_pub(handle.clone(), info).await {
            let code = match e {
                StreamError::DupPublisher(_) => "NetStream.Publish.BadName",
                _ => "NetStream.Publish.Rejected",
            };

            return self.refuse(code, &e).await;
        }

        self.handle = Some(handle);
        self.group = Some(group);
        self.state = RtmpSessionState::Publishing;

        let logger = &self.logger;
        log_info!(logger, format!("Publishing {}/{}", self.app_name, stream_name));

        self.send(&[pack_on_status_publish_start()]).await
    }

    async fn handle_play(&mut self, cmd: &RtmpCommand) -> bool {
        if self.state != RtmpSessionState::WaitPublishOrPlay {
            return self.protocol_violation("play");
        }

        let (stream_name, raw_query) = match Self::stream_name_arg(cmd) {
            Some(s) => s,
            None => return self.protocol_violation("play without stream name"),
        };

        let auth = &self.ctx.config.auth;

        if let Err(e) = check_stream_sign(auth, AuthTarget::Sub, &stream_name, &raw_query) {
            return self.refuse("NetStream.Play.Unauthorized", &e).await;
        }

        let handle = Arc::new(SessionHandle::new(
            self.session_id,
            SessionProtocol::RtmpSub,
            &self.remote_addr,
            self.ctx.clock.clone(),
        ));

        let (group, _) = self.ctx.group_manager.get_or_create(&self.app_name, &stream_name);

        let info = self.make_info(SessionProtocol::RtmpSub, &stream_name, &raw_query);

        let receiver = match group.add_rtmp_sub(handle.clone(), info).await {
            Ok(r) => r,
            Err(e) => return self.refuse("NetStream.Play.Rejected", &e).await,
        };

        self.handle = Some(handle.clone());
        self.group = Some(group);
        self.state = RtmpSessionState::Playing;

        // Status messages go out before the writer starts draining media
        if !self
            .send(&[
                pack_stream_begin(RTMP_MSID_MEDIA),
                pack_on_status_play_start(),
                pack_sample_access(),
            ])
            .await
        {
            return false;
        }

        let logger = &self.logger;
        log_info!(logger, format!("Playing {}/{}", self.app_name, stream_name));

        spawn_subscriber_writer(
            self.logger.clone(),
            self.write_stream.clone(),
            handle,
            receiver,
            self.ctx.config.group.write_timeout_ms,
        );

        true
    }

    /// Leaves the group and closes the connection
    async fn cleanup(&mut self) {
        if let (Some(group), Some(handle)) = (&self.group, &self.handle) {
            match self.state {
                RtmpSessionState::Publishing => group.del_pub(handle.id()).await,
                RtmpSessionState::Playing => group.del_sub(handle.id()).await,
                _ => {}
            }

            handle.dispose();
        }

        let mut write_stream = self.write_stream.lock().await;
        let _ = write_stream.shutdown().await;
    }
}

/// Starts the task draining a subscriber channel into the connection
///
/// The task disposes the handle when the channel closes or a write fails.
///
/// # Arguments
///
/// * `logger` - Session logger
/// * `write_stream` - Connection write half
/// * `handle` - Subscriber handle
/// * `receiver` - Channel filled by the group
/// * `write_timeout_ms` - Max time for one write (0 = no limit)
pub fn spawn_subscriber_writer<TW: AsyncWrite + Send + Unpin + 'static>(
    logger: Arc<Logger>,
    write_stream: Arc<Mutex<TW>>,
    handle: Arc<SessionHandle>,
    mut receiver: mpsc::Receiver<Bytes>,
    write_timeout_ms: u64,
) {
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = handle.closed() => break,
                item = receiver.recv() => match item {
                    Some(i) => i,
                    None => break,
                },
            };

            let written = if write_timeout_ms > 0 {
                match tokio::time::timeout(
                    Duration::from_millis(write_timeout_ms),
                    session_write_bytes(&write_stream, &item),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
                }
            } else {
                session_write_bytes(&write_stream, &item).await
            };

            if let Err(e) = written {
                log_debug!(logger, format!("Write error: {}", e));
                break;
            }

            handle.add_wrote_bytes(item.len());
        }

        handle.dispose();
    });
}

/// Splits an aggregate message into its FLV tags
///
/// Sub-message timestamps are rebased on the aggregate timestamp.
fn split_aggregate(msg: &AvMsg) -> Vec<AvMsg> {
    let mut reader = FlvTagReader::new();

    let tags = match reader.feed(&msg.payload) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };

    let first_ts = match tags.first() {
        Some(t) => t.header.timestamp,
        None => return Vec::new(),
    };

    tags.into_iter()
        .map(|tag| {
            let sub = tag.into_av_msg();
            let ts = msg
                .header
                .timestamp_abs
                .wrapping_add(sub.header.timestamp_abs.wrapping_sub(first_ts));
            sub.with_timestamp(ts)
        })
        .collect()
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::VIDEO_CODEC_ID_AVC,
        codec::{avc_test_util::make_avc_sps, AvcDecoderConfig},
        remux::{av_msg_to_flv_tag, make_aac_payload, make_video_payload},
        server::test_server_context,
        session::{RtmpClientConnection, RtmpUrl},
    };

    fn test_url(stream: &str) -> RtmpUrl {
        RtmpUrl::parse(&format!("rtmp://127.0.0.1:1935/live/{}", stream)).unwrap()
    }

    fn start_server_session(ctx: &ServerContext) -> tokio::io::DuplexStream {
        let (client, server) = tokio::io::duplex(1 << 20);

        tokio::spawn(handle_rtmp_server_session(
            Arc::new(Logger::new_disabled()),
            ctx.clone(),
            server,
            "127.0.0.1:50000".to_string(),
        ));

        client
    }

    fn avc_seq_header() -> AvMsg {
        let record = AvcDecoderConfig::build(&make_avc_sps(80, 45, 0), &[0x68, 0xce, 0x3c, 0x80]);
        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        )
    }

    #[tokio::test]
    async fn test_publish_and_play() {
        let ctx = test_server_context();

        let mut publisher = RtmpClientConnection::start(
            start_server_session(&ctx),
            &test_url("test110"),
            true,
            1 << 20,
        )
        .await
        .unwrap();

        publisher.write_media(&avc_seq_header()).await.unwrap();
        publisher
            .write_media(&AvMsg::new_media(
                RTMP_TYPE_AUDIO,
                0,
                make_aac_payload(0, &[0x12, 0x10]),
            ))
            .await
            .unwrap();

        let mut player = RtmpClientConnection::start(
            start_server_session(&ctx),
            &test_url("test110"),
            false,
            1 << 20,
        )
        .await
        .unwrap();

        let key = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            40,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 1, 0, &[0, 0, 0, 2, 0x65, 0x88]),
        );

        // The publisher message may race the subscriber admission
        let mut received: Vec<AvMsg> = Vec::new();

        for _ in 0..50 {
            publisher.write_media(&key).await.unwrap();

            let (msgs, _) = tokio::time::timeout(Duration::from_secs(5), player.read_msgs())
                .await
                .unwrap()
                .unwrap();

            received.extend(msgs.into_iter().filter(|m| m.is_audio() || m.is_video()));

            if received.iter().any(|m| m.is_video_key_frame()) {
                break;
            }
        }

        // Sequence headers come before the first keyframe
        assert!(received[0].is_seq_header());
        assert!(received.iter().any(|m| m.is_video_key_frame()));

        let (group, _) = ctx.group_manager.get_or_create("live", "test110");
        let stat = group.stat().await;

        assert_eq!(stat.video_codec, "H264");
        assert_eq!((stat.video_width, stat.video_height), (1280, 720));
        assert_eq!(stat.subscribers.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_refused() {
        let ctx = test_server_context();

        let _first = RtmpClientConnection::start(
            start_server_session(&ctx),
            &test_url("dup"),
            true,
            1 << 20,
        )
        .await
        .unwrap();

        let second = RtmpClientConnection::start(
            start_server_session(&ctx),
            &test_url("dup"),
            true,
            1 << 20,
        )
        .await;

        match second {
            Err(StreamError::Refused(code)) => assert_eq!(code, "NetStream.Publish.BadName"),
            _ => panic!("second publisher must be refused"),
        }
    }

    #[test]
    fn test_split_aggregate() {
        let a = AvMsg::new_media(RTMP_TYPE_AUDIO, 1000, make_aac_payload(1, &[1, 2, 3]));
        let v = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            1040,
            make_video_payload(VIDEO_CODEC_ID_AVC, false, 1, 0, &[0, 0, 0, 1, 0x41]),
        );

        let mut payload = Vec::new();
        payload.extend_from_slice(&av_msg_to_flv_tag(&a).encode());
        payload.extend_from_slice(&av_msg_to_flv_tag(&v).encode());

        let agg = AvMsg::new_media(RTMP_TYPE_AGGREGATE, 5000, Bytes::from(payload));
        let parts = split_aggregate(&agg);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].header.timestamp_abs, 5000);
        assert_eq!(parts[1].header.timestamp_abs, 5040);
        assert!(parts[1].is_video());
        assert_eq!(parts[1].payload, v.payload);
    }
}
