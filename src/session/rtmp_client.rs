// RTMP client sessions: relay pull and relay push

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};

use crate::{
    amf::{AMF0Value, AMFDecodingCursor},
    base::{AvMsg, StreamError, StreamResult},
    group::Group,
    log::Logger,
    log_debug, log_info,
    rtmp::{
        client_handshake, encode_av_msg, pack_connect, pack_create_stream, pack_play,
        pack_publish, pack_set_chunk_size, strip_set_data_frame, ChunkComposer, RtmpCommand,
        RTMP_TYPE_AUDIO, RTMP_TYPE_DATA, RTMP_TYPE_FLEX_MESSAGE, RTMP_TYPE_INVOKE,
        RTMP_TYPE_VIDEO,
    },
};

use super::SessionHandle;

/// Default RTMP port
const RTMP_DEFAULT_PORT: u16 = 1935;

/// Chunk size used by client sessions
const RTMP_CLIENT_CHUNK_SIZE: u32 = 4096;

/// Max time to connect and finish signalling
const RTMP_CLIENT_START_TIMEOUT_SECONDS: u64 = 10;

/// Size of the read buffer
const READ_BUFFER_SIZE: usize = 4096;

/// Parts of an rtmp:// URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtmpUrl {
    /// host:port to connect to
    pub host_port: String,

    /// Application name
    pub app: String,

    /// Stream name, including the query string if any
    pub stream: String,

    /// URL without the stream name
    pub tc_url: String,
}

impl RtmpUrl {
    /// Parses rtmp://host[:port]/app/stream[?query]
    pub fn parse(s: &str) -> StreamResult<RtmpUrl> {
        let url = url::Url::parse(s)
            .map_err(|e| StreamError::Config(format!("invalid URL {}: {}", s, e)))?;

        if url.scheme() != "rtmp" {
            return Err(StreamError::Config(format!("not an rtmp URL: {}", s)));
        }

        let host = match url.host_str() {
            Some(h) => h.to_string(),
            None => return Err(StreamError::Config(format!("URL without host: {}", s))),
        };

        let port = url.port().unwrap_or(RTMP_DEFAULT_PORT);

        let path = url.path().trim_start_matches('/');

        let (app, stream) = match path.rsplit_once('/') {
            Some((a, st)) if !a.is_empty() && !st.is_empty() => (a.to_string(), st.to_string()),
            _ => {
                return Err(StreamError::Config(format!(
                    "URL must have an app and a stream: {}",
                    s
                )))
            }
        };

        let stream = match url.query() {
            Some(q) if !q.is_empty() => format!("{}?{}", stream, q),
            _ => stream,
        };

        Ok(RtmpUrl {
            tc_url: format!("rtmp://{}:{}/{}", host, port, app),
            host_port: format!("{}:{}", host, port),
            app,
            stream,
        })
    }
}

/// Client side of an RTMP connection, after signalling
pub struct RtmpClientConnection<S> {
    stream: S,
    composer: ChunkComposer,
    stream_id: u32,
    pending: VecDeque<AvMsg>,
    read_buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> RtmpClientConnection<S> {
    /// Runs the handshake and signalling on a connected stream
    ///
    /// # Arguments
    ///
    /// * `stream` - Connected stream
    /// * `url` - Target
    /// * `publishing` - True to publish, false to play
    /// * `max_message_size` - Limit for incoming messages
    ///
    /// # Return value
    ///
    /// The connection, ready to send (publish) or receive (play) media.
    /// An error onStatus from the server becomes `Refused`.
    pub async fn start(
        mut stream: S,
        url: &RtmpUrl,
        publishing: bool,
        max_message_size: u32,
    ) -> StreamResult<RtmpClientConnection<S>> {
        client_handshake(&mut stream).await?;

        let mut conn = RtmpClientConnection {
            stream,
            composer: ChunkComposer::new(max_message_size),
            stream_id: 0,
            pending: VecDeque::new(),
            read_buf: vec![0; READ_BUFFER_SIZE],
        };

        conn.write_msgs(&[
            pack_set_chunk_size(RTMP_CLIENT_CHUNK_SIZE),
            pack_connect(&url.app, &url.tc_url, publishing),
        ])
        .await?;

        conn.wait_result(1.0).await?;

        conn.write_msgs(&[pack_create_stream(2.0)]).await?;

        let create_result = conn.wait_result(2.0).await?;

        conn.stream_id = create_result
            .args
            .first()
            .and_then(|a| a.get_float())
            .unwrap_or(1.0) as u32;

        let request = if publishing {
            pack_publish(&url.stream, conn.stream_id)
        } else {
            pack_play(&url.stream, conn.stream_id)
        };

        conn.write_msgs(&[request]).await?;

        conn.wait_start_status().await?;

        Ok(conn)
    }

    /// Message stream id given by the server
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    async fn read_more(&mut self) -> StreamResult<usize> {
        let n = self.stream.read(&mut self.read_buf).await?;

        if n == 0 {
            return Err(StreamError::closed());
        }

        let msgs = self.composer.feed(&self.read_buf[..n])?;
        self.pending.extend(msgs);

        Ok(n)
    }

    async fn next_command(&mut self) -> StreamResult<RtmpCommand> {
        loop {
            while let Some(msg) = self.pending.pop_front() {
                let t = msg.header.msg_type_id;

                if t == RTMP_TYPE_INVOKE || t == RTMP_TYPE_FLEX_MESSAGE {
                    return RtmpCommand::decode(&msg.payload, t);
                }
            }

            self.read_more().await?;
        }
    }

    async fn wait_result(&mut self, transaction_id: f64) -> StreamResult<RtmpCommand> {
        loop {
            let cmd = self.next_command().await?;

            if cmd.transaction_id != transaction_id {
                continue;
            }

            match cmd.name.as_str() {
                "_result" => return Ok(cmd),
                "_error" => {
                    return Err(StreamError::Refused(format!(
                        "command {} failed",
                        transaction_id
                    )))
                }
                _ => {}
            }
        }
    }

    async fn wait_start_status(&mut self) -> StreamResult<()> {
        loop {
            let cmd = self.next_command().await?;

            if cmd.name != "onStatus" {
                continue;
            }

            let info = cmd.args.first();

            let level = info
                .and_then(|i| i.get_property("level"))
                .and_then(|l| l.get_string())
                .unwrap_or("");

            let code = info
                .and_then(|i| i.get_property("code"))
                .and_then(|c| c.get_string())
                .unwrap_or("")
                .to_string();

            if level == "error" {
                return Err(StreamError::Refused(code));
            }

            if code == "NetStream.Publish.Start" || code == "NetStream.Play.Start" {
                return Ok(());
            }
        }
    }

    /// Reads the next batch of messages
    ///
    /// # Return value
    ///
    /// The messages and the number of bytes read from the socket
    pub async fn read_msgs(&mut self) -> StreamResult<(Vec<AvMsg>, usize)> {
        let mut n = 0;

        if self.pending.is_empty() {
            n = self.read_more().await?;
        }

        Ok((self.pending.drain(..).collect(), n))
    }

    /// Sends messages
    pub async fn write_msgs(&mut self, msgs: &[AvMsg]) -> StreamResult<usize> {
        let mut buf: Vec<u8> = Vec::new();

        for msg in msgs {
            buf.extend_from_slice(&encode_av_msg(msg, RTMP_CLIENT_CHUNK_SIZE));
        }

        self.stream.write_all(&buf).await?;

        Ok(buf.len())
    }

    /// Sends a media message on the stream given by the server
    pub async fn write_media(&mut self, msg: &AvMsg) -> StreamResult<usize> {
        let mut msg = msg.normalized();
        msg.header.msg_stream_id = self.stream_id;

        self.write_msgs(&[msg]).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Connects to the host of a URL and runs client signalling
async fn connect_rtmp_url(
    url: &RtmpUrl,
    publishing: bool,
    max_message_size: u32,
) -> StreamResult<RtmpClientConnection<TcpStream>> {
    let started = tokio::time::timeout(
        Duration::from_secs(RTMP_CLIENT_START_TIMEOUT_SECONDS),
        async {
            let tcp = TcpStream::connect(&url.host_port).await?;
            RtmpClientConnection::start(tcp, url, publishing, max_message_size).await
        },
    )
    .await;

    match started {
        Ok(r) => r,
        Err(_) => Err(StreamError::timed_out("RTMP client start")),
    }
}

/// Passes media and onMetaData, drops signalling
fn relay_media_filter(msg: AvMsg) -> Option<AvMsg> {
    match msg.header.msg_type_id {
        RTMP_TYPE_AUDIO | RTMP_TYPE_VIDEO => Some(msg),
        RTMP_TYPE_DATA => {
            let payload = strip_set_data_frame(&msg.payload).ok()?;

            let mut cursor = AMFDecodingCursor::new(&payload);

            match AMF0Value::read(&mut cursor) {
                Ok(v) if v.get_string() == Some("onMetaData") => Some(AvMsg::new_media(
                    RTMP_TYPE_DATA,
                    msg.header.timestamp_abs,
                    payload,
                )),
                _ => None,
            }
        }
        _ => None,
    }
}

///////////////////
//   Relay pull  //
///////////////////

/// Starts the task pulling a remote stream into a group
///
/// # Arguments
///
/// * `group` - Group fed by the pull
/// * `handle` - Handle installed as the group input
/// * `url` - rtmp:// URL to play
pub fn spawn_relay_pull(group: Arc<Group>, handle: Arc<SessionHandle>, url: String) {
    tokio::spawn(async move {
        let logger = Arc::new(
            group
                .logger()
                .make_child_logger(&format!("[RELAY-PULL #{}] ", handle.id())),
        );

        match run_relay_pull(&group, &handle, &url, &logger).await {
            Ok(()) => {
                log_debug!(logger, "Relay pull ended");
            }
            Err(e) => {
                log_info!(logger, format!("Relay pull from {} failed: {}", url, e));
            }
        }

        group.del_pub(handle.id()).await;
        handle.dispose();
    });
}

async fn run_relay_pull(
    group: &Arc<Group>,
    handle: &Arc<SessionHandle>,
    url: &str,
    logger: &Logger,
) -> StreamResult<()> {
    let rtmp_url = RtmpUrl::parse(url)?;

    let mut conn = tokio::select! {
        _ = handle.closed() => return Ok(()),
        c = connect_rtmp_url(&rtmp_url, false, group.config().max_message_size) => c?,
    };

    log_debug!(logger, format!("Playing {}", url));

    // Connecting does not count as idle time
    handle.add_read_bytes(0);

    loop {
        let (msgs, n) = tokio::select! {
            _ = handle.closed() => {
                conn.shutdown().await;
                return Ok(());
            }
            r = conn.read_msgs() => r?,
        };

        handle.add_read_bytes(n);

        for msg in msgs.into_iter().filter_map(relay_media_filter) {
            group.on_av_msg(handle.id(), msg).await;
        }
    }
}

///////////////////
//   Relay push  //
///////////////////

/// Keeps the timestamps of each track non-decreasing.
///
/// A timestamp lower than the previous one of the same
/// track is replaced by the previous one plus one.
#[derive(Default)]
pub struct TimestampMonotonizer {
    last_audio: Option<u32>,
    last_video: Option<u32>,
}

impl TimestampMonotonizer {
    pub fn new() -> TimestampMonotonizer {
        TimestampMonotonizer::default()
    }

    pub fn apply(&mut self, msg: AvMsg) -> AvMsg {
        let last = match msg.header.msg_type_id {
            RTMP_TYPE_AUDIO => &mut self.last_audio,
            RTMP_TYPE_VIDEO => &mut self.last_video,
            _ => return msg,
        };

        let ts = msg.header.timestamp_abs;

        match *last {
            Some(prev) if ts < prev => {
                let fixed = prev.wrapping_add(1);
                *last = Some(fixed);
                msg.with_timestamp(fixed)
            }
            _ => {
                *last = Some(ts);
                msg
            }
        }
    }
}

/// Starts the task pushing a group to a remote server
///
/// # Arguments
///
/// * `group` - Source group
/// * `handle` - Handle of the push output
/// * `url` - rtmp:// URL to publish to
/// * `receiver` - Messages fanned out by the group
pub fn spawn_relay_push(
    group: Arc<Group>,
    handle: Arc<SessionHandle>,
    url: String,
    receiver: mpsc::Receiver<AvMsg>,
) {
    tokio::spawn(async move {
        let logger = Arc::new(
            group
                .logger()
                .make_child_logger(&format!("[RELAY-PUSH #{}] ", handle.id())),
        );

        match run_relay_push(&group, &handle, &url, receiver, &logger).await {
            Ok(()) => {
                log_debug!(logger, "Relay push ended");
            }
            Err(e) => {
                log_info!(logger, format!("Relay push to {} failed: {}", url, e));
            }
        }

        group.del_relay_push(handle.id()).await;
        handle.dispose();
    });
}

async fn run_relay_push(
    group: &Arc<Group>,
    handle: &Arc<SessionHandle>,
    url: &str,
    mut receiver: mpsc::Receiver<AvMsg>,
    logger: &Logger,
) -> StreamResult<()> {
    let rtmp_url = RtmpUrl::parse(url)?;

    let mut conn = tokio::select! {
        _ = handle.closed() => return Ok(()),
        c = connect_rtmp_url(&rtmp_url, true, group.config().max_message_size) => c?,
    };

    log_debug!(logger, format!("Publishing to {}", url));

    let write_timeout = Duration::from_millis(group.config().write_timeout_ms.max(1));
    let mut monotonizer = TimestampMonotonizer::new();

    loop {
        let msg = tokio::select! {
            _ = handle.closed() => break,
            m = receiver.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };

        let msg = monotonizer.apply(msg);

        let n = match tokio::time::timeout(write_timeout, conn.write_media(&msg)).await {
            Ok(r) => r?,
            Err(_) => return Err(StreamError::timed_out("relay push write")),
        };

        handle.add_wrote_bytes(n);
    }

    conn.shutdown().await;

    Ok(())
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtmp_url_parse() {
        let u = RtmpUrl::parse("rtmp://127.0.0.1:19350/live/test110?sign=abc").unwrap();

        assert_eq!(u.host_port, "127.0.0.1:19350");
        assert_eq!(u.app, "live");
        assert_eq!(u.stream, "test110?sign=abc");
        assert_eq!(u.tc_url, "rtmp://127.0.0.1:19350/live");

        let d = RtmpUrl::parse("rtmp://example.com/live/test").unwrap();
        assert_eq!(d.host_port, "example.com:1935");

        assert!(RtmpUrl::parse("http://example.com/live/test").is_err());
        assert!(RtmpUrl::parse("rtmp://example.com/live").is_err());
    }

    #[test]
    fn test_timestamp_monotonizer() {
        let mut m = TimestampMonotonizer::new();

        let v = |ts| AvMsg::new_media(RTMP_TYPE_VIDEO, ts, bytes::Bytes::from_static(&[0x17, 1]));
        let a = |ts| AvMsg::new_media(RTMP_TYPE_AUDIO, ts, bytes::Bytes::from_static(&[0xaf, 1]));

        assert_eq!(m.apply(v(100)).header.timestamp_abs, 100);
        assert_eq!(m.apply(v(90)).header.timestamp_abs, 101);
        assert_eq!(m.apply(v(95)).header.timestamp_abs, 102);
        assert_eq!(m.apply(v(140)).header.timestamp_abs, 140);

        // Tracks are independent
        assert_eq!(m.apply(a(50)).header.timestamp_abs, 50);
        assert_eq!(m.apply(a(50)).header.timestamp_abs, 50);
    }

    #[test]
    fn test_relay_media_filter() {
        let mut meta = Vec::new();
        AMF0Value::string("@setDataFrame").write_to(&mut meta);
        AMF0Value::string("onMetaData").write_to(&mut meta);
        AMF0Value::Null.write_to(&mut meta);

        let msg = AvMsg::new_media(RTMP_TYPE_DATA, 0, bytes::Bytes::from(meta));
        let out = relay_media_filter(msg).unwrap();

        let mut cursor = AMFDecodingCursor::new(&out.payload);
        assert_eq!(AMF0Value::read(&mut cursor).unwrap().get_string(), Some("onMetaData"));

        let mut other = Vec::new();
        AMF0Value::string("|RtmpSampleAccess").write_to(&mut other);

        let other = AvMsg::new_media(RTMP_TYPE_DATA, 0, bytes::Bytes::from(other));
        assert!(relay_media_filter(other).is_none());
    }
}
