// RTSP server session

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use rtsp_types::{headers, Method, StatusCode, Url};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::{
    base::{PubSubInfo, StreamError},
    group::{Group, RtpBatch},
    log::Logger,
    log_debug, log_info, log_trace,
    remux::{
        rtp::{AvPacketRemuxer, RtpPacket, RtpUnpacker},
        SdpContext, SdpMedia,
    },
    server::{check_stream_sign, AuthTarget, ServerContext},
    session::{session_write_bytes, SessionHandle, SessionProtocol},
};

use super::{
    body_response, empty_response, encode_interleaved, encode_response, parse_stream_uri,
    response_to, RtspItem, RtspReader, RtspRequest, RtspResponse, RtspTransport,
};

/// Size of the read buffer
const READ_BUFFER_SIZE: usize = 4096;

/// Time allowed between two requests before streaming starts
const RTSP_SIGNALLING_TIMEOUT_SECONDS: u64 = 10;

/// Session timeout announced to clients
const RTSP_SESSION_TIMEOUT_SECONDS: u32 = 60;

/// Capacity of the channel carrying UDP packets to the session
const RTSP_UDP_CHANNEL_SIZE: usize = 256;

/// Max size of a received UDP packet
const RTSP_UDP_MAX_PACKET_SIZE: usize = 2048;

const RTSP_PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RtspState {
    Init,
    Announced,
    Recording,
    Described,
    Playing,
}

impl RtspState {
    fn is_streaming(&self) -> bool {
        matches!(self, RtspState::Recording | RtspState::Playing)
    }
}

/// Transport of a set up track
#[derive(Clone)]
enum TrackTransport {
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
    Udp {
        rtp_socket: Arc<UdpSocket>,

        // Kept bound for the lifetime of the session
        _rtcp_socket: Arc<UdpSocket>,

        peer_rtp: SocketAddr,
    },
}

struct RtspTrack {
    is_video: bool,
    payload_type: u8,
    transport: TrackTransport,

    /// Publisher tracks only
    unpacker: Option<RtpUnpacker>,
}

/// Server side of one RTSP connection
struct RtspServerSession<TW: AsyncWrite + Send + Unpin + 'static> {
    logger: Arc<Logger>,
    ctx: ServerContext,
    session_id: u64,
    remote_addr: String,
    rtsp_session: String,
    write_stream: Arc<Mutex<TW>>,

    state: RtspState,
    app_name: String,
    stream_name: String,
    raw_query: String,

    group: Option<Arc<Group>>,
    handle: Option<Arc<SessionHandle>>,

    sdp: Option<SdpContext>,
    tracks: Vec<RtspTrack>,
    remuxer: Option<AvPacketRemuxer>,

    udp_sender: mpsc::Sender<(usize, Bytes)>,
    udp_tasks: Vec<JoinHandle<()>>,
}

enum RtspEvent {
    Read(usize),
    Udp(usize, Bytes),
    End,
}

/// Handles an accepted RTSP connection until it closes
///
/// # Arguments
///
/// * `logger` - Listener logger
/// * `ctx` - Server context
/// * `stream` - Accepted connection
/// * `remote_addr` - Address of the peer
pub async fn handle_rtsp_server_session<S>(
    logger: Arc<Logger>,
    ctx: ServerContext,
    stream: S,
    remote_addr: String,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session_id = ctx.session_id_generator.generate_id();
    let logger = Arc::new(logger.make_child_logger(&format!("[#{}] ", session_id)));

    log_debug!(logger, format!("Connection accepted from {}", remote_addr));

    let (mut read_stream, write_stream) = tokio::io::split(stream);
    let (udp_sender, mut udp_receiver) = mpsc::channel::<(usize, Bytes)>(RTSP_UDP_CHANNEL_SIZE);

    let mut session = RtspServerSession {
        logger: logger.clone(),
        session_id,
        remote_addr,
        rtsp_session: format!("{:016X}", rand::random::<u64>()),
        write_stream: Arc::new(Mutex::new(write_stream)),
        state: RtspState::Init,
        app_name: "".to_string(),
        stream_name: "".to_string(),
        raw_query: "".to_string(),
        group: None,
        handle: None,
        sdp: None,
        tracks: Vec::new(),
        remuxer: None,
        udp_sender,
        udp_tasks: Vec::new(),
        ctx,
    };

    let mut reader = RtspReader::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let signalling = !session.state.is_streaming();
        let handle = session.handle.clone();

        let disposed = async move {
            match handle {
                Some(h) => h.closed().await,
                None => std::future::pending::<()>().await,
            }
        };

        let read = async {
            if signalling {
                match tokio::time::timeout(
                    Duration::from_secs(RTSP_SIGNALLING_TIMEOUT_SECONDS),
                    read_stream.read(&mut buf),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
                }
            } else {
                read_stream.read(&mut buf).await
            }
        };

        let event = tokio::select! {
            _ = disposed => RtspEvent::End,
            r = read => match r {
                Ok(0) => RtspEvent::End,
                Ok(n) => RtspEvent::Read(n),
                Err(e) => {
                    log_debug!(logger, format!("Read error: {}", e));
                    RtspEvent::End
                }
            },
            Some((track, data)) = udp_receiver.recv() => RtspEvent::Udp(track, data),
        };

        match event {
            RtspEvent::End => break,
            RtspEvent::Udp(track, data) => {
                session.handle_rtp(track, data).await;
            }
            RtspEvent::Read(n) => {
                if let Some(h) = &session.handle {
                    h.add_read_bytes(n);
                }

                let items = match reader.feed(&buf[..n]) {
                    Ok(i) => i,
                    Err(e) => {
                        log_debug!(logger, format!("Invalid RTSP data: {}", e));
                        break;
                    }
                };

                let mut should_continue = true;

                for item in items {
                    if !session.handle_item(item).await {
                        should_continue = false;
                        break;
                    }
                }

                if !should_continue {
                    break;
                }
            }
        }
    }

    session.cleanup().await;

    log_debug!(logger, "Connection closed");
}

impl<TW: AsyncWrite + Send + Unpin + 'static> RtspServerSession<TW> {
    async fn handle_item(&mut self, item: RtspItem) -> bool {
        match item {
            RtspItem::Request(request) => self.handle_request(request).await,
            RtspItem::Response(_) => true,
            RtspItem::Interleaved { channel, data } => {
                // Receiver reports on the RTCP channels are not used
                let track = self.tracks.iter().position(|t| match t.transport {
                    TrackTransport::Interleaved {
                        rtp_channel,
                        rtcp_channel,
                    } => rtp_channel == channel && rtcp_channel != channel,
                    TrackTransport::Udp { .. } => false,
                });

                if let Some(track) = track {
                    self.handle_rtp(track, data).await;
                }

                true
            }
        }
    }

    /// Depacketizes an RTP packet of a publisher track
    async fn handle_rtp(&mut self, track: usize, data: Bytes) {
        if self.state != RtspState::Recording {
            return;
        }

        let logger = &self.logger;

        let pkt = match RtpPacket::parse(&data) {
            Ok(p) => p,
            Err(e) => {
                log_trace!(logger, format!("Invalid RTP packet: {}", e));
                return;
            }
        };

        let unpacker = match self.tracks.get_mut(track).and_then(|t| t.unpacker.as_mut()) {
            Some(u) => u,
            None => return,
        };

        let packets = match unpacker.feed(&pkt) {
            Ok(p) => p,
            Err(e) => {
                log_trace!(logger, format!("RTP depacketization error: {}", e));
                return;
            }
        };

        let remuxer = match self.remuxer.as_mut() {
            Some(r) => r,
            None => return,
        };

        let mut msgs = Vec::new();

        for packet in packets {
            match remuxer.feed(&packet) {
                Ok(m) => msgs.extend(m),
                Err(e) => {
                    log_trace!(logger, format!("Invalid access unit: {}", e));
                }
            }
        }

        if let Some(group) = &self.group {
            for msg in msgs {
                group.on_av_msg(self.session_id, msg).await;
            }
        }
    }

    async fn send(&self, response: RtspResponse) -> bool {
        let logger = &self.logger;

        let data = match encode_response(response) {
            Ok(d) => d,
            Err(e) => {
                log_debug!(logger, format!("Could not encode response: {}", e));
                return false;
            }
        };

        match session_write_bytes(&self.write_stream, &data).await {
            Ok(()) => true,
            Err(e) => {
                log_debug!(logger, format!("Send error: {}", e));
                false
            }
        }
    }

    /// Sends an error response. The connection stays open.
    async fn send_error(&self, request: &RtspRequest, status: StatusCode) -> bool {
        let logger = &self.logger;
        log_debug!(
            logger,
            format!("{:?} {} -> {:?}", request.method(), request_uri_str(request), status)
        );

        self.send(empty_response(response_to(request, status))).await
    }

    /// Plain OK carrying the session header
    fn ok_with_session(&self, request: &RtspRequest) -> RtspResponse {
        empty_response(
            response_to(request, StatusCode::Ok).header(headers::SESSION, self.session_header()),
        )
    }

    fn session_header(&self) -> String {
        format!("{};timeout={}", self.rtsp_session, RTSP_SESSION_TIMEOUT_SECONDS)
    }

    async fn handle_request(&mut self, request: RtspRequest) -> bool {
        let logger = &self.logger;
        log_trace!(logger, format!("{:?} {}", request.method(), request_uri_str(&request)));

        match request.method() {
            Method::Options => {
                let response = response_to(&request, StatusCode::Ok)
                    .header(headers::PUBLIC, RTSP_PUBLIC_METHODS);
                self.send(empty_response(response)).await
            }
            Method::Announce => self.handle_announce(&request).await,
            Method::Describe => self.handle_describe(&request).await,
            Method::Setup => self.handle_setup(&request).await,
            Method::Record => self.handle_record(&request).await,
            Method::Play => self.handle_play(&request).await,
            Method::Teardown => {
                self.send(self.ok_with_session(&request)).await;
                false
            }
            Method::GetParameter | Method::SetParameter => {
                self.send(self.ok_with_session(&request)).await
            }
            _ => self.send_error(&request, StatusCode::NotImplemented).await,
        }
    }

    fn set_stream(&mut self, uri: Option<&Url>) -> bool {
        match uri.and_then(parse_stream_uri) {
            Some((app, stream, query)) => {
                self.app_name = app;
                self.stream_name = stream;
                self.raw_query = query;
                true
            }
            None => false,
        }
    }

    fn make_info(&self, protocol: SessionProtocol) -> PubSubInfo {
        PubSubInfo {
            session_id: self.session_id,
            protocol: protocol.as_str().to_string(),
            app_name: self.app_name.clone(),
            stream_name: self.stream_name.clone(),
            raw_query: self.raw_query.clone(),
            remote_addr: self.remote_addr.clone(),
        }
    }

    fn new_handle(&self, protocol: SessionProtocol) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(
            self.session_id,
            protocol,
            &self.remote_addr,
            self.ctx.clock.clone(),
        ))
    }

    async fn handle_announce(&mut self, request: &RtspRequest) -> bool {
        if self.state != RtspState::Init {
            return self.send_error(request, StatusCode::MethodNotValidInThisState).await;
        }

        if !self.set_stream(request.request_uri()) {
            return self.send_error(request, StatusCode::BadRequest).await;
        }

        let sdp = match SdpContext::parse(&String::from_utf8_lossy(request.body())) {
            Ok(s) => s,
            Err(e) => {
                let logger = &self.logger;
                log_debug!(logger, format!("Invalid SDP: {}", e));
                return self.send_error(request, StatusCode::BadRequest).await;
            }
        };

        let auth = &self.ctx.config.auth;

        if let Err(e) =
            check_stream_sign(auth, AuthTarget::OtherPub, &self.stream_name, &self.raw_query)
        {
            let logger = &self.logger;
            log_info!(logger, format!("Refused: {}", e));
            self.send_error(request, StatusCode::Unauthorized).await;
            return false;
        }

        let handle = self.new_handle(SessionProtocol::RtspPub);
        let (group, _) = self.ctx.group_manager.get_or_create(&self.app_name, &self.stream_name);

        let info = self.make_info(SessionProtocol::RtspPub);

        if let Err(e) = group.add_rtsp_pub(handle.clone(), info).await {
            let logger = &self.logger;
            log_info!(logger, format!("Refused: {}", e));

            let status = match e {
                StreamError::DupPublisher(_) => StatusCode::NotAcceptable,
                _ => StatusCode::Forbidden,
            };

            self.send_error(request, status).await;
            return false;
        }

        let logger = &self.logger;
        log_info!(logger, format!("Announced {}/{}", self.app_name, self.stream_name));

        self.remuxer = Some(AvPacketRemuxer::new(&sdp));
        self.sdp = Some(sdp);
        self.group = Some(group);
        self.handle = Some(handle);
        self.state = RtspState::Announced;

        self.send(empty_response(response_to(request, StatusCode::Ok))).await
    }

    async fn handle_describe(&mut self, request: &RtspRequest) -> bool {
        if self.state != RtspState::Init && self.state != RtspState::Described {
            return self.send_error(request, StatusCode::MethodNotValidInThisState).await;
        }

        if !self.set_stream(request.request_uri()) {
            return self.send_error(request, StatusCode::BadRequest).await;
        }

        let auth = &self.ctx.config.auth;

        if let Err(e) =
            check_stream_sign(auth, AuthTarget::Sub, &self.stream_name, &self.raw_query)
        {
            let logger = &self.logger;
            log_info!(logger, format!("Refused: {}", e));
            return self.send_error(request, StatusCode::Unauthorized).await;
        }

        let (group, _) = self.ctx.group_manager.get_or_create(&self.app_name, &self.stream_name);

        let sdp = match group.describe_sdp().await {
            Some(s) => s,
            None => return self.send_error(request, StatusCode::NotFound).await,
        };

        let content_base = format!("{}/", request_uri_str(request).trim_end_matches('/'));

        let response = body_response(
            response_to(request, StatusCode::Ok).header(headers::CONTENT_BASE, content_base),
            "application/sdp",
            sdp.raw.clone().into_bytes(),
        );

        self.sdp = Some(sdp);
        self.group = Some(group);
        self.state = RtspState::Described;

        self.send(response).await
    }

    /// Finds the media section designated by a SETUP URL
    fn find_media(&self, uri: &str) -> Option<(bool, SdpMedia)> {
        let sdp = self.sdp.as_ref()?;

        if let Some(v) = sdp.video.as_ref().filter(|m| m.matches_control(uri)) {
            return Some((true, v.clone()));
        }

        if let Some(a) = sdp.audio.as_ref().filter(|m| m.matches_control(uri)) {
            return Some((false, a.clone()));
        }

        // Single track descriptions may omit the control attribute
        match (&sdp.video, &sdp.audio) {
            (Some(v), None) => Some((true, v.clone())),
            (None, Some(a)) => Some((false, a.clone())),
            _ => None,
        }
    }

    async fn handle_setup(&mut self, request: &RtspRequest) -> bool {
        if self.state != RtspState::Announced && self.state != RtspState::Described {
            return self.send_error(request, StatusCode::MethodNotValidInThisState).await;
        }

        let (is_video, media) = match self.find_media(request_uri_str(request)) {
            Some(m) => m,
            None => return self.send_error(request, StatusCode::NotFound).await,
        };

        let transport = match RtspTransport::from_request(request) {
            Ok(t) => t,
            Err(_) => return self.send_error(request, StatusCode::UnsupportedTransport).await,
        };

        let (track_transport, transport_header) = match transport {
            RtspTransport::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => (
                TrackTransport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                },
                format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{}",
                    rtp_channel, rtcp_channel
                ),
            ),
            RtspTransport::Udp { rtp_port, rtcp_port } => {
                let peer_ip = match self.remote_addr.parse::<SocketAddr>() {
                    Ok(a) => a.ip(),
                    Err(_) => {
                        return self.send_error(request, StatusCode::UnsupportedTransport).await
                    }
                };

                let (rtp_socket, rtcp_socket) = match bind_udp_pair(peer_ip).await {
                    Ok(p) => p,
                    Err(e) => {
                        let logger = &self.logger;
                        log_debug!(logger, format!("Could not bind UDP ports: {}", e));
                        return self.send_error(request, StatusCode::InternalServerError).await;
                    }
                };

                let server_rtp = rtp_socket.local_addr().map(|a| a.port()).unwrap_or(0);
                let server_rtcp = rtcp_socket.local_addr().map(|a| a.port()).unwrap_or(0);

                (
                    TrackTransport::Udp {
                        rtp_socket: Arc::new(rtp_socket),
                        _rtcp_socket: Arc::new(rtcp_socket),
                        peer_rtp: SocketAddr::new(peer_ip, rtp_port),
                    },
                    format!(
                        "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                        rtp_port, rtcp_port, server_rtp, server_rtcp
                    ),
                )
            }
        };

        let unpacker = if self.state == RtspState::Announced {
            media
                .unpacker_codec()
                .map(|codec| RtpUnpacker::new(codec, media.clock_rate))
        } else {
            None
        };

        let track = RtspTrack {
            is_video,
            payload_type: media.payload_type,
            transport: track_transport,
            unpacker,
        };

        // A second SETUP of a track replaces it
        self.tracks.retain(|t| t.is_video != is_video);
        self.tracks.push(track);

        let response = response_to(request, StatusCode::Ok)
            .header(headers::TRANSPORT, transport_header)
            .header(headers::SESSION, self.session_header());

        self.send(empty_response(response)).await
    }

    async fn handle_record(&mut self, request: &RtspRequest) -> bool {
        if self.state != RtspState::Announced || self.tracks.is_empty() {
            return self.send_error(request, StatusCode::MethodNotValidInThisState).await;
        }

        for (index, track) in self.tracks.iter().enumerate() {
            if let TrackTransport::Udp { rtp_socket, .. } = &track.transport {
                self.udp_tasks.push(spawn_udp_receiver(
                    index,
                    rtp_socket.clone(),
                    self.udp_sender.clone(),
                ));
            }
        }

        self.state = RtspState::Recording;

        let logger = &self.logger;
        log_info!(logger, format!("Recording {}/{}", self.app_name, self.stream_name));

        self.send(self.ok_with_session(request)).await
    }

    async fn handle_play(&mut self, request: &RtspRequest) -> bool {
        if self.state != RtspState::Described || self.tracks.is_empty() {
            return self.send_error(request, StatusCode::MethodNotValidInThisState).await;
        }

        let group = match &self.group {
            Some(g) => g.clone(),
            None => {
                return self.send_error(request, StatusCode::MethodNotValidInThisState).await
            }
        };

        let handle = self.new_handle(SessionProtocol::RtspSub);

        let info = self.make_info(SessionProtocol::RtspSub);

        let receiver = match group.add_rtsp_sub(handle.clone(), info).await {
            Ok(r) => r,
            Err(e) => {
                let logger = &self.logger;
                log_info!(logger, format!("Refused: {}", e));
                self.send_error(request, StatusCode::Forbidden).await;
                return false;
            }
        };

        self.handle = Some(handle.clone());
        self.state = RtspState::Playing;

        let logger = &self.logger;
        log_info!(logger, format!("Playing {}/{}", self.app_name, self.stream_name));

        // The response goes out before the writer starts draining packets
        let response = response_to(request, StatusCode::Ok)
            .header(headers::SESSION, self.session_header())
            .header(headers::RANGE, "npt=0.000-");

        if !self.send(empty_response(response)).await {
            return false;
        }

        let outputs: Vec<(u8, TrackTransport)> = self
            .tracks
            .iter()
            .map(|t| (t.payload_type, t.transport.clone()))
            .collect();

        spawn_rtp_writer(
            self.logger.clone(),
            self.write_stream.clone(),
            handle,
            receiver,
            outputs,
            self.ctx.config.group.write_timeout_ms,
        );

        true
    }

    async fn cleanup(&mut self) {
        for task in self.udp_tasks.drain(..) {
            task.abort();
        }

        if let (Some(group), Some(handle)) = (&self.group, &self.handle) {
            match self.state {
                RtspState::Announced | RtspState::Recording => group.del_pub(handle.id()).await,
                RtspState::Playing => group.del_sub(handle.id()).await,
                _ => {}
            }

            handle.dispose();
        }

        let mut write_stream = self.write_stream.lock().await;
        let _ = write_stream.shutdown().await;
    }
}

/// Request URL as text, empty for `*`
fn request_uri_str(request: &RtspRequest) -> &str {
    request.request_uri().map(|u| u.as_str()).unwrap_or("")
}

/// Binds the server RTP / RTCP sockets of a UDP track
async fn bind_udp_pair(peer_ip: IpAddr) -> std::io::Result<(UdpSocket, UdpSocket)> {
    let any: IpAddr = if peer_ip.is_ipv4() {
        IpAddr::from([0, 0, 0, 0])
    } else {
        IpAddr::from([0u16; 8])
    };

    let rtp = UdpSocket::bind(SocketAddr::new(any, 0)).await?;
    let rtcp = UdpSocket::bind(SocketAddr::new(any, 0)).await?;

    Ok((rtp, rtcp))
}

/// Forwards the packets received on a publisher UDP socket to the session
fn spawn_udp_receiver(
    track: usize,
    socket: Arc<UdpSocket>,
    sender: mpsc::Sender<(usize, Bytes)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTSP_UDP_MAX_PACKET_SIZE];

        loop {
            let n = match socket.recv_from(&mut buf).await {
                Ok((n, _)) => n,
                Err(_) => break,
            };

            if sender
                .send((track, Bytes::copy_from_slice(&buf[..n])))
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

/// Starts the task sending the group RTP batches to a subscriber
fn spawn_rtp_writer<TW: AsyncWrite + Send + Unpin + 'static>(
    logger: Arc<Logger>,
    write_stream: Arc<Mutex<TW>>,
    handle: Arc<SessionHandle>,
    mut receiver: mpsc::Receiver<RtpBatch>,
    outputs: Vec<(u8, TrackTransport)>,
    write_timeout_ms: u64,
) {
    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                _ = handle.closed() => break,
                item = receiver.recv() => match item {
                    Some(b) => b,
                    None => break,
                },
            };

            let write = write_rtp_batch(&write_stream, &batch, &outputs);

            let written = if write_timeout_ms > 0 {
                match tokio::time::timeout(Duration::from_millis(write_timeout_ms), write).await {
                    Ok(r) => r,
                    Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
                }
            } else {
                write.await
            };

            match written {
                Ok(n) => handle.add_wrote_bytes(n),
                Err(e) => {
                    log_debug!(logger, format!("Write error: {}", e));
                    break;
                }
            }
        }

        handle.dispose();
    });
}

/// Writes one batch, returning the number of bytes sent
async fn write_rtp_batch<TW: AsyncWrite + Send + Unpin>(
    write_stream: &Mutex<TW>,
    batch: &RtpBatch,
    outputs: &[(u8, TrackTransport)],
) -> std::io::Result<usize> {
    let mut interleaved = BytesMut::new();
    let mut total = 0;

    for pkt in batch.iter() {
        let transport = match outputs.iter().find(|(pt, _)| *pt == pkt.header.payload_type) {
            Some((_, t)) => t,
            None => continue,
        };

        let encoded = pkt.encode();
        total += encoded.len();

        match transport {
            TrackTransport::Interleaved { rtp_channel, .. } => {
                interleaved.extend_from_slice(&encode_interleaved(*rtp_channel, &encoded));
            }
            TrackTransport::Udp {
                rtp_socket,
                peer_rtp,
                ..
            } => {
                rtp_socket.send_to(&encoded, *peer_rtp).await?;
            }
        }
    }

    if !interleaved.is_empty() {
        session_write_bytes(write_stream, &interleaved).await?;
    }

    Ok(total)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::{AvMsg, VIDEO_CODEC_ID_AVC},
        codec::{avc_test_util::make_avc_sps, AvcDecoderConfig},
        remux::{make_video_payload, rtp::RtpRemuxer},
        rtmp::RTMP_TYPE_VIDEO,
        server::test_server_context,
        session::CustomizePubSession,
    };
    use rtsp_types::{Message, Request, Version};
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;

    fn avc_seq_header() -> AvMsg {
        let record = AvcDecoderConfig::build(&make_avc_sps(80, 45, 0), &[0x68, 0xce, 0x3c, 0x80]);
        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        )
    }

    fn key_frame(ts: u32) -> AvMsg {
        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            ts,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 1, 0, &[0, 0, 0, 2, 0x65, 0x88]),
        )
    }

    struct TestClient {
        stream: DuplexStream,
        reader: RtspReader,
        pending: VecDeque<RtspItem>,
        cseq: u32,
    }

    impl TestClient {
        fn start(ctx: &ServerContext) -> TestClient {
            let (client, server) = tokio::io::duplex(1 << 20);

            tokio::spawn(handle_rtsp_server_session(
                Arc::new(Logger::new_disabled()),
                ctx.clone(),
                server,
                "127.0.0.1:50000".to_string(),
            ));

            TestClient {
                stream: client,
                reader: RtspReader::new(),
                pending: VecDeque::new(),
                cseq: 0,
            }
        }

        /// Reads the next message or interleaved frame
        async fn next_item(&mut self) -> RtspItem {
            let mut buf = vec![0u8; 4096];

            loop {
                if let Some(item) = self.pending.pop_front() {
                    return item;
                }

                let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "connection closed");

                self.pending.extend(self.reader.feed(&buf[..n]).unwrap());
            }
        }

        /// Sends a request and waits for its response
        async fn request(
            &mut self,
            method: Method,
            uri: &str,
            transport: Option<&str>,
            sdp: &str,
        ) -> RtspResponse {
            self.cseq += 1;

            let mut builder = Request::builder(method, Version::V1_0)
                .request_uri(Url::parse(uri).unwrap())
                .header(headers::CSEQ, self.cseq.to_string());

            if let Some(t) = transport {
                builder = builder.header(headers::TRANSPORT, t);
            }

            if !sdp.is_empty() {
                builder = builder
                    .header(headers::CONTENT_TYPE, "application/sdp")
                    .header(headers::CONTENT_LENGTH, sdp.len().to_string());
            }

            let mut data = Vec::new();
            Message::Request(builder.build(sdp.as_bytes().to_vec()))
                .write(&mut data)
                .unwrap();

            self.stream.write_all(&data).await.unwrap();

            loop {
                match self.next_item().await {
                    RtspItem::Response(r) => {
                        assert_eq!(request_cseq_of(&r), self.cseq.to_string());
                        return r;
                    }
                    other => panic!("unexpected item: {:?}", other),
                }
            }
        }
    }

    fn request_cseq_of(response: &RtspResponse) -> String {
        response
            .header(&headers::CSEQ)
            .map(|v| v.as_str().to_string())
            .unwrap_or_default()
    }

    fn header_of(response: &RtspResponse, name: &headers::HeaderName) -> String {
        response
            .header(name)
            .map(|v| v.as_str().to_string())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_unsupported_method_keeps_connection() {
        let ctx = test_server_context();
        let mut client = TestClient::start(&ctx);
        let uri = "rtsp://127.0.0.1:5544/live/options";

        let r = client.request(Method::Pause, uri, None, "").await;
        assert_eq!(r.status(), StatusCode::NotImplemented);

        let r = client.request(Method::Options, uri, None, "").await;
        assert_eq!(r.status(), StatusCode::Ok);
        assert_eq!(header_of(&r, &headers::PUBLIC), RTSP_PUBLIC_METHODS);
    }

    #[tokio::test]
    async fn test_rtsp_publish_interleaved() {
        let ctx = test_server_context();
        let mut client = TestClient::start(&ctx);

        let sdp = SdpContext::from_seq_headers(Some(&avc_seq_header()), None).unwrap();
        let uri = "rtsp://127.0.0.1:5544/live/rtsppub";

        let r = client.request(Method::Announce, uri, None, &sdp.raw).await;
        assert_eq!(r.status(), StatusCode::Ok);

        let r = client
            .request(
                Method::Setup,
                &format!("{}/streamid=0", uri),
                Some("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record"),
                "",
            )
            .await;
        assert_eq!(
            header_of(&r, &headers::TRANSPORT),
            "RTP/AVP/TCP;unicast;interleaved=0-1"
        );

        let r = client.request(Method::Record, uri, None, "").await;
        assert_eq!(r.status(), StatusCode::Ok);

        let mut remuxer = RtpRemuxer::new();
        remuxer.feed(&avc_seq_header()).unwrap();

        for ts in [0u32, 40, 80] {
            for pkt in remuxer.feed(&key_frame(ts)).unwrap() {
                client
                    .stream
                    .write_all(&encode_interleaved(0, &pkt.encode()))
                    .await
                    .unwrap();
            }
        }

        let (group, _) = ctx.group_manager.get_or_create("live", "rtsppub");

        let mut stat = group.stat().await;

        for _ in 0..100 {
            if !stat.video_codec.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            stat = group.stat().await;
        }

        assert_eq!(stat.video_codec, "H264");
        assert_eq!((stat.video_width, stat.video_height), (1280, 720));
        assert_eq!(stat.input.unwrap().protocol, "RTSPPUB");

        // A second publisher is refused
        let mut second = TestClient::start(&ctx);
        let r = second.request(Method::Announce, uri, None, &sdp.raw).await;
        assert_eq!(r.status(), StatusCode::NotAcceptable);
    }

    #[tokio::test]
    async fn test_rtsp_play_interleaved() {
        let ctx = test_server_context();

        let (group, _) = ctx.group_manager.get_or_create("live", "rtspsub");
        let publisher = CustomizePubSession::start(
            group,
            Arc::new(SessionHandle::new(
                ctx.session_id_generator.generate_id(),
                SessionProtocol::CustomizePub,
                "",
                ctx.clock.clone(),
            )),
        )
        .await
        .unwrap();

        let uri = "rtsp://127.0.0.1:5544/live/rtspsub";
        let mut client = TestClient::start(&ctx);

        // No sequence header yet
        let r = client.request(Method::Describe, uri, None, "").await;
        assert_eq!(r.status(), StatusCode::NotFound);

        publisher.feed_av_msg(avc_seq_header()).await.unwrap();
        publisher.feed_av_msg(key_frame(0)).await.unwrap();

        let r = client.request(Method::Describe, uri, None, "").await;
        assert_eq!(r.status(), StatusCode::Ok);
        assert_eq!(header_of(&r, &headers::CONTENT_BASE), format!("{}/", uri));
        assert!(String::from_utf8_lossy(r.body()).contains("a=rtpmap:96 H264/90000"));

        let r = client
            .request(
                Method::Setup,
                &format!("{}/streamid=0", uri),
                Some("RTP/AVP/TCP;unicast;interleaved=0-1"),
                "",
            )
            .await;
        assert_eq!(r.status(), StatusCode::Ok);
        assert!(header_of(&r, &headers::SESSION).ends_with(";timeout=60"));

        let r = client.request(Method::Play, uri, None, "").await;
        assert_eq!(r.status(), StatusCode::Ok);

        publisher.feed_av_msg(key_frame(40)).await.unwrap();

        match client.next_item().await {
            RtspItem::Interleaved { channel, data } => {
                assert_eq!(channel, 0);
                let pkt = RtpPacket::parse(&data).unwrap();
                assert_eq!(pkt.header.payload_type, 96);
            }
            other => panic!("unexpected item: {:?}", other),
        }

        publisher.dispose().await;
    }
}
