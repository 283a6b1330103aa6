// Stream group

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::{
    base::{AvMsg, Clock, PubSubInfo, RelayPullInfo, StatGroup, StreamError, StreamResult},
    callback::Observer,
    log::Logger,
    log_debug, log_info, log_warning,
    remux::{
        rtp::RtpRemuxer, DummyAudioFilter, FlvTagReader, LazyChunkDivider, LazyFlvTag,
        MpegtsRemuxer, SdpContext,
    },
    server::SessionIdGenerator,
    session::{spawn_relay_pull, spawn_relay_push, SessionHandle, SessionProtocol},
};

use super::{
    fan_out, CodecContext, DroppedSubscriber, GopCache, GroupConfiguration, OutputPayload,
    RtpBatch, Subscriber,
};

/// Dependencies shared by every group of a server
#[derive(Clone)]
pub struct GroupContext {
    pub config: Arc<GroupConfiguration>,
    pub observer: Arc<dyn Observer>,
    pub clock: Arc<dyn Clock>,
    pub session_id_generator: Arc<SessionIdGenerator>,
}

/// Kind of the session feeding a group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    RtmpPub,
    RtspPub,
    CustomizePub,
    RelayPull,
}

struct GroupInput {
    kind: InputKind,
    handle: Arc<SessionHandle>,
    info: PubSubInfo,
}

impl GroupInput {
    fn relay_pull_info(&self) -> RelayPullInfo {
        RelayPullInfo {
            session_id: self.info.session_id,
            url: self.info.remote_addr.clone(),
            app_name: self.info.app_name.clone(),
            stream_name: self.info.stream_name.clone(),
        }
    }
}

struct TsOutput {
    remuxer: MpegtsRemuxer,
    cache: GopCache<Bytes>,
}

struct RtpOutput {
    remuxer: RtpRemuxer,
    cache: GopCache<RtpBatch>,
}

struct RelayPushOutput {
    handle: Arc<SessionHandle>,
    url: String,
    sender: mpsc::Sender<AvMsg>,
}

/// Relay push to start once the group lock is released
type PendingRelayPush = (Arc<SessionHandle>, String, mpsc::Receiver<AvMsg>);

/// Observer hook to call once the group lock is released
enum GroupEvent {
    PubStart(PubSubInfo),
    PubStop(PubSubInfo),
    SubStop(PubSubInfo),
    RelayPullStart(RelayPullInfo),
    RelayPullStop(RelayPullInfo),
}

struct GroupState {
    input: Option<GroupInput>,
    dummy_audio: Option<DummyAudioFilter>,
    codec: CodecContext,

    gop_cache_num: usize,
    rtmp_cache: GopCache<Bytes>,
    flv_cache: GopCache<Bytes>,
    ts: Option<TsOutput>,
    rtp: Option<RtpOutput>,

    rtmp_subs: Vec<Subscriber<Bytes>>,
    flv_subs: Vec<Subscriber<Bytes>>,
    ts_subs: Vec<Subscriber<Bytes>>,
    rtsp_subs: Vec<Subscriber<RtpBatch>>,
    relay_pushes: Vec<RelayPushOutput>,

    relay_pull_idle_since: Option<i64>,
    last_active_ms: i64,
}

impl GroupState {
    fn is_inactive(&self, now_ms: i64, idle_timeout_ms: i64) -> bool {
        self.input.is_none()
            && !self.has_subscribers()
            && self.relay_pushes.is_empty()
            && now_ms - self.last_active_ms >= idle_timeout_ms
    }

    fn has_subscribers(&self) -> bool {
        !self.rtmp_subs.is_empty()
            || !self.flv_subs.is_empty()
            || !self.ts_subs.is_empty()
            || !self.rtsp_subs.is_empty()
    }

    fn subscriber_handles(&self) -> Vec<Arc<SessionHandle>> {
        let mut handles: Vec<Arc<SessionHandle>> = Vec::new();
        handles.extend(self.rtmp_subs.iter().map(|s| s.handle.clone()));
        handles.extend(self.flv_subs.iter().map(|s| s.handle.clone()));
        handles.extend(self.ts_subs.iter().map(|s| s.handle.clone()));
        handles.extend(self.rtsp_subs.iter().map(|s| s.handle.clone()));
        handles
    }

    /// Removes a subscriber from whatever set holds it
    fn take_sub(&mut self, session_id: u64) -> Option<(Arc<SessionHandle>, PubSubInfo)> {
        let found = take_from(&mut self.rtmp_subs, session_id)
            .or_else(|| take_from(&mut self.flv_subs, session_id))
            .or_else(|| take_from(&mut self.ts_subs, session_id))
            .or_else(|| take_from(&mut self.rtsp_subs, session_id));

        self.release_idle_outputs();

        found
    }

    /// Drops the lazily created outputs nobody reads
    fn release_idle_outputs(&mut self) {
        if self.ts_subs.is_empty() {
            self.ts = None;
        }

        if self.rtsp_subs.is_empty() {
            self.rtp = None;
        }
    }

    /// Rebuilds the cached messages from the FLV cache
    fn replay_flv_cache(&self, logger: &Logger) -> Vec<AvMsg> {
        let mut tags: Vec<Bytes> = Vec::new();
        self.flv_cache.send_cache(|t| tags.push(t.clone()));

        let mut reader = FlvTagReader::new();
        let mut msgs = Vec::new();

        for t in tags {
            match reader.feed(&t) {
                Ok(parsed) => msgs.extend(parsed.into_iter().map(|tag| tag.into_av_msg())),
                Err(e) => {
                    log_warning!(logger, format!("Could not replay cached tag: {}", e));
                    break;
                }
            }
        }

        msgs
    }

    fn ensure_ts(&mut self, logger: &Logger) {
        if self.ts.is_some() {
            return;
        }

        let mut out = TsOutput {
            remuxer: MpegtsRemuxer::new(),
            cache: GopCache::new(self.gop_cache_num),
        };

        for msg in self.replay_flv_cache(logger) {
            match out.remuxer.feed(&msg) {
                Ok(packets) => out.cache.feed(&msg, || packets),
                Err(e) => log_debug!(logger, format!("TS remux error: {}", e)),
            }
        }

        self.ts = Some(out);
    }

    fn ensure_rtp(&mut self, logger: &Logger) {
        if self.rtp.is_some() {
            return;
        }

        let mut out = RtpOutput {
            remuxer: RtpRemuxer::new(),
            cache: GopCache::new(self.gop_cache_num),
        };

        for msg in self.replay_flv_cache(logger) {
            match out.remuxer.feed(&msg) {
                Ok(packets) => out.cache.feed(&msg, || Arc::new(packets)),
                Err(e) => log_debug!(logger, format!("RTP remux error: {}", e)),
            }
        }

        self.rtp = Some(out);
    }
}

fn take_from<T>(
    subs: &mut Vec<Subscriber<T>>,
    session_id: u64,
) -> Option<(Arc<SessionHandle>, PubSubInfo)> {
    let index = subs.iter().position(|s| s.handle.id() == session_id)?;
    let sub = subs.remove(index);
    Some((sub.handle, sub.info))
}

fn take_stale<T>(subs: &mut Vec<Subscriber<T>>, now_ms: i64) -> Vec<Subscriber<T>> {
    let mut stale = Vec::new();
    let mut i = 0;

    while i < subs.len() {
        if subs[i].handle.is_write_stale(now_ms) || subs[i].handle.is_disposed() {
            stale.push(subs.remove(i));
        } else {
            i += 1;
        }
    }

    stale
}

fn rtmp_subs(state: &mut GroupState) -> &mut Vec<Subscriber<Bytes>> {
    &mut state.rtmp_subs
}

fn flv_subs(state: &mut GroupState) -> &mut Vec<Subscriber<Bytes>> {
    &mut state.flv_subs
}

fn ts_subs(state: &mut GroupState) -> &mut Vec<Subscriber<Bytes>> {
    &mut state.ts_subs
}

fn rtsp_subs(state: &mut GroupState) -> &mut Vec<Subscriber<RtpBatch>> {
    &mut state.rtsp_subs
}

/// One stream: at most one input, any number of outputs.
///
/// Every mutation and every fan-out decision happens under a
/// single lock. Outputs are written through bounded channels,
/// so the lock is never held across socket IO. Observer hooks
/// are called after the lock is released.
pub struct Group {
    app_name: String,
    stream_name: String,
    context: GroupContext,
    logger: Arc<Logger>,
    disposed: AtomicBool,
    state: Mutex<GroupState>,
}

impl Group {
    /// Creates a group
    ///
    /// # Arguments
    ///
    /// * `logger` - Server logger, a child logger is made for the group
    /// * `app_name` - Application name
    /// * `stream_name` - Stream name
    /// * `context` - Shared dependencies
    pub fn new(logger: &Logger, app_name: &str, stream_name: &str, context: GroupContext) -> Group {
        let gop_cache_num = context.config.gop_cache_num;
        let now = context.clock.now_ms();

        Group {
            app_name: app_name.to_string(),
            stream_name: stream_name.to_string(),
            logger: Arc::new(
                logger.make_child_logger(&format!("[GROUP:{}/{}] ", app_name, stream_name)),
            ),
            context,
            disposed: AtomicBool::new(false),
            state: Mutex::new(GroupState {
                input: None,
                dummy_audio: None,
                codec: CodecContext::default(),
                gop_cache_num,
                rtmp_cache: GopCache::new(gop_cache_num),
                flv_cache: GopCache::new(gop_cache_num),
                ts: None,
                rtp: None,
                rtmp_subs: Vec::new(),
                flv_subs: Vec::new(),
                ts_subs: Vec::new(),
                rtsp_subs: Vec::new(),
                relay_pushes: Vec::new(),
                relay_pull_idle_since: None,
                last_active_ms: now,
            }),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn config(&self) -> &GroupConfiguration {
        &self.context.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.context.clock
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Creates the handle of a session started by the group
    fn new_handle(&self, protocol: SessionProtocol, remote_addr: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(
            self.context.session_id_generator.generate_id(),
            protocol,
            remote_addr,
            self.context.clock.clone(),
        ))
    }

    async fn fire(&self, events: Vec<GroupEvent>) {
        let observer = &self.context.observer;

        for event in events {
            match event {
                GroupEvent::PubStart(info) => observer.on_pub_start(&info).await,
                GroupEvent::PubStop(info) => observer.on_pub_stop(&info).await,
                GroupEvent::SubStop(info) => observer.on_sub_stop(&info).await,
                GroupEvent::RelayPullStart(info) => observer.on_relay_pull_start(&info).await,
                GroupEvent::RelayPullStop(info) => observer.on_relay_pull_stop(&info).await,
            }
        }
    }

    ///////////////////
    //     Inputs    //
    ///////////////////

    pub async fn add_rtmp_pub(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<()> {
        self.add_input(InputKind::RtmpPub, handle, info).await
    }

    pub async fn add_rtsp_pub(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<()> {
        self.add_input(InputKind::RtspPub, handle, info).await
    }

    pub async fn add_customize_pub(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<()> {
        self.add_input(InputKind::CustomizePub, handle, info).await
    }

    async fn add_input(
        self: &Arc<Self>,
        kind: InputKind,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<()> {
        let mut state = self.state.lock().await;

        if self.is_disposed() {
            return Err(StreamError::GroupNotFound);
        }

        if let Some(input) = &state.input {
            let logger = &self.logger;
            log_info!(
                logger,
                format!(
                    "Rejected publisher {}: session {} is already the input",
                    handle.id(),
                    input.handle.id()
                )
            );

            return Err(StreamError::DupPublisher(format!(
                "{}/{}",
                self.app_name, self.stream_name
            )));
        }

        let pushes = self.install_input(&mut state, kind, handle, info.clone());

        drop(state);

        let logger = &self.logger;
        log_info!(
            logger,
            format!("Input started: {} ({})", info.session_id, info.protocol)
        );

        self.fire(vec![GroupEvent::PubStart(info)]).await;

        for (handle, url, receiver) in pushes {
            spawn_relay_push(self.clone(), handle, url, receiver);
        }

        Ok(())
    }

    /// Installs an input. Returns the relay pushes to start.
    fn install_input(
        &self,
        state: &mut GroupState,
        kind: InputKind,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> Vec<PendingRelayPush> {
        let config = &self.context.config;

        handle.set_caps(config.read_timeout_ms, 0);

        state.input = Some(GroupInput { kind, handle, info });
        state.relay_pull_idle_since = None;

        state.dummy_audio = if config.dummy_audio_enable {
            Some(DummyAudioFilter::new(config.dummy_audio_wait_audio_ms))
        } else {
            None
        };

        // Subscribers waiting for a publisher had nothing to write
        for handle in state.subscriber_handles() {
            handle.touch_write();
        }

        let mut pushes = Vec::new();

        if kind == InputKind::RelayPull {
            return pushes;
        }

        for url in config.relay_push_urls_for(&self.app_name, &self.stream_name) {
            let handle = self.new_handle(SessionProtocol::RelayPush, &url);
            let (sender, receiver) = mpsc::channel::<AvMsg>(config.write_chan_size.max(1));

            state.relay_pushes.push(RelayPushOutput {
                handle: handle.clone(),
                url: url.clone(),
                sender,
            });

            pushes.push((handle, url, receiver));
        }

        pushes
    }

    /// Removes the input, clearing the caches and remuxer state
    fn take_input(&self, state: &mut GroupState, events: &mut Vec<GroupEvent>) {
        let input = match state.input.take() {
            Some(i) => i,
            None => return,
        };

        input.handle.dispose();

        state.dummy_audio = None;
        state.codec = CodecContext::default();
        state.relay_pull_idle_since = None;

        state.rtmp_cache.clear();
        state.flv_cache.clear();

        if let Some(ts) = state.ts.as_mut() {
            ts.remuxer.flush();
            ts.cache.clear();
        }

        if let Some(rtp) = state.rtp.as_mut() {
            rtp.remuxer.flush();
            rtp.cache.clear();
        }

        for push in state.relay_pushes.drain(..) {
            push.handle.dispose();
        }

        let logger = &self.logger;
        log_info!(
            logger,
            format!(
                "Input stopped: {} ({})",
                input.info.session_id, input.info.protocol
            )
        );

        if input.kind == InputKind::RelayPull {
            events.push(GroupEvent::RelayPullStop(input.relay_pull_info()));
        } else {
            events.push(GroupEvent::PubStop(input.info));
        }
    }

    /// Removes the input if it is the given session
    pub async fn del_pub(&self, session_id: u64) {
        let mut events = Vec::new();

        {
            let mut state = self.state.lock().await;

            if state.input.as_ref().map(|i| i.handle.id()) != Some(session_id) {
                return;
            }

            self.take_input(&mut state, &mut events);
        }

        self.fire(events).await;
    }

    pub async fn has_input(&self) -> bool {
        self.state.lock().await.input.is_some()
    }

    ///////////////////
    //    Outputs    //
    ///////////////////

    pub async fn add_rtmp_sub(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<mpsc::Receiver<Bytes>> {
        self.add_sub(handle, info, rtmp_subs, None).await
    }

    pub async fn add_flv_sub(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<mpsc::Receiver<Bytes>> {
        self.add_sub(handle, info, flv_subs, None).await
    }

    pub async fn add_ts_sub(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<mpsc::Receiver<Bytes>> {
        self.add_sub(handle, info, ts_subs, Some(GroupState::ensure_ts))
            .await
    }

    pub async fn add_rtsp_sub(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
    ) -> StreamResult<mpsc::Receiver<RtpBatch>> {
        self.add_sub(handle, info, rtsp_subs, Some(GroupState::ensure_rtp))
            .await
    }

    async fn add_sub<T: OutputPayload>(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        info: PubSubInfo,
        select: fn(&mut GroupState) -> &mut Vec<Subscriber<T>>,
        prepare: Option<fn(&mut GroupState, &Logger)>,
    ) -> StreamResult<mpsc::Receiver<T>> {
        if let Err(e) = self.context.observer.on_sub_start(&info).await {
            return Err(match e {
                StreamError::Refused(reason) => StreamError::Refused(reason),
                other => StreamError::Refused(other.to_string()),
            });
        }

        let config = &self.context.config;
        let (sender, receiver) = mpsc::channel::<T>(config.write_chan_size.max(1));

        let mut events = Vec::new();

        let pull = {
            let mut state = self.state.lock().await;

            if self.is_disposed() {
                return Err(StreamError::GroupNotFound);
            }

            handle.set_caps(0, config.write_timeout_ms);

            let mut sub = Subscriber::new(handle, info, sender);

            // Audio-only so far: there may never be a keyframe to wait for
            if state.codec.video_codec.is_none() {
                sub.should_wait_video_key_frame = false;
            }

            if let Some(p) = prepare {
                p(&mut state, &self.logger);
            }

            let logger = &self.logger;
            log_debug!(
                logger,
                format!(
                    "Subscriber added: {} ({})",
                    sub.info.session_id, sub.info.protocol
                )
            );

            select(&mut state).push(sub);

            self.prepare_relay_pull(&mut state, None, &mut events)
        };

        self.fire(events).await;

        if let Some((handle, url)) = pull {
            spawn_relay_pull(self.clone(), handle, url);
        }

        Ok(receiver)
    }

    /// Removes a subscriber
    pub async fn del_sub(&self, session_id: u64) {
        let removed = self.state.lock().await.take_sub(session_id);

        if let Some((handle, info)) = removed {
            handle.dispose();

            let logger = &self.logger;
            log_debug!(
                logger,
                format!("Subscriber removed: {} ({})", info.session_id, info.protocol)
            );

            self.fire(vec![GroupEvent::SubStop(info)]).await;
        }
    }

    /// Removes a relay push output
    pub async fn del_relay_push(&self, session_id: u64) {
        let mut state = self.state.lock().await;

        if let Some(index) = state
            .relay_pushes
            .iter()
            .position(|p| p.handle.id() == session_id)
        {
            let push = state.relay_pushes.remove(index);
            push.handle.dispose();
        }
    }

    /// Session description for RTSP subscribers, if the codecs are known
    pub async fn describe_sdp(&self) -> Option<SdpContext> {
        let state = self.state.lock().await;

        if state.codec.video_seq_header.is_none() && state.codec.audio_seq_header.is_none() {
            return None;
        }

        SdpContext::from_seq_headers(
            state.codec.video_seq_header.as_ref(),
            state.codec.audio_seq_header.as_ref(),
        )
        .ok()
    }

    ///////////////////
    //   Relay pull  //
    ///////////////////

    /// Installs a relay pull as input when there is none.
    ///
    /// Returns the pull session to start.
    fn prepare_relay_pull(
        &self,
        state: &mut GroupState,
        url: Option<String>,
        events: &mut Vec<GroupEvent>,
    ) -> Option<(Arc<SessionHandle>, String)> {
        if state.input.is_some() {
            return None;
        }

        let url = url.or_else(|| {
            self.context
                .config
                .relay_pull_url_for(&self.app_name, &self.stream_name)
        })?;

        let handle = self.new_handle(SessionProtocol::RelayPull, &url);

        let info = PubSubInfo {
            session_id: handle.id(),
            protocol: SessionProtocol::RelayPull.as_str().to_string(),
            app_name: self.app_name.clone(),
            stream_name: self.stream_name.clone(),
            raw_query: "".to_string(),
            remote_addr: url.clone(),
        };

        self.install_input(state, InputKind::RelayPull, handle.clone(), info);

        if let Some(input) = &state.input {
            events.push(GroupEvent::RelayPullStart(input.relay_pull_info()));
        }

        let logger = &self.logger;
        log_info!(logger, format!("Relay pull started: {}", url));

        Some((handle, url))
    }

    /// Starts a relay pull
    ///
    /// # Arguments
    ///
    /// * `url` - Full URL to pull. If None, the configured base URL is used.
    pub async fn start_relay_pull(self: &Arc<Self>, url: Option<String>) -> StreamResult<()> {
        let mut events = Vec::new();

        let pull = {
            let mut state = self.state.lock().await;

            if self.is_disposed() {
                return Err(StreamError::GroupNotFound);
            }

            if state.input.is_some() {
                return Err(StreamError::DupPublisher(format!(
                    "{}/{}",
                    self.app_name, self.stream_name
                )));
            }

            self.prepare_relay_pull(&mut state, url, &mut events)
        };

        let (handle, url) = match pull {
            Some(p) => p,
            None => return Err(StreamError::Refused("relay pull is not configured".to_string())),
        };

        self.fire(events).await;

        spawn_relay_pull(self.clone(), handle, url);

        Ok(())
    }

    /// Stops the relay pull feeding the group
    pub async fn stop_relay_pull(&self) -> StreamResult<()> {
        let mut events = Vec::new();

        {
            let mut state = self.state.lock().await;

            match &state.input {
                Some(input) if input.kind == InputKind::RelayPull => {}
                _ => return Err(StreamError::SessionNotFound),
            }

            self.take_input(&mut state, &mut events);
        }

        self.fire(events).await;

        Ok(())
    }

    ///////////////////
    //    Fan-out    //
    ///////////////////

    /// Receives a message from the input
    ///
    /// Messages from any other session are ignored.
    pub async fn on_av_msg(&self, session_id: u64, msg: AvMsg) {
        let mut events = Vec::new();

        {
            let mut state = self.state.lock().await;

            if state.input.as_ref().map(|i| i.handle.id()) != Some(session_id) {
                return;
            }

            let msgs = match state.dummy_audio.as_mut() {
                Some(filter) => filter.feed(msg),
                None => vec![msg],
            };

            for m in msgs {
                self.broadcast(&mut state, &m, &mut events).await;
            }
        }

        self.fire(events).await;
    }

    async fn broadcast(&self, state: &mut GroupState, msg: &AvMsg, events: &mut Vec<GroupEvent>) {
        let logger = &self.logger;
        let config = &self.context.config;
        let policy = config.backpressure_policy;

        if let Err(e) = state.codec.update(msg) {
            log_debug!(logger, format!("Could not parse sequence header: {}", e));
        }

        let mut dropped: Vec<DroppedSubscriber> = Vec::new();

        // RTMP

        let mut chunks = LazyChunkDivider::new(msg, config.chunk_size);

        {
            let mut make_chunks = || chunks.get();

            fan_out(
                &mut state.rtmp_subs,
                &state.rtmp_cache,
                None,
                msg,
                &mut make_chunks,
                policy,
                &mut dropped,
            )
            .await;
        }

        state.rtmp_cache.feed(msg, || chunks.get());

        // HTTP-FLV

        let mut tag = LazyFlvTag::new(msg);

        {
            let mut make_tag = || tag.get();

            fan_out(
                &mut state.flv_subs,
                &state.flv_cache,
                None,
                msg,
                &mut make_tag,
                policy,
                &mut dropped,
            )
            .await;
        }

        state.flv_cache.feed(msg, || tag.get());

        // HTTP-TS

        if let Some(ts) = state.ts.as_mut() {
            let packets = match ts.remuxer.feed(msg) {
                Ok(p) => p,
                Err(e) => {
                    log_debug!(logger, format!("TS remux error: {}", e));
                    Bytes::new()
                }
            };

            let preamble = if state.ts_subs.iter().any(|s| s.is_fresh) {
                Some(ts.remuxer.pat_pmt())
            } else {
                None
            };

            let mut make_packets = || packets.clone();

            fan_out(
                &mut state.ts_subs,
                &ts.cache,
                preamble,
                msg,
                &mut make_packets,
                policy,
                &mut dropped,
            )
            .await;

            ts.cache.feed(msg, || packets);
        }

        // RTSP

        if let Some(rtp) = state.rtp.as_mut() {
            let packets: RtpBatch = match rtp.remuxer.feed(msg) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    log_debug!(logger, format!("RTP remux error: {}", e));
                    Arc::new(Vec::new())
                }
            };

            let mut make_packets = || packets.clone();

            fan_out(
                &mut state.rtsp_subs,
                &rtp.cache,
                None,
                msg,
                &mut make_packets,
                policy,
                &mut dropped,
            )
            .await;

            rtp.cache.feed(msg, || packets);
        }

        // Relay push, no cache replay

        let mut i = 0;

        while i < state.relay_pushes.len() {
            if state.relay_pushes[i].sender.try_send(msg.clone()).is_err() {
                let push = state.relay_pushes.remove(i);
                log_warning!(logger, format!("Relay push to {} cannot keep up, closing", push.url));
                push.handle.dispose();
            } else {
                i += 1;
            }
        }

        if dropped.is_empty() {
            return;
        }

        for d in dropped {
            log_info!(
                logger,
                format!(
                    "Subscriber {} ({}) removed: {}",
                    d.info.session_id, d.info.protocol, d.error
                )
            );

            d.handle.dispose();
            events.push(GroupEvent::SubStop(d.info));
        }

        state.release_idle_outputs();
    }

    ///////////////////
    //    Liveness   //
    ///////////////////

    /// Periodic check, called by the server tick
    ///
    /// Disposes the input if it stopped reading, subscribers that
    /// stopped writing, and the relay pull once it has had no
    /// subscriber for the grace period.
    pub async fn check_session_liveness(&self, now_ms: i64) {
        let logger = &self.logger;
        let mut events = Vec::new();

        {
            let mut state = self.state.lock().await;

            let was_active = state.input.is_some()
                || state.has_subscribers()
                || !state.relay_pushes.is_empty();

            let input_dead = state
                .input
                .as_ref()
                .map(|i| i.handle.is_disposed() || i.handle.is_read_stale(now_ms));

            if input_dead == Some(true) {
                log_info!(logger, "Input timed out or closed");
                self.take_input(&mut state, &mut events);
            }

            if state.input.is_some() {
                let mut stale: Vec<(Arc<SessionHandle>, PubSubInfo)> = Vec::new();

                stale.extend(
                    take_stale(&mut state.rtmp_subs, now_ms)
                        .into_iter()
                        .map(|s| (s.handle, s.info)),
                );
                stale.extend(
                    take_stale(&mut state.flv_subs, now_ms)
                        .into_iter()
                        .map(|s| (s.handle, s.info)),
                );
                stale.extend(
                    take_stale(&mut state.ts_subs, now_ms)
                        .into_iter()
                        .map(|s| (s.handle, s.info)),
                );
                stale.extend(
                    take_stale(&mut state.rtsp_subs, now_ms)
                        .into_iter()
                        .map(|s| (s.handle, s.info)),
                );

                for (handle, info) in stale {
                    log_info!(
                        logger,
                        format!("Subscriber {} ({}) timed out", info.session_id, info.protocol)
                    );

                    handle.dispose();
                    events.push(GroupEvent::SubStop(info));
                }

                state.release_idle_outputs();
            }

            // Relay pull grace

            let pulling = state
                .input
                .as_ref()
                .is_some_and(|i| i.kind == InputKind::RelayPull);

            if pulling && !state.has_subscribers() {
                let since = *state.relay_pull_idle_since.get_or_insert(now_ms);

                if now_ms - since >= self.context.config.relay_pull_stop_grace_ms {
                    log_info!(logger, "Relay pull has no subscribers, stopping");
                    self.take_input(&mut state, &mut events);
                }
            } else {
                state.relay_pull_idle_since = None;
            }

            if was_active || state.has_subscribers() || !state.relay_pushes.is_empty() {
                state.last_active_ms = now_ms;
            }
        }

        self.fire(events).await;
    }

    /// True if the group had no session for the idle timeout
    #[cfg(test)]
    pub async fn is_inactive(&self, now_ms: i64) -> bool {
        let state = self.state.lock().await;

        state.is_inactive(now_ms, self.context.config.idle_timeout_ms)
    }

    /// Disposes the group if it is inactive
    ///
    /// The check and the disposed flag are set under the same state lock,
    /// so no session can be admitted in between.
    ///
    /// # Return value
    ///
    /// Returns true if this call disposed the group
    pub async fn dispose_if_inactive(&self, now_ms: i64) -> bool {
        {
            let state = self.state.lock().await;

            if !state.is_inactive(now_ms, self.context.config.idle_timeout_ms) {
                return false;
            }

            if self.disposed.swap(true, Ordering::SeqCst) {
                return false;
            }
        }

        self.teardown().await;

        true
    }

    /// Closes a session of the group
    ///
    /// # Return value
    ///
    /// Returns false if no session of the group has that id
    pub async fn kick_session(&self, session_id: u64) -> bool {
        let mut events = Vec::new();

        {
            let mut state = self.state.lock().await;

            if state.input.as_ref().map(|i| i.handle.id()) == Some(session_id) {
                self.take_input(&mut state, &mut events);
            } else if let Some((handle, info)) = state.take_sub(session_id) {
                handle.dispose();
                events.push(GroupEvent::SubStop(info));
            } else if let Some(index) = state
                .relay_pushes
                .iter()
                .position(|p| p.handle.id() == session_id)
            {
                state.relay_pushes.remove(index).handle.dispose();
            } else {
                return false;
            }
        }

        self.fire(events).await;

        true
    }

    /// Disposes every session of the group. Only the first call has an effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.teardown().await;
    }

    /// Closes the sessions and outputs of a disposed group
    async fn teardown(&self) {
        let mut events = Vec::new();

        {
            let mut state = self.state.lock().await;

            self.take_input(&mut state, &mut events);

            let mut subs: Vec<(Arc<SessionHandle>, PubSubInfo)> = Vec::new();
            subs.extend(state.rtmp_subs.drain(..).map(|s| (s.handle, s.info)));
            subs.extend(state.flv_subs.drain(..).map(|s| (s.handle, s.info)));
            subs.extend(state.ts_subs.drain(..).map(|s| (s.handle, s.info)));
            subs.extend(state.rtsp_subs.drain(..).map(|s| (s.handle, s.info)));

            for (handle, info) in subs {
                handle.dispose();
                events.push(GroupEvent::SubStop(info));
            }

            for push in state.relay_pushes.drain(..) {
                push.handle.dispose();
            }

            state.release_idle_outputs();
        }

        let logger = &self.logger;
        log_debug!(logger, "Group disposed");

        self.fire(events).await;
    }

    /// Statistics of the group
    pub async fn stat(&self) -> StatGroup {
        let state = self.state.lock().await;

        StatGroup {
            app_name: self.app_name.clone(),
            stream_name: self.stream_name.clone(),
            video_codec: state.codec.video_codec_name(),
            audio_codec: state.codec.audio_codec_name(),
            video_width: state.codec.width,
            video_height: state.codec.height,
            input: state.input.as_ref().map(|i| i.handle.stat()),
            subscribers: state
                .subscriber_handles()
                .iter()
                .map(|h| h.stat())
                .collect(),
            relay_pushes: state.relay_pushes.iter().map(|p| p.handle.stat()).collect(),
        }
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::{ManualClock, AUDIO_CODEC_ID_AAC, VIDEO_CODEC_ID_AVC},
        callback::NoopObserver,
        codec::{avc_test_util::make_avc_sps, AvcDecoderConfig},
        group::BackpressurePolicy,
        remux::{make_aac_payload, make_video_payload},
        rtmp::{
            encode_av_msg, pack_set_chunk_size, ChunkComposer, RTMP_DEFAULT_CHUNK_SIZE,
            RTMP_DEFAULT_MAX_MESSAGE_SIZE, RTMP_TYPE_AUDIO, RTMP_TYPE_VIDEO,
        },
    };

    fn make_group(config: GroupConfiguration, clock: Arc<ManualClock>) -> Arc<Group> {
        let context = GroupContext {
            config: Arc::new(config),
            observer: Arc::new(NoopObserver),
            clock,
            session_id_generator: Arc::new(SessionIdGenerator::new()),
        };

        Arc::new(Group::new(&Logger::new_disabled(), "live", "test", context))
    }

    fn make_handle(
        id: u64,
        protocol: SessionProtocol,
        clock: &Arc<ManualClock>,
    ) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(id, protocol, "127.0.0.1:50000", clock.clone()))
    }

    fn make_info(id: u64, protocol: SessionProtocol) -> PubSubInfo {
        PubSubInfo {
            session_id: id,
            protocol: protocol.as_str().to_string(),
            app_name: "live".to_string(),
            stream_name: "test".to_string(),
            raw_query: "".to_string(),
            remote_addr: "127.0.0.1:50000".to_string(),
        }
    }

    fn avc_seq_header(ts: u32) -> AvMsg {
        let record = AvcDecoderConfig::build(&make_avc_sps(80, 45, 0), &[0x68, 0xce, 0x3c, 0x80]);
        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            ts,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        )
    }

    fn avc_frame(ts: u32, key: bool) -> AvMsg {
        let nalu: &[u8] = if key {
            &[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x84]
        } else {
            &[0x00, 0x00, 0x00, 0x03, 0x41, 0x9a, 0x02]
        };

        AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            ts,
            make_video_payload(VIDEO_CODEC_ID_AVC, key, 1, 0, nalu),
        )
    }

    fn aac_seq_header(ts: u32) -> AvMsg {
        AvMsg::new_media(RTMP_TYPE_AUDIO, ts, make_aac_payload(0, &[0x12, 0x10]))
    }

    fn aac_frame(ts: u32) -> AvMsg {
        AvMsg::new_media(RTMP_TYPE_AUDIO, ts, make_aac_payload(1, &[0x21, 0x00, 0x49]))
    }

    fn drain<T>(receiver: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut items = Vec::new();

        while let Ok(item) = receiver.try_recv() {
            items.push(item);
        }

        items
    }

    async fn start_pub(group: &Arc<Group>, clock: &Arc<ManualClock>) -> u64 {
        let handle = make_handle(1, SessionProtocol::RtmpPub, clock);
        group
            .add_rtmp_pub(handle, make_info(1, SessionProtocol::RtmpPub))
            .await
            .unwrap();
        1
    }

    #[tokio::test]
    async fn test_duplicate_publisher() {
        let clock = Arc::new(ManualClock::new(0));
        let group = make_group(GroupConfiguration::default(), clock.clone());

        start_pub(&group, &clock).await;

        let second = make_handle(2, SessionProtocol::RtmpPub, &clock);
        let res = group
            .add_rtmp_pub(second, make_info(2, SessionProtocol::RtmpPub))
            .await;

        assert!(matches!(res, Err(StreamError::DupPublisher(_))));

        let stat = group.stat().await;
        assert_eq!(stat.input.map(|s| s.session_id), Some(1));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_cache_first() {
        let clock = Arc::new(ManualClock::new(0));
        let config = GroupConfiguration {
            gop_cache_num: 1,
            ..GroupConfiguration::default()
        };
        let group = make_group(config, clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        group.on_av_msg(pub_id, avc_seq_header(0)).await;
        group.on_av_msg(pub_id, avc_frame(0, true)).await;
        group.on_av_msg(pub_id, avc_frame(40, false)).await;

        let mut receiver = group
            .add_rtmp_sub(
                make_handle(2, SessionProtocol::RtmpSub, &clock),
                make_info(2, SessionProtocol::RtmpSub),
            )
            .await
            .unwrap();

        group.on_av_msg(pub_id, avc_frame(80, false)).await;

        let items = drain(&mut receiver);
        assert_eq!(items.len(), 4);

        let chunk_size = GroupConfiguration::default().chunk_size;
        assert_eq!(
            items[0],
            crate::rtmp::encode_av_msg(&avc_seq_header(0).normalized(), chunk_size)
        );
        assert_eq!(
            items[3],
            crate::rtmp::encode_av_msg(&avc_frame(80, false).normalized(), chunk_size)
        );
    }

    #[tokio::test]
    async fn test_subscriber_waits_for_keyframe_without_gop_cache() {
        let clock = Arc::new(ManualClock::new(0));
        let config = GroupConfiguration {
            gop_cache_num: 0,
            ..GroupConfiguration::default()
        };
        let group = make_group(config, clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        group.on_av_msg(pub_id, avc_seq_header(0)).await;
        group.on_av_msg(pub_id, avc_frame(0, true)).await;

        let mut receiver = group
            .add_flv_sub(
                make_handle(2, SessionProtocol::FlvSub, &clock),
                make_info(2, SessionProtocol::FlvSub),
            )
            .await
            .unwrap();

        group.on_av_msg(pub_id, avc_frame(40, false)).await;

        // Only the cached sequence header
        assert_eq!(drain(&mut receiver).len(), 1);

        group.on_av_msg(pub_id, avc_frame(80, true)).await;
        group.on_av_msg(pub_id, avc_frame(120, false)).await;

        let items = drain(&mut receiver);
        assert_eq!(items.len(), 2);

        let mut reader = FlvTagReader::new();
        let tags = reader.feed(&items[0]).unwrap();
        assert_eq!(tags.len(), 1);
        assert!(tags[0].clone().into_av_msg().is_video_key_frame());
    }

    #[tokio::test]
    async fn test_header_change_reaches_a_subscriber_waiting_for_keyframe() {
        let clock = Arc::new(ManualClock::new(0));
        let config = GroupConfiguration {
            gop_cache_num: 0,
            ..GroupConfiguration::default()
        };
        let group = make_group(config, clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        group.on_av_msg(pub_id, avc_seq_header(0)).await;
        group.on_av_msg(pub_id, avc_frame(0, true)).await;

        let mut receiver = group
            .add_flv_sub(
                make_handle(2, SessionProtocol::FlvSub, &clock),
                make_info(2, SessionProtocol::FlvSub),
            )
            .await
            .unwrap();

        let record = AvcDecoderConfig::build(&make_avc_sps(160, 90, 0), &[0x68, 0xce, 0x3c, 0x80]);
        let new_header = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            60,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        );

        group.on_av_msg(pub_id, avc_frame(40, false)).await;
        group.on_av_msg(pub_id, new_header.clone()).await;
        group.on_av_msg(pub_id, avc_frame(80, true)).await;

        let mut reader = FlvTagReader::new();
        let msgs: Vec<AvMsg> = drain(&mut receiver)
            .iter()
            .flat_map(|item| reader.feed(item).unwrap())
            .map(|tag| tag.into_av_msg())
            .collect();

        // Cached header, new header, then the keyframe
        assert_eq!(msgs.len(), 3);
        assert!(msgs[0].is_seq_header());
        assert!(msgs[1].is_seq_header());
        assert_eq!(msgs[1].header.timestamp_abs, 60);
        assert_eq!(msgs[1].payload, new_header.payload);
        assert!(msgs[2].is_video_key_frame());
        assert_eq!(msgs[2].header.timestamp_abs, 80);
    }

    #[tokio::test]
    async fn test_flv_tags_carry_rtmp_payloads() {
        let clock = Arc::new(ManualClock::new(0));
        let group = make_group(GroupConfiguration::default(), clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        let mut receiver = group
            .add_flv_sub(
                make_handle(2, SessionProtocol::FlvSub, &clock),
                make_info(2, SessionProtocol::FlvSub),
            )
            .await
            .unwrap();

        let sent = vec![avc_seq_header(0), aac_seq_header(0), avc_frame(0, true), aac_frame(23)];

        for msg in sent.iter() {
            group.on_av_msg(pub_id, msg.clone()).await;
        }

        let mut reader = FlvTagReader::new();
        let mut received = Vec::new();

        for item in drain(&mut receiver) {
            received.extend(reader.feed(&item).unwrap());
        }

        assert_eq!(received.len(), sent.len());

        for (tag, msg) in received.into_iter().zip(sent.iter()) {
            let back = tag.into_av_msg();
            assert_eq!(back.header.msg_type_id, msg.header.msg_type_id);
            assert_eq!(back.header.timestamp_abs, msg.header.timestamp_abs);
            assert_eq!(back.payload, msg.payload);
        }
    }

    #[tokio::test]
    async fn test_ts_subscriber_starts_with_psi() {
        let clock = Arc::new(ManualClock::new(0));
        let group = make_group(GroupConfiguration::default(), clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        group.on_av_msg(pub_id, avc_seq_header(0)).await;
        group.on_av_msg(pub_id, aac_seq_header(0)).await;

        let mut receiver = group
            .add_ts_sub(
                make_handle(2, SessionProtocol::TsSub, &clock),
                make_info(2, SessionProtocol::TsSub),
            )
            .await
            .unwrap();

        group.on_av_msg(pub_id, avc_frame(0, true)).await;
        group.on_av_msg(pub_id, aac_frame(23)).await;

        let items = drain(&mut receiver);
        assert!(!items.is_empty());

        for item in items.iter() {
            assert_eq!(item.len() % 188, 0);
            assert_eq!(item[0], 0x47);
        }

        // PAT first
        let first = &items[0];
        assert_eq!(((first[1] as u16 & 0x1f) << 8) | first[2] as u16, 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let clock = Arc::new(ManualClock::new(0));
        let config = GroupConfiguration {
            write_chan_size: 4,
            backpressure_policy: BackpressurePolicy::Drop,
            ..GroupConfiguration::default()
        };
        let group = make_group(config, clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        let sub_handle = make_handle(2, SessionProtocol::RtmpSub, &clock);
        let _receiver = group
            .add_rtmp_sub(sub_handle.clone(), make_info(2, SessionProtocol::RtmpSub))
            .await
            .unwrap();

        // Drained between sends, so it never falls behind
        let mut healthy = group
            .add_flv_sub(
                make_handle(3, SessionProtocol::FlvSub, &clock),
                make_info(3, SessionProtocol::FlvSub),
            )
            .await
            .unwrap();

        let mut reader = FlvTagReader::new();
        let mut timestamps = Vec::new();

        group.on_av_msg(pub_id, aac_seq_header(0)).await;

        for i in 0..1000u32 {
            group.on_av_msg(pub_id, aac_frame(i * 23)).await;

            for item in drain(&mut healthy) {
                for tag in reader.feed(&item).unwrap() {
                    let msg = tag.into_av_msg();

                    if !msg.is_aac_seq_header() {
                        timestamps.push(msg.header.timestamp_abs);
                    }
                }
            }
        }

        assert!(sub_handle.is_disposed());

        let stat = group.stat().await;
        assert_eq!(stat.subscribers.len(), 1);
        assert_eq!(stat.subscribers[0].session_id, 3);
        assert_eq!(stat.audio_codec, "AAC");

        let expected: Vec<u32> = (0..1000u32).map(|i| i * 23).collect();
        assert_eq!(timestamps, expected);
    }

    #[tokio::test]
    async fn test_rtmp_and_flv_subscribers_get_the_same_messages() {
        let clock = Arc::new(ManualClock::new(0));
        let group = make_group(GroupConfiguration::default(), clock.clone());
        let chunk_size = GroupConfiguration::default().chunk_size;

        let pub_id = start_pub(&group, &clock).await;

        let mut rtmp_receiver = group
            .add_rtmp_sub(
                make_handle(2, SessionProtocol::RtmpSub, &clock),
                make_info(2, SessionProtocol::RtmpSub),
            )
            .await
            .unwrap();

        let mut flv_receiver = group
            .add_flv_sub(
                make_handle(3, SessionProtocol::FlvSub, &clock),
                make_info(3, SessionProtocol::FlvSub),
            )
            .await
            .unwrap();

        let sent = vec![
            avc_seq_header(0),
            aac_seq_header(0),
            avc_frame(0, true),
            aac_frame(23),
            avc_frame(40, false),
            aac_frame(46),
            avc_frame(80, false),
        ];

        for msg in sent.iter() {
            group.on_av_msg(pub_id, msg.clone()).await;
        }

        // The RTMP session announces its chunk size before the media
        let mut composer = ChunkComposer::new(RTMP_DEFAULT_MAX_MESSAGE_SIZE);
        composer
            .feed(&encode_av_msg(&pack_set_chunk_size(chunk_size), RTMP_DEFAULT_CHUNK_SIZE))
            .unwrap();

        let mut from_rtmp = Vec::new();

        for item in drain(&mut rtmp_receiver) {
            for msg in composer.feed(&item).unwrap() {
                from_rtmp.push((msg.header.msg_type_id, msg.header.timestamp_abs, msg.payload));
            }
        }

        let mut reader = FlvTagReader::new();
        let mut from_flv = Vec::new();

        for item in drain(&mut flv_receiver) {
            for tag in reader.feed(&item).unwrap() {
                let msg = tag.into_av_msg();
                from_flv.push((msg.header.msg_type_id, msg.header.timestamp_abs, msg.payload));
            }
        }

        assert_eq!(from_rtmp.len(), sent.len());
        assert_eq!(from_rtmp, from_flv);
    }

    #[tokio::test]
    async fn test_unreadable_sps_still_waits_for_keyframe() {
        let clock = Arc::new(ManualClock::new(0));
        let config = GroupConfiguration {
            gop_cache_num: 0,
            ..GroupConfiguration::default()
        };
        let group = make_group(config, clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        // SPS cut before the dimensions
        let sps = make_avc_sps(80, 45, 0);
        let record = AvcDecoderConfig::build(&sps[..4], &[0x68, 0xce, 0x3c, 0x80]);
        let seq_header = AvMsg::new_media(
            RTMP_TYPE_VIDEO,
            0,
            make_video_payload(VIDEO_CODEC_ID_AVC, true, 0, 0, &record),
        );

        group.on_av_msg(pub_id, seq_header).await;
        group.on_av_msg(pub_id, avc_frame(0, true)).await;
        group.on_av_msg(pub_id, avc_frame(40, false)).await;

        let mut receiver = group
            .add_flv_sub(
                make_handle(2, SessionProtocol::FlvSub, &clock),
                make_info(2, SessionProtocol::FlvSub),
            )
            .await
            .unwrap();

        group.on_av_msg(pub_id, avc_frame(80, false)).await;
        group.on_av_msg(pub_id, avc_frame(120, true)).await;

        let mut reader = FlvTagReader::new();
        let mut coded = Vec::new();

        for item in drain(&mut receiver) {
            for tag in reader.feed(&item).unwrap() {
                let msg = tag.into_av_msg();

                if !msg.is_video_key_seq_header() {
                    coded.push(msg);
                }
            }
        }

        assert_eq!(coded.len(), 1);
        assert!(coded[0].is_video_key_frame());
        assert_eq!(coded[0].header.timestamp_abs, 120);

        assert_eq!(group.stat().await.video_codec, "H264");
    }

    #[tokio::test]
    async fn test_idle_dispose_keeps_a_subscriber_that_joined() {
        let clock = Arc::new(ManualClock::new(0));
        let config = GroupConfiguration {
            idle_timeout_ms: 1000,
            ..GroupConfiguration::default()
        };
        let group = make_group(config, clock.clone());

        clock.set(5000);
        assert!(group.is_inactive(5000).await);

        // Joins between the idle check and the sweep
        let sub_handle = make_handle(2, SessionProtocol::RtmpSub, &clock);
        let _receiver = group
            .add_rtmp_sub(sub_handle.clone(), make_info(2, SessionProtocol::RtmpSub))
            .await
            .unwrap();

        assert!(!group.dispose_if_inactive(5000).await);
        assert!(!group.is_disposed());
        assert!(!sub_handle.is_disposed());

        group.del_sub(2).await;

        clock.set(7000);
        assert!(group.dispose_if_inactive(7000).await);
        assert!(group.is_disposed());
        assert!(!group.dispose_if_inactive(7000).await);

        // Swept first: the late subscriber is refused instead of admitted then killed
        let late_handle = make_handle(3, SessionProtocol::RtmpSub, &clock);
        let res = group
            .add_rtmp_sub(late_handle, make_info(3, SessionProtocol::RtmpSub))
            .await;

        assert!(matches!(res, Err(StreamError::GroupNotFound)));
        assert!(group.stat().await.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_audio_only_subscriber_does_not_wait() {
        let clock = Arc::new(ManualClock::new(0));
        let group = make_group(GroupConfiguration::default(), clock.clone());

        let mut receiver = group
            .add_rtmp_sub(
                make_handle(2, SessionProtocol::RtmpSub, &clock),
                make_info(2, SessionProtocol::RtmpSub),
            )
            .await
            .unwrap();

        let pub_id = start_pub(&group, &clock).await;

        group.on_av_msg(pub_id, aac_seq_header(0)).await;
        group.on_av_msg(pub_id, aac_frame(23)).await;

        assert_eq!(drain(&mut receiver).len(), 2);

        let codec_id = aac_frame(0).audio_codec_id();
        assert_eq!(codec_id, Some(AUDIO_CODEC_ID_AAC));
    }

    #[tokio::test]
    async fn test_del_pub_clears_cache() {
        let clock = Arc::new(ManualClock::new(0));
        let group = make_group(GroupConfiguration::default(), clock.clone());

        let pub_id = start_pub(&group, &clock).await;

        group.on_av_msg(pub_id, avc_seq_header(0)).await;
        group.on_av_msg(pub_id, avc_frame(0, true)).await;

        // Not the input
        group.del_pub(99).await;
        assert!(group.has_input().await);

        group.del_pub(pub_id).await;
        assert!(!group.has_input().await);

        let stat = group.stat().await;
        assert_eq!(stat.video_codec, "");

        let new_pub = make_handle(3, SessionProtocol::RtmpPub, &clock);
        group
            .add_rtmp_pub(new_pub, make_info(3, SessionProtocol::RtmpPub))
            .await
            .unwrap();

        let mut receiver = group
            .add_rtmp_sub(
                make_handle(4, SessionProtocol::RtmpSub, &clock),
                make_info(4, SessionProtocol::RtmpSub),
            )
            .await
            .unwrap();

        group.on_av_msg(3, aac_seq_header(0)).await;

        // Nothing replayed from the first publisher
        assert_eq!(drain(&mut receiver).len(), 1);
    }

    #[tokio::test]
    async fn test_liveness_disposes_stale_sessions() {
        let clock = Arc::new(ManualClock::new(0));
        let config = GroupConfiguration {
            read_timeout_ms: 5000,
            write_timeout_ms: 2000,
            idle_timeout_ms: 1000,
            ..GroupConfiguration::default()
        };
        let group = make_group(config, clock.clone());

        let pub_handle = make_handle(1, SessionProtocol::RtmpPub, &clock);
        group
            .add_rtmp_pub(pub_handle.clone(), make_info(1, SessionProtocol::RtmpPub))
            .await
            .unwrap();

        let sub_handle = make_handle(2, SessionProtocol::RtmpSub, &clock);
        let _receiver = group
            .add_rtmp_sub(sub_handle.clone(), make_info(2, SessionProtocol::RtmpSub))
            .await
            .unwrap();

        clock.set(1500);
        pub_handle.add_read_bytes(100);
        group.check_session_liveness(clock.now_ms()).await;
        assert!(!sub_handle.is_disposed());

        clock.set(3000);
        pub_handle.add_read_bytes(100);
        group.check_session_liveness(clock.now_ms()).await;
        assert!(sub_handle.is_disposed());
        assert!(!pub_handle.is_disposed());

        clock.set(9000);
        group.check_session_liveness(clock.now_ms()).await;
        assert!(pub_handle.is_disposed());
        assert!(!group.has_input().await);

        assert!(!group.is_inactive(9500).await);
        assert!(group.is_inactive(10000).await);
    }

    #[tokio::test]
    async fn test_kick_session() {
        let clock = Arc::new(ManualClock::new(0));
        let group = make_group(GroupConfiguration::default(), clock.clone());

        start_pub(&group, &clock).await;

        let sub_handle = make_handle(2, SessionProtocol::FlvSub, &clock);
        let _receiver = group
            .add_flv_sub(sub_handle.clone(), make_info(2, SessionProtocol::FlvSub))
            .await
            .unwrap();

        assert!(!group.kick_session(42).await);
        assert!(group.kick_session(2).await);
        assert!(sub_handle.is_disposed());
        assert!(group.stat().await.subscribers.is_empty());

        group.dispose().await;
        assert!(group.is_disposed());
        assert!(!group.has_input().await);
    }
}
