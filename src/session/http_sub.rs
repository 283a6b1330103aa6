// HTTP-FLV and HTTP-TS subscriber sessions

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::{stream, SinkExt, StreamExt};
use hyper::server::conn::http1;
use hyper_util::{
    rt::{TokioIo, TokioTimer},
    service::TowerToHyperService,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Notify},
};

use crate::{
    base::{PubSubInfo, StreamError, StreamResult},
    group::Group,
    log::Logger,
    log_debug, log_info,
    remux::flv_file_header,
    server::{check_stream_sign, AuthTarget, ServerContext},
    utils::split_query,
};

use super::{SessionHandle, SessionProtocol};

/// Time allowed to receive the request head
const HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Container served to a subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpSubFormat {
    Flv,
    Ts,
}

impl HttpSubFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            HttpSubFormat::Flv => "video/x-flv",
            HttpSubFormat::Ts => "video/mp2t",
        }
    }

    pub fn protocol(&self) -> SessionProtocol {
        match self {
            HttpSubFormat::Flv => SessionProtocol::FlvSub,
            HttpSubFormat::Ts => SessionProtocol::TsSub,
        }
    }
}

/// Target of a subscriber request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpSubTarget {
    pub app_name: String,
    pub stream_name: String,
    pub format: HttpSubFormat,
    pub raw_query: String,
}

impl HttpSubTarget {
    /// Parses `/{app}/{stream}.flv` or `/{app}/{stream}.ts`, with optional query
    pub fn parse(uri: &str) -> Option<HttpSubTarget> {
        let (path, raw_query) = split_query(uri);
        let (app, file) = path.rsplit_once('/')?;

        let (stream_name, format) = if let Some(s) = file.strip_suffix(".flv") {
            (s, HttpSubFormat::Flv)
        } else if let Some(s) = file.strip_suffix(".ts") {
            (s, HttpSubFormat::Ts)
        } else {
            return None;
        };

        if stream_name.is_empty() {
            return None;
        }

        Some(HttpSubTarget {
            app_name: app.trim_matches('/').to_string(),
            stream_name: stream_name.to_string(),
            format,
            raw_query: raw_query.to_string(),
        })
    }
}

/// State of the router serving one connection
#[derive(Clone)]
struct HttpSubState {
    logger: Arc<Logger>,
    ctx: ServerContext,
    session_id: u64,
    remote_addr: String,
    formats: &'static [HttpSubFormat],

    /// Notified when the subscriber of the connection is disposed
    kicked: Arc<Notify>,
}

/// Removes the subscriber from its group when the output ends
struct SubscriberGuard {
    group: Arc<Group>,
    handle: Arc<SessionHandle>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.handle.dispose();

        let group = self.group.clone();
        let id = self.handle.id();

        tokio::spawn(async move {
            group.del_sub(id).await;
        });
    }
}

/// Handles an accepted HTTP connection
///
/// The connection serves a single request.
///
/// # Arguments
///
/// * `logger` - Listener logger
/// * `ctx` - Server context
/// * `stream` - Accepted connection
/// * `remote_addr` - Address of the peer
/// * `formats` - Containers served by the listener
pub async fn handle_http_sub_session<S>(
    logger: Arc<Logger>,
    ctx: ServerContext,
    stream: S,
    remote_addr: String,
    formats: &'static [HttpSubFormat],
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session_id = ctx.session_id_generator.generate_id();
    let logger = Arc::new(logger.make_child_logger(&format!("[#{}] ", session_id)));
    let kicked = Arc::new(Notify::new());

    let state = HttpSubState {
        logger: logger.clone(),
        ctx,
        session_id,
        remote_addr,
        formats,
        kicked: kicked.clone(),
    };

    let router = Router::new()
        .route("/{*path}", get(handle_sub_request))
        .with_state(state);

    let connection = http1::Builder::new()
        .keep_alive(false)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECONDS))
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router))
        .with_upgrades();

    tokio::select! {
        r = connection => {
            if let Err(e) = r {
                log_debug!(logger, format!("Connection error: {}", e));
            }
        }
        _ = kicked.notified() => {
            log_debug!(logger, "Subscriber disposed");
        }
    }

    log_debug!(logger, "Connection closed");
}

fn status_response(status: StatusCode) -> Response {
    (status, [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")]).into_response()
}

async fn handle_sub_request(
    State(state): State<HttpSubState>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let logger = &state.logger;

    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let target = match HttpSubTarget::parse(path_and_query) {
        Some(t) if state.formats.contains(&t.format) => t,
        _ => {
            log_debug!(logger, format!("Not found: {}", path_and_query));
            return status_response(StatusCode::NOT_FOUND);
        }
    };

    let auth = &state.ctx.config.auth;

    if let Err(e) =
        check_stream_sign(auth, AuthTarget::Sub, &target.stream_name, &target.raw_query)
    {
        log_info!(logger, format!("Refused {}: {}", path_and_query, e));
        return status_response(StatusCode::FORBIDDEN);
    }

    let protocol = target.format.protocol();

    let handle = Arc::new(SessionHandle::new(
        state.session_id,
        protocol,
        &state.remote_addr,
        state.ctx.clock.clone(),
    ));

    let info = PubSubInfo {
        session_id: state.session_id,
        protocol: protocol.as_str().to_string(),
        app_name: target.app_name.clone(),
        stream_name: target.stream_name.clone(),
        raw_query: target.raw_query.clone(),
        remote_addr: state.remote_addr.clone(),
    };

    let (group, _) = state
        .ctx
        .group_manager
        .get_or_create(&target.app_name, &target.stream_name);

    let receiver = match target.format {
        HttpSubFormat::Flv => group.add_flv_sub(handle.clone(), info).await,
        HttpSubFormat::Ts => group.add_ts_sub(handle.clone(), info).await,
    };

    let receiver = match receiver {
        Ok(r) => r,
        Err(e) => {
            log_info!(logger, format!("Refused {}: {}", path_and_query, e));
            return status_response(StatusCode::FORBIDDEN);
        }
    };

    log_info!(
        logger,
        format!(
            "{} subscriber of {}/{}",
            protocol.as_str(),
            target.app_name,
            target.stream_name
        )
    );

    // A disposed subscriber ends the connection, even with a stalled write
    let kicked = state.kicked.clone();
    let watched = handle.clone();
    tokio::spawn(async move {
        watched.closed().await;
        kicked.notify_one();
    });

    let guard = SubscriberGuard { group, handle };

    // FLV streams start with the file header
    let preamble = match target.format {
        HttpSubFormat::Flv => Some(Bytes::copy_from_slice(&flv_file_header(true, true))),
        HttpSubFormat::Ts => None,
    };

    match ws {
        Ok(ws) => {
            let write_timeout_ms = state.ctx.config.group.write_timeout_ms;
            let logger = logger.clone();

            ws.on_upgrade(move |socket| async move {
                let result =
                    run_websocket_output(socket, &guard, receiver, preamble, write_timeout_ms)
                        .await;

                if let Err(e) = result {
                    log_debug!(logger, format!("Subscriber ended: {}", e));
                }
            })
        }
        Err(_) => plain_response(target.format, guard, receiver, preamble),
    }
}

/// Streaming response carrying the container as its body
fn plain_response(
    format: HttpSubFormat,
    guard: SubscriberGuard,
    receiver: mpsc::Receiver<Bytes>,
    preamble: Option<Bytes>,
) -> Response {
    let items = stream::unfold((guard, receiver), |(guard, mut receiver)| async move {
        let item = tokio::select! {
            _ = guard.handle.closed() => None,
            item = receiver.recv() => item,
        }?;

        guard.handle.add_wrote_bytes(item.len());

        Some((Ok::<Bytes, std::io::Error>(item), (guard, receiver)))
    });

    let body = stream::iter(preamble.map(Ok)).chain(items);

    (
        [
            (header::CONTENT_TYPE, format.content_type()),
            (header::CONNECTION, "close"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "-1"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// Runs an async write with the configured limit
async fn with_write_timeout<F, T>(write_timeout_ms: u64, f: F) -> StreamResult<T>
where
    F: std::future::Future<Output = StreamResult<T>>,
{
    if write_timeout_ms == 0 {
        return f.await;
    }

    match tokio::time::timeout(Duration::from_millis(write_timeout_ms), f).await {
        Ok(r) => r,
        Err(_) => Err(StreamError::timed_out("write")),
    }
}

/// Streams the container as binary WebSocket frames
async fn run_websocket_output(
    socket: WebSocket,
    guard: &SubscriberGuard,
    mut receiver: mpsc::Receiver<Bytes>,
    preamble: Option<Bytes>,
    write_timeout_ms: u64,
) -> StreamResult<()> {
    let handle = &guard.handle;
    let (mut sink, mut source) = socket.split();

    // Incoming frames are ignored until Close
    let watched = handle.clone();
    let watcher = tokio::spawn(async move {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        watched.dispose();
    });

    let mut result = Ok(());

    if let Some(p) = preamble {
        result = with_write_timeout(write_timeout_ms, async {
            sink.send(Message::Binary(p)).await.map_err(ws_error)
        })
        .await;
    }

    if result.is_ok() {
        loop {
            let item = tokio::select! {
                _ = handle.closed() => None,
                item = receiver.recv() => item,
            };

            let item = match item {
                Some(i) => i,
                None => break,
            };

            let len = item.len();

            result = with_write_timeout(write_timeout_ms, async {
                sink.send(Message::Binary(item)).await.map_err(ws_error)
            })
            .await;

            if result.is_err() {
                break;
            }

            handle.add_wrote_bytes(len);
        }
    }

    watcher.abort();
    let _ = sink.close().await;

    result
}

fn ws_error(e: axum::Error) -> StreamError {
    StreamError::Io(std::io::Error::other(e.to_string()))
}

// Tests
