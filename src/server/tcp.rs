// TCP listeners

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::Sender,
};

use crate::{
    log::Logger,
    log_debug, log_error, log_info,
    session::{
        handle_http_sub_session, handle_rtmp_server_session, handle_rtsp_server_session,
        HttpSubFormat,
    },
};

use super::ServerContext;

const HTTP_FORMATS_FLV: &[HttpSubFormat] = &[HttpSubFormat::Flv];
const HTTP_FORMATS_TS: &[HttpSubFormat] = &[HttpSubFormat::Ts];
const HTTP_FORMATS_ALL: &[HttpSubFormat] = &[HttpSubFormat::Flv, HttpSubFormat::Ts];

/// Protocol served by a listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerKind {
    Rtmp,
    Rtsp,
    HttpFlv,
    HttpTs,

    /// HTTP-FLV and HTTP-TS on the same address
    Http,
}

impl ListenerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ListenerKind::Rtmp => "RTMP",
            ListenerKind::Rtsp => "RTSP",
            ListenerKind::HttpFlv => "HTTP-FLV",
            ListenerKind::HttpTs => "HTTP-TS",
            ListenerKind::Http => "HTTP",
        }
    }
}

/// Binds a listener
///
/// # Arguments
///
/// * `logger` - Logger to report the error
/// * `kind` - Protocol of the listener
/// * `listen_addr` - Address to bind
pub async fn bind_listener(
    logger: &Logger,
    kind: ListenerKind,
    listen_addr: &str,
) -> Result<TcpListener, ()> {
    match TcpListener::bind(listen_addr).await {
        Ok(l) => Ok(l),
        Err(e) => {
            log_error!(
                logger,
                format!("Could not create {} listener on {}: {}", kind.name(), listen_addr, e)
            );
            Err(())
        }
    }
}

/// Runs the accept loop of a bound listener
///
/// # Arguments
///
/// * `logger` - Listener logger
/// * `server_context` - Server context
/// * `listener` - Bound listener
/// * `kind` - Protocol of the listener
/// * `end_notifier` - Notified if the listener stops without a shutdown
pub fn tcp_server(
    logger: Arc<Logger>,
    server_context: ServerContext,
    listener: TcpListener,
    kind: ListenerKind,
    end_notifier: Sender<()>,
) {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            log_info!(logger, format!("Listening on {}", addr));
        }

        let mut shutdown = server_context.shutdown.clone();

        loop {
            let accept_res = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => {
                    log_debug!(logger, "Listener closed");
                    return;
                }
                r = listener.accept() => r,
            };

            match accept_res {
                Ok((connection, addr)) => {
                    handle_connection_tcp(
                        logger.clone(),
                        server_context.clone(),
                        connection,
                        addr,
                        kind,
                    );
                }
                Err(e) => {
                    log_error!(logger, format!("Could not accept connection: {}", e));
                    let _ = end_notifier.send(()).await;
                    return;
                }
            }
        }
    });
}

/// Handles a TCP connection, spawning a task for it
fn handle_connection_tcp(
    logger: Arc<Logger>,
    server_context: ServerContext,
    connection: TcpStream,
    addr: SocketAddr,
    kind: ListenerKind,
) {
    tokio::spawn(async move {
        if server_context.ip_blacklist.contains(&addr.ip()).await {
            log_info!(logger, format!("Rejected connection from blacklisted {}", addr.ip()));
            return;
        }

        let _ = connection.set_nodelay(true);
        let remote_addr = addr.to_string();

        match kind {
            ListenerKind::Rtmp => {
                handle_rtmp_server_session(logger, server_context, connection, remote_addr).await
            }
            ListenerKind::Rtsp => {
                handle_rtsp_server_session(logger, server_context, connection, remote_addr).await
            }
            ListenerKind::HttpFlv => {
                handle_http_sub_session(
                    logger,
                    server_context,
                    connection,
                    remote_addr,
                    HTTP_FORMATS_FLV,
                )
                .await
            }
            ListenerKind::HttpTs => {
                handle_http_sub_session(
                    logger,
                    server_context,
                    connection,
                    remote_addr,
                    HTTP_FORMATS_TS,
                )
                .await
            }
            ListenerKind::Http => {
                handle_http_sub_session(
                    logger,
                    server_context,
                    connection,
                    remote_addr,
                    HTTP_FORMATS_ALL,
                )
                .await
            }
        }
    });
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::{ManualClock, StreamError},
        callback::NoopObserver,
        server::{ServerConfiguration, ServerManager},
        session::{RtmpClientConnection, RtmpUrl},
    };

    async fn start_rtmp_listener(manager: &ServerManager) -> SocketAddr {
        let logger = Arc::new(Logger::new_disabled());
        let listener = bind_listener(&logger, ListenerKind::Rtmp, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (end_notifier, _) = tokio::sync::mpsc::channel(1);

        tcp_server(logger, manager.context().clone(), listener, ListenerKind::Rtmp, end_notifier);

        addr
    }

    fn make_manager() -> ServerManager {
        ServerManager::with_observer(
            Arc::new(Logger::new_disabled()),
            Arc::new(ServerConfiguration::default()),
            Arc::new(NoopObserver),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[tokio::test]
    async fn test_rtmp_publish_over_loopback() {
        let manager = make_manager();
        let addr = start_rtmp_listener(&manager).await;

        let url = RtmpUrl::parse(&format!("rtmp://{}/live/loopback", addr)).unwrap();
        let connection = TcpStream::connect(addr).await.unwrap();

        let _publisher = RtmpClientConnection::start(connection, &url, true, 1 << 20)
            .await
            .unwrap();

        let stat = manager.stat_group("live", "loopback").await.unwrap();
        let input = stat.input.unwrap();

        assert_eq!(input.protocol, "RTMPPUB");
        assert!(input.remote_addr.starts_with("127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_blacklisted_connection_is_closed() {
        let manager = make_manager();
        let addr = start_rtmp_listener(&manager).await;

        manager.add_ip_blacklist("127.0.0.1".parse().unwrap(), 60).await;

        let url = RtmpUrl::parse(&format!("rtmp://{}/live/blocked", addr)).unwrap();
        let connection = TcpStream::connect(addr).await.unwrap();

        let res = RtmpClientConnection::start(connection, &url, true, 1 << 20).await;

        assert!(matches!(res, Err(StreamError::Io(_))));
        assert!(manager.stat_group("live", "blocked").await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let logger = Logger::new_disabled();

        let first = bind_listener(&logger, ListenerKind::Rtsp, "127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().unwrap().to_string();

        assert!(bind_listener(&logger, ListenerKind::Rtsp, &taken).await.is_err());
    }
}
