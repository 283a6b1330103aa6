// Server manager

use std::{net::IpAddr, sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};

use crate::{
    base::{Clock, StatGroup, StreamError, StreamResult, SystemClock},
    callback::{CallbackObserver, NoopObserver, Observer},
    group::Group,
    log::Logger,
    log_debug, log_info,
    session::{CustomizePubSession, SessionHandle, SessionProtocol},
};

use super::{bind_listener, tcp_server, ListenerKind, ServerConfiguration, ServerContext};

/// Period of the liveness tick
const TICK_INTERVAL_MS: u64 = 1000;

/// Owns the listeners, the group registry and the tick task
pub struct ServerManager {
    logger: Arc<Logger>,
    ctx: ServerContext,
    shutdown_sender: watch::Sender<bool>,
}

impl ServerManager {
    /// Creates a manager. The callback observer is used if a callback URL is configured.
    pub fn new(logger: Arc<Logger>, config: Arc<ServerConfiguration>) -> ServerManager {
        let observer: Arc<dyn Observer> = if config.callback.is_enabled() {
            Arc::new(CallbackObserver::new(
                Arc::new(logger.make_child_logger("[CALLBACK] ")),
                config.callback.clone(),
            ))
        } else {
            Arc::new(NoopObserver)
        };

        ServerManager::with_observer(logger, config, observer, Arc::new(SystemClock))
    }

    /// Creates a manager with custom hooks and time source
    pub fn with_observer(
        logger: Arc<Logger>,
        config: Arc<ServerConfiguration>,
        observer: Arc<dyn Observer>,
        clock: Arc<dyn Clock>,
    ) -> ServerManager {
        let (shutdown_sender, shutdown) = watch::channel(false);

        let ctx = ServerContext::new(logger.clone(), config, observer, clock, shutdown);

        ServerManager {
            logger,
            ctx,
            shutdown_sender,
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Binds every configured listener and starts serving
    ///
    /// # Return value
    ///
    /// A receiver notified if a listener stops on its own.
    /// Returns an error if a listener could not be bound; nothing is started then.
    pub async fn start(&self) -> Result<mpsc::Receiver<()>, ()> {
        let config = &self.ctx.config;

        let mut listeners: Vec<(ListenerKind, String)> = Vec::new();

        if !config.rtmp_addr.is_empty() {
            listeners.push((ListenerKind::Rtmp, config.rtmp_addr.clone()));
        }

        if !config.rtsp_addr.is_empty() {
            listeners.push((ListenerKind::Rtsp, config.rtsp_addr.clone()));
        }

        if config.shares_http_listener() {
            listeners.push((ListenerKind::Http, config.httpflv_addr.clone()));
        } else {
            if !config.httpflv_addr.is_empty() {
                listeners.push((ListenerKind::HttpFlv, config.httpflv_addr.clone()));
            }

            if !config.httpts_addr.is_empty() {
                listeners.push((ListenerKind::HttpTs, config.httpts_addr.clone()));
            }
        }

        let mut bound = Vec::new();

        for (kind, addr) in listeners {
            bound.push((kind, bind_listener(&self.logger, kind, &addr).await?));
        }

        let (end_notifier, end_receiver) = mpsc::channel::<()>(bound.len().max(1));

        for (kind, listener) in bound {
            tcp_server(
                Arc::new(self.logger.make_child_logger(&format!("[SERVER:{}] ", kind.name()))),
                self.ctx.clone(),
                listener,
                kind,
                end_notifier.clone(),
            );
        }

        self.spawn_tick_task();

        Ok(end_receiver)
    }

    /// Starts the 1 Hz task checking liveness, erasing idle groups
    /// and reporting statistics
    fn spawn_tick_task(&self) {
        let ctx = self.ctx.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            let update_interval = ctx.config.callback.update_interval_seconds.max(1) as u64;
            let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
            let mut shutdown = ctx.shutdown.clone();
            let mut tick_count: u64 = 0;

            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => break,
                    _ = interval.tick() => {}
                }

                tick_count += 1;

                tick_groups(&ctx, &logger).await;

                if tick_count % update_interval == 0 {
                    let stats = stat_groups(&ctx).await;
                    ctx.observer.on_update(&stats).await;
                }
            }
        });
    }

    /// Stops the listeners and disposes every group
    pub async fn shutdown(&self) {
        let logger = &self.logger;
        log_info!(logger, "Shutting down");

        let _ = self.shutdown_sender.send(true);

        for group in all_groups(&self.ctx) {
            group.dispose().await;
        }

        self.ctx.group_manager.iterate(&mut |_| false);
    }

    ///////////////////////
    //   Admin actions   //
    ///////////////////////

    /// Statistics of every group
    pub async fn stat_all_group(&self) -> Vec<StatGroup> {
        stat_groups(&self.ctx).await
    }

    /// Statistics of one group
    pub async fn stat_group(&self, app_name: &str, stream_name: &str) -> StreamResult<StatGroup> {
        let group = self.find_group(app_name, stream_name)?;
        Ok(group.stat().await)
    }

    /// Closes a session of a group
    pub async fn kick_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session_id: u64,
    ) -> StreamResult<()> {
        let group = self.find_group(app_name, stream_name)?;

        if group.kick_session(session_id).await {
            let logger = &self.logger;
            log_info!(
                logger,
                format!("Kicked session #{} of {}/{}", session_id, app_name, stream_name)
            );
            Ok(())
        } else {
            Err(StreamError::SessionNotFound)
        }
    }

    /// Starts pulling a stream from another server
    ///
    /// # Arguments
    ///
    /// * `app_name` - Application name
    /// * `stream_name` - Stream name
    /// * `url` - Source URL, the configured relay pull URL if None
    pub async fn start_relay_pull(
        &self,
        app_name: &str,
        stream_name: &str,
        url: Option<String>,
    ) -> StreamResult<()> {
        let (group, _) = self.ctx.group_manager.get_or_create(app_name, stream_name);
        group.start_relay_pull(url).await
    }

    /// Stops the relay pull of a group
    pub async fn stop_relay_pull(&self, app_name: &str, stream_name: &str) -> StreamResult<()> {
        let group = self.find_group(app_name, stream_name)?;
        group.stop_relay_pull().await
    }

    /// Adds an in-process publisher
    pub async fn add_customize_pub_session(
        &self,
        app_name: &str,
        stream_name: &str,
    ) -> StreamResult<CustomizePubSession> {
        let (group, _) = self.ctx.group_manager.get_or_create(app_name, stream_name);

        let handle = Arc::new(SessionHandle::new(
            self.ctx.session_id_generator.generate_id(),
            SessionProtocol::CustomizePub,
            "",
            self.ctx.clock.clone(),
        ));

        CustomizePubSession::start(group, handle).await
    }

    /// Refuses connections from an address for a while
    pub async fn add_ip_blacklist(&self, ip: IpAddr, duration_sec: u32) {
        let logger = &self.logger;
        log_info!(logger, format!("Blacklisted {} for {} seconds", ip, duration_sec));

        self.ctx.ip_blacklist.add(ip, duration_sec).await;
    }

    fn find_group(&self, app_name: &str, stream_name: &str) -> StreamResult<Arc<Group>> {
        self.ctx
            .group_manager
            .get(app_name, stream_name)
            .filter(|g| !g.is_disposed())
            .ok_or(StreamError::GroupNotFound)
    }
}

fn all_groups(ctx: &ServerContext) -> Vec<Arc<Group>> {
    let mut groups = Vec::new();

    ctx.group_manager.iterate(&mut |g| {
        groups.push(g.clone());
        true
    });

    groups
}

async fn stat_groups(ctx: &ServerContext) -> Vec<StatGroup> {
    let mut stats = Vec::new();

    for group in all_groups(ctx) {
        if !group.is_disposed() {
            stats.push(group.stat().await);
        }
    }

    stats
}

/// One liveness pass over every group
async fn tick_groups(ctx: &ServerContext, logger: &Logger) {
    let now = ctx.clock.now_ms();

    for group in all_groups(ctx) {
        group.check_session_liveness(now).await;

        if group.dispose_if_inactive(now).await {
            log_debug!(
                logger,
                format!("Erased idle group {}/{}", group.app_name(), group.stream_name())
            );
        }
    }

    ctx.group_manager.iterate(&mut |g| !g.is_disposed());
}

// Tests
