// Context types to group parameters

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    base::Clock,
    callback::Observer,
    group::{
        ComplexGroupManager, Group, GroupContext, GroupFactory, GroupManager, SimpleGroupManager,
    },
    log::Logger,
};

use super::{GroupManagerMode, IpBlacklist, ServerConfiguration, SessionIdGenerator};

/// Server context, cloned into every listener and session
#[derive(Clone)]
pub struct ServerContext {
    /// Server configuration
    pub config: Arc<ServerConfiguration>,

    /// Group registry
    pub group_manager: Arc<dyn GroupManager>,

    /// Session ID generator
    pub session_id_generator: Arc<SessionIdGenerator>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Refused addresses
    pub ip_blacklist: Arc<IpBlacklist>,

    /// Event hooks
    pub observer: Arc<dyn Observer>,

    /// Becomes true when the server shuts down
    pub shutdown: watch::Receiver<bool>,
}

impl ServerContext {
    /// Builds the context and the group registry
    ///
    /// # Arguments
    ///
    /// * `logger` - Server logger, groups log through child loggers of it
    /// * `config` - Server configuration
    /// * `observer` - Event hooks
    /// * `clock` - Time source
    /// * `shutdown` - Shutdown flag receiver
    pub fn new(
        logger: Arc<Logger>,
        config: Arc<ServerConfiguration>,
        observer: Arc<dyn Observer>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> ServerContext {
        let session_id_generator = Arc::new(SessionIdGenerator::new());

        let group_context = GroupContext {
            config: Arc::new(config.group.clone()),
            observer: observer.clone(),
            clock: clock.clone(),
            session_id_generator: session_id_generator.clone(),
        };

        let factory: GroupFactory = Box::new(move |app_name: &str, stream_name: &str| {
            Arc::new(Group::new(
                &logger,
                app_name,
                stream_name,
                group_context.clone(),
            ))
        });

        let group_manager: Arc<dyn GroupManager> = match config.group_manager_mode {
            GroupManagerMode::Simple => Arc::new(SimpleGroupManager::new(factory)),
            GroupManagerMode::Complex => Arc::new(ComplexGroupManager::new(factory)),
        };

        let ip_blacklist = Arc::new(IpBlacklist::new(config.ip_blacklist.clone(), clock.clone()));

        ServerContext {
            config,
            group_manager,
            session_id_generator,
            clock,
            ip_blacklist,
            observer,
            shutdown,
        }
    }

    /// True once shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Context with default configuration, no observer and the system clock
#[cfg(test)]
pub fn test_server_context() -> ServerContext {
    test_server_context_with(ServerConfiguration::default())
}

/// Context with the given configuration, no observer and the system clock
#[cfg(test)]
pub fn test_server_context_with(config: ServerConfiguration) -> ServerContext {
    let (_, shutdown) = watch::channel(false);

    ServerContext::new(
        Arc::new(Logger::new_disabled()),
        Arc::new(config),
        Arc::new(crate::callback::NoopObserver),
        Arc::new(crate::base::SystemClock),
        shutdown,
    )
}
