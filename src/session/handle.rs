// Session handle shared between a session task and its group

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::watch;

use crate::base::{Clock, StatSession};

/// Kind of session, as reported in statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionProtocol {
    RtmpPub,
    RtmpSub,
    RtspPub,
    RtspSub,
    FlvSub,
    TsSub,
    RelayPull,
    RelayPush,
    CustomizePub,
}

impl SessionProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionProtocol::RtmpPub => "RTMPPUB",
            SessionProtocol::RtmpSub => "RTMPSUB",
            SessionProtocol::RtspPub => "RTSPPUB",
            SessionProtocol::RtspSub => "RTSPSUB",
            SessionProtocol::FlvSub => "FLVSUB",
            SessionProtocol::TsSub => "TSSUB",
            SessionProtocol::RelayPull => "RELAYPULL",
            SessionProtocol::RelayPush => "RELAYPUSH",
            SessionProtocol::CustomizePub => "CUSTOMIZEPUB",
        }
    }

    /// True for sessions that feed a group
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            SessionProtocol::RtmpPub
                | SessionProtocol::RtspPub
                | SessionProtocol::RelayPull
                | SessionProtocol::CustomizePub
        )
    }
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a running session.
///
/// The session task owns the socket. The group keeps an
/// `Arc<SessionHandle>` to read statistics, check liveness
/// and order the session to close.
pub struct SessionHandle {
    id: u64,
    protocol: SessionProtocol,
    remote_addr: String,
    start_time_ms: i64,

    clock: Arc<dyn Clock>,

    read_bytes: AtomicU64,
    wrote_bytes: AtomicU64,
    last_read_ms: AtomicI64,
    last_write_ms: AtomicI64,

    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,

    disposed: AtomicBool,
    dispose_signal: watch::Sender<bool>,
}

impl SessionHandle {
    /// Creates a handle
    ///
    /// # Arguments
    ///
    /// * `id` - Unique session id
    /// * `protocol` - Session kind
    /// * `remote_addr` - Address of the peer (empty for in-process sessions)
    /// * `clock` - Clock used for activity timestamps
    pub fn new(
        id: u64,
        protocol: SessionProtocol,
        remote_addr: &str,
        clock: Arc<dyn Clock>,
    ) -> SessionHandle {
        let now = clock.now_ms();
        let (dispose_signal, _) = watch::channel(false);

        SessionHandle {
            id,
            protocol,
            remote_addr: remote_addr.to_string(),
            start_time_ms: now,
            clock,
            read_bytes: AtomicU64::new(0),
            wrote_bytes: AtomicU64::new(0),
            last_read_ms: AtomicI64::new(now),
            last_write_ms: AtomicI64::new(now),
            read_timeout_ms: AtomicU64::new(0),
            write_timeout_ms: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            dispose_signal,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.protocol
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Records bytes received from the peer
    pub fn add_read_bytes(&self, n: usize) {
        self.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.last_read_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
    }

    /// Records bytes sent to the peer
    pub fn add_wrote_bytes(&self, n: usize) {
        self.wrote_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.touch_write();
    }

    /// Resets the write activity time without counting bytes
    pub fn touch_write(&self) {
        self.last_write_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
    }

    /// Sets the liveness thresholds. Zero disables a check.
    ///
    /// # Arguments
    ///
    /// * `read_timeout_ms` - Max time without receiving bytes
    /// * `write_timeout_ms` - Max time without sending bytes
    pub fn set_caps(&self, read_timeout_ms: u64, write_timeout_ms: u64) {
        self.read_timeout_ms
            .store(read_timeout_ms, Ordering::Relaxed);
        self.write_timeout_ms
            .store(write_timeout_ms, Ordering::Relaxed);
    }

    /// True if the session did not read for longer than its read cap
    pub fn is_read_stale(&self, now_ms: i64) -> bool {
        let cap = self.read_timeout_ms.load(Ordering::Relaxed);

        cap > 0 && now_ms - self.last_read_ms.load(Ordering::Relaxed) > cap as i64
    }

    /// True if the session did not write for longer than its write cap
    pub fn is_write_stale(&self, now_ms: i64) -> bool {
        let cap = self.write_timeout_ms.load(Ordering::Relaxed);

        cap > 0 && now_ms - self.last_write_ms.load(Ordering::Relaxed) > cap as i64
    }

    /// Orders the session to close.
    ///
    /// Only the first call has an effect.
    ///
    /// # Return value
    ///
    /// Returns true for the call that disposed the session
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.dispose_signal.send_replace(true);

        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been disposed
    pub async fn closed(&self) {
        let mut receiver = self.dispose_signal.subscribe();
        let _ = receiver.wait_for(|disposed| *disposed).await;
    }

    pub fn stat(&self) -> StatSession {
        StatSession {
            session_id: self.id,
            protocol: self.protocol.as_str().to_string(),
            remote_addr: self.remote_addr.clone(),
            start_time_ms: self.start_time_ms,
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            wrote_bytes: self.wrote_bytes.load(Ordering::Relaxed),
        }
    }
}

// Tests
