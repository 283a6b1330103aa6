// Error kinds

use thiserror::Error;

/// Errors surfaced by the streaming core
#[derive(Debug, Error)]
pub enum StreamError {
    /// The chunk stream could not be framed
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// The peer sent signalling that does not fit the session state
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A media payload could not be parsed
    #[error("malformed media: {0}")]
    MalformedMedia(String),

    /// The stream already has an input
    #[error("stream {0} already has a publisher")]
    DupPublisher(String),

    /// Admission refused by auth or by an observer
    #[error("refused: {0}")]
    Refused(String),

    /// The subscriber send channel is full
    #[error("subscriber send channel is full")]
    SubscriberBackpressure,

    /// Network level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("group not found")]
    GroupNotFound,

    #[error("session not found")]
    SessionNotFound,

    /// Invalid configuration (startup only)
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StreamError {
    /// Error used when the other end of a channel or socket is gone
    pub fn closed() -> StreamError {
        StreamError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    /// Error used when a peer does not answer in time
    pub fn timed_out(what: &str) -> StreamError {
        StreamError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{} timed out", what),
        ))
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
