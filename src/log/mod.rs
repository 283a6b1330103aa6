// Logging with levels and hierarchical prefixes

mod config;
mod logger;

pub use config::*;
pub use logger::*;

/// Logs at a level if it is enabled. Used by the level macros.
#[macro_export]
macro_rules! log_at {
    ($logger:ident, $enabled:ident, $tag:literal, $msg:expr) => {
        if $logger.config.$enabled {
            $logger.log(&format!(concat!($tag, " {}"), $msg));
        }
    };
}

/// Logs an ERROR message
///
/// The first argument is the logger identifier, the second the message.
#[macro_export]
macro_rules! log_error {
    ($logger:ident, $msg:expr) => {
        $crate::log_at!($logger, error_enabled, "[ERROR]", $msg)
    };
}

/// Logs a WARNING message
#[macro_export]
macro_rules! log_warning {
    ($logger:ident, $msg:expr) => {
        $crate::log_at!($logger, warning_enabled, "[WARNING]", $msg)
    };
}

/// Logs an INFO message
#[macro_export]
macro_rules! log_info {
    ($logger:ident, $msg:expr) => {
        $crate::log_at!($logger, info_enabled, "[INFO]", $msg)
    };
}

/// Logs a DEBUG message
#[macro_export]
macro_rules! log_debug {
    ($logger:ident, $msg:expr) => {
        $crate::log_at!($logger, debug_enabled, "[DEBUG]", $msg)
    };
}

/// Logs a TRACE message. The message is only built when tracing is enabled.
#[macro_export]
macro_rules! log_trace {
    ($logger:ident, $msg:expr) => {
        $crate::log_at!($logger, trace_enabled, "[TRACE]", $msg)
    };
}
