// Logger

use super::config::LogConfig;
use chrono::{DateTime, Local};

/// Logger
pub struct Logger {
    /// Configuration
    pub config: LogConfig,
}

impl Logger {
    // Creates new logger
    pub fn new(config: LogConfig) -> Logger {
        Logger { config }
    }

    // Creates new fully disabled logger
    pub fn new_disabled() -> Logger {
        Logger {
            config: LogConfig {
                prefix: "".to_string(),
                error_enabled: false,
                warning_enabled: false,
                info_enabled: false,
                debug_enabled: false,
                trace_enabled: false,
            },
        }
    }

    /// Makes a child logger, sharing the levels and extending the prefix
    pub fn make_child_logger(&self, prefix: &str) -> Logger {
        Logger {
            config: self.config.child_config(prefix),
        }
    }

    /// Logs a line with the time and the prefix
    ///
    /// Lines go to stderr when tracing, so stdout stays readable.
    pub fn log(&self, line: &str) {
        let time_local: DateTime<Local> = Local::now();
        let time_format = time_local.format("[%Y-%m-%d %H:%M:%S] ");

        if self.config.trace_enabled {
            eprintln!("{}{}{}", time_format, self.config.prefix, line);
        } else {
            println!("{}{}{}", time_format, self.config.prefix, line);
        }
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_logger_prefix() {
        let logger = Logger::new(LogConfig {
            prefix: "[SERVER] ".to_string(),
            error_enabled: true,
            warning_enabled: true,
            info_enabled: false,
            debug_enabled: false,
            trace_enabled: false,
        });

        let child = logger.make_child_logger("[GROUP:live/test] ");

        assert_eq!(child.config.prefix, "[SERVER] [GROUP:live/test] ");
        assert!(child.config.warning_enabled);
        assert!(!child.config.info_enabled);
    }
}
