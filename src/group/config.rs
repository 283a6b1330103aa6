// Group configuration

/// What to do when a subscriber send channel is full
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Dispose the slow subscriber
    Drop,

    /// Wait for room in the channel
    Block,
}

impl BackpressurePolicy {
    pub fn parse(s: &str) -> Option<BackpressurePolicy> {
        match s.to_lowercase().as_str() {
            "drop" => Some(BackpressurePolicy::Drop),
            "block" => Some(BackpressurePolicy::Block),
            _ => None,
        }
    }
}

/// Settings every group of a server shares
#[derive(Clone, Debug)]
pub struct GroupConfiguration {
    /// Number of GOPs kept for late subscribers
    pub gop_cache_num: usize,

    /// Outgoing RTMP chunk size
    pub chunk_size: u32,

    /// Max size of a message read from a relay pull
    pub max_message_size: u32,

    /// Capacity of each subscriber send channel
    pub write_chan_size: usize,

    /// Subscriber write timeout (milliseconds)
    pub write_timeout_ms: u64,

    /// Publisher read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Policy when a subscriber channel is full
    pub backpressure_policy: BackpressurePolicy,

    /// Time a group without sessions is kept (milliseconds)
    pub idle_timeout_ms: i64,

    /// Pull the stream from a remote server on demand
    pub relay_pull_enable: bool,

    /// Base URL for relay pulls (rtmp://host:port)
    pub relay_pull_url: String,

    /// Time a relay pull is kept without subscribers (milliseconds)
    pub relay_pull_stop_grace_ms: i64,

    /// Forward published streams to remote servers
    pub relay_push_enable: bool,

    /// Base URLs of the relay push targets
    pub relay_push_targets: Vec<String>,

    /// Insert silent audio in video-only streams
    pub dummy_audio_enable: bool,

    /// Stream time to wait for audio before synthesising it
    pub dummy_audio_wait_audio_ms: u32,
}

impl Default for GroupConfiguration {
    fn default() -> Self {
        GroupConfiguration {
            gop_cache_num: 1,
            chunk_size: 4096,
            max_message_size: 16 * 1024 * 1024,
            write_chan_size: 1024,
            write_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            backpressure_policy: BackpressurePolicy::Drop,
            idle_timeout_ms: 10_000,
            relay_pull_enable: false,
            relay_pull_url: "".to_string(),
            relay_pull_stop_grace_ms: 5_000,
            relay_push_enable: false,
            relay_push_targets: Vec::new(),
            dummy_audio_enable: false,
            dummy_audio_wait_audio_ms: 1000,
        }
    }
}

impl GroupConfiguration {
    /// URL pulled for a stream, if relay pull is enabled
    pub fn relay_pull_url_for(&self, app_name: &str, stream_name: &str) -> Option<String> {
        if !self.relay_pull_enable || self.relay_pull_url.is_empty() {
            return None;
        }

        Some(join_stream_url(&self.relay_pull_url, app_name, stream_name))
    }

    /// URLs pushed for a stream, if relay push is enabled
    pub fn relay_push_urls_for(&self, app_name: &str, stream_name: &str) -> Vec<String> {
        if !self.relay_push_enable {
            return Vec::new();
        }

        self.relay_push_targets
            .iter()
            .map(|base| join_stream_url(base, app_name, stream_name))
            .collect()
    }
}

fn join_stream_url(base: &str, app_name: &str, stream_name: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), app_name, stream_name)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_urls() {
        let mut config = GroupConfiguration::default();

        assert_eq!(config.relay_pull_url_for("live", "a"), None);

        config.relay_pull_enable = true;
        config.relay_pull_url = "rtmp://origin:1935/".to_string();

        assert_eq!(
            config.relay_pull_url_for("live", "a").as_deref(),
            Some("rtmp://origin:1935/live/a")
        );

        config.relay_push_targets = vec!["rtmp://a".to_string(), "rtmp://b:19350".to_string()];
        assert!(config.relay_push_urls_for("live", "s").is_empty());

        config.relay_push_enable = true;
        assert_eq!(
            config.relay_push_urls_for("live", "s"),
            vec!["rtmp://a/live/s".to_string(), "rtmp://b:19350/live/s".to_string()]
        );
    }

    #[test]
    fn test_backpressure_policy_parse() {
        assert_eq!(BackpressurePolicy::parse("DROP"), Some(BackpressurePolicy::Drop));
        assert_eq!(BackpressurePolicy::parse("block"), Some(BackpressurePolicy::Block));
        assert_eq!(BackpressurePolicy::parse("other"), None);
    }
}
