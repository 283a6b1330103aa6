// Server configuration

use ipnet::IpNet;

use crate::{
    callback::CallbackConfiguration,
    group::{BackpressurePolicy, GroupConfiguration},
    log::Logger,
    log_error, log_warning,
    rtmp::{RTMP_DEFAULT_MAX_MESSAGE_SIZE, RTMP_MAX_CHUNK_SIZE},
    utils::{get_env_bool, get_env_list, get_env_string, get_env_u32},
};

/// Sessions that must carry a valid sign
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScope {
    /// No check
    None,

    /// RTMP publishers only
    RtmpPub,

    /// RTMP publishers and every subscriber
    AnySub,
}

impl AuthScope {
    pub fn parse(s: &str) -> Option<AuthScope> {
        match s.to_lowercase().as_str() {
            "" | "none" => Some(AuthScope::None),
            "rtmp-pub" => Some(AuthScope::RtmpPub),
            "any-sub" => Some(AuthScope::AnySub),
            _ => None,
        }
    }
}

/// Authentication configuration
#[derive(Clone)]
pub struct AuthConfiguration {
    /// Key used to compute the sign
    pub key: String,

    /// Sessions to check
    pub scope: AuthScope,
}

/// How groups are keyed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupManagerMode {
    /// By stream name
    Simple,

    /// By (app, stream)
    Complex,
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfiguration {
    /// RTMP listen address (empty = disabled)
    pub rtmp_addr: String,

    /// RTSP listen address (empty = disabled)
    pub rtsp_addr: String,

    /// HTTP-FLV listen address (empty = disabled)
    pub httpflv_addr: String,

    /// HTTP-TS listen address (empty = disabled)
    pub httpts_addr: String,

    /// Group behaviour
    pub group: GroupConfiguration,

    /// Group registry mode
    pub group_manager_mode: GroupManagerMode,

    /// Sign checks
    pub auth: AuthConfiguration,

    /// Addresses refused at accept time
    pub ip_blacklist: Vec<IpNet>,

    /// Callback observer
    pub callback: CallbackConfiguration,
}

/// Turns ":1935" into "0.0.0.0:1935"
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Parses an IP or CIDR range. Single IPs become host ranges.
pub fn parse_ip_range(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }

    s.parse::<std::net::IpAddr>().ok().map(IpNet::from)
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        ServerConfiguration {
            rtmp_addr: "0.0.0.0:1935".to_string(),
            rtsp_addr: "0.0.0.0:5544".to_string(),
            httpflv_addr: "0.0.0.0:8080".to_string(),
            httpts_addr: "0.0.0.0:8080".to_string(),
            group: GroupConfiguration::default(),
            group_manager_mode: GroupManagerMode::Simple,
            auth: AuthConfiguration {
                key: "".to_string(),
                scope: AuthScope::None,
            },
            ip_blacklist: Vec::new(),
            callback: CallbackConfiguration::default(),
        }
    }
}

impl ServerConfiguration {
    /// Loads the configuration from environment variables
    ///
    /// Every invalid value is logged before returning an error.
    pub fn load_from_env(logger: &Logger) -> Result<ServerConfiguration, ()> {
        let rtmp_addr = normalize_listen_addr(&get_env_string("RTMP_ADDR", ":1935"));
        let rtsp_addr = normalize_listen_addr(&get_env_string("RTSP_ADDR", ":5544"));
        let httpflv_addr = normalize_listen_addr(&get_env_string("HTTPFLV_ADDR", ":8080"));
        let httpts_addr = normalize_listen_addr(&get_env_string("HTTPTS_ADDR", ":8080"));

        if rtmp_addr.is_empty()
            && rtsp_addr.is_empty()
            && httpflv_addr.is_empty()
            && httpts_addr.is_empty()
        {
            log_error!(logger, "Every listener is disabled");
            return Err(());
        }

        let chunk_size = get_env_u32("RTMP_CHUNK_SIZE", 4096);

        if chunk_size < 128 || chunk_size > RTMP_MAX_CHUNK_SIZE {
            log_error!(logger, format!("RTMP_CHUNK_SIZE has an invalid value: {}", chunk_size));
            return Err(());
        }

        let max_message_size = get_env_u32("RTMP_MAX_MESSAGE_SIZE", RTMP_DEFAULT_MAX_MESSAGE_SIZE);

        if max_message_size == 0 {
            log_error!(logger, "RTMP_MAX_MESSAGE_SIZE must be greater than 0");
            return Err(());
        }

        let write_chan_size = get_env_u32("SUB_WRITE_CHAN_SIZE", 1024);

        if write_chan_size == 0 {
            log_error!(logger, "SUB_WRITE_CHAN_SIZE must be greater than 0");
            return Err(());
        }

        let backpressure_policy_str = get_env_string("SUB_BACKPRESSURE_POLICY", "drop");

        let backpressure_policy = match BackpressurePolicy::parse(&backpressure_policy_str) {
            Some(p) => p,
            None => {
                log_error!(
                    logger,
                    format!(
                        "SUB_BACKPRESSURE_POLICY has an invalid value: {}",
                        backpressure_policy_str
                    )
                );
                return Err(());
            }
        };

        let idle_timeout_sec = get_env_u32("GROUP_IDLE_TIMEOUT_SEC", 10);

        let relay_pull_enable = get_env_bool("RELAY_PULL_ENABLE", false);
        let relay_pull_url = get_env_string("RELAY_PULL_URL", "");

        if relay_pull_enable && url::Url::parse(&relay_pull_url).is_err() {
            log_error!(logger, format!("RELAY_PULL_URL is not a valid URL: {}", relay_pull_url));
            return Err(());
        }

        let relay_push_enable = get_env_bool("RELAY_PUSH_ENABLE", false);
        let relay_push_targets = get_env_list("RELAY_PUSH_TARGETS");

        if relay_push_enable {
            if relay_push_targets.is_empty() {
                log_warning!(logger, "RELAY_PUSH_ENABLE is set but RELAY_PUSH_TARGETS is empty");
            }

            for target in relay_push_targets.iter() {
                if url::Url::parse(target).is_err() {
                    log_error!(
                        logger,
                        format!("RELAY_PUSH_TARGETS has an invalid URL: {}", target)
                    );
                    return Err(());
                }
            }
        }

        let group = GroupConfiguration {
            gop_cache_num: get_env_u32("GOP_CACHE_NUM", 1) as usize,
            chunk_size,
            max_message_size,
            write_chan_size: write_chan_size as usize,
            write_timeout_ms: get_env_u32("SUB_WRITE_TIMEOUT_MS", 10_000) as u64,
            read_timeout_ms: get_env_u32("PUB_READ_TIMEOUT_MS", 10_000) as u64,
            backpressure_policy,
            idle_timeout_ms: idle_timeout_sec as i64 * 1000,
            relay_pull_enable,
            relay_pull_url,
            relay_pull_stop_grace_ms: get_env_u32("RELAY_PULL_STOP_GRACE_SEC", 5) as i64 * 1000,
            relay_push_enable,
            relay_push_targets,
            dummy_audio_enable: get_env_bool("DUMMY_AUDIO_ENABLE", false),
            dummy_audio_wait_audio_ms: get_env_u32("DUMMY_AUDIO_WAIT_AUDIO_MS", 1000),
        };

        let group_manager_mode_str = get_env_string("GROUP_MANAGER_MODE", "simple").to_lowercase();

        let group_manager_mode = match group_manager_mode_str.as_str() {
            "simple" => GroupManagerMode::Simple,
            "complex" => GroupManagerMode::Complex,
            other => {
                log_error!(logger, format!("GROUP_MANAGER_MODE has an invalid value: {}", other));
                return Err(());
            }
        };

        let auth_scope_str = get_env_string("AUTH_SCOPE", "none");

        let auth_scope = match AuthScope::parse(&auth_scope_str) {
            Some(s) => s,
            None => {
                log_error!(logger, format!("AUTH_SCOPE has an invalid value: {}", auth_scope_str));
                return Err(());
            }
        };

        let auth_key = get_env_string("AUTH_KEY", "");

        if auth_scope != AuthScope::None && auth_key.is_empty() {
            log_error!(logger, "AUTH_SCOPE is set but AUTH_KEY is empty");
            return Err(());
        }

        let mut ip_blacklist = Vec::new();

        for item in get_env_list("IP_BLACKLIST") {
            match parse_ip_range(&item) {
                Some(net) => ip_blacklist.push(net),
                None => {
                    log_error!(logger, format!("IP_BLACKLIST has an invalid item: {}", item));
                    return Err(());
                }
            }
        }

        let callback = CallbackConfiguration::load_from_env(logger)?;

        Ok(ServerConfiguration {
            rtmp_addr,
            rtsp_addr,
            httpflv_addr,
            httpts_addr,
            group,
            group_manager_mode,
            auth: AuthConfiguration {
                key: auth_key,
                scope: auth_scope,
            },
            ip_blacklist,
            callback,
        })
    }

    /// True if FLV and TS are served by the same listener
    pub fn shares_http_listener(&self) -> bool {
        !self.httpflv_addr.is_empty() && self.httpflv_addr == self.httpts_addr
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":1935"), "0.0.0.0:1935");
        assert_eq!(normalize_listen_addr("127.0.0.1:8080"), "127.0.0.1:8080");
        assert_eq!(normalize_listen_addr(""), "");
    }

    #[test]
    fn test_auth_scope_parse() {
        assert_eq!(AuthScope::parse("none"), Some(AuthScope::None));
        assert_eq!(AuthScope::parse("RTMP-PUB"), Some(AuthScope::RtmpPub));
        assert_eq!(AuthScope::parse("any-sub"), Some(AuthScope::AnySub));
        assert_eq!(AuthScope::parse("everything"), None);
    }

    #[test]
    fn test_parse_ip_range() {
        let single = parse_ip_range("10.0.0.1").unwrap();
        assert!(single.contains(&"10.0.0.1".parse::<std::net::IpAddr>().unwrap()));
        assert!(!single.contains(&"10.0.0.2".parse::<std::net::IpAddr>().unwrap()));

        let range = parse_ip_range("192.168.0.0/16").unwrap();
        assert!(range.contains(&"192.168.4.20".parse::<std::net::IpAddr>().unwrap()));

        assert!(parse_ip_range("not-an-ip").is_none());
    }
}
