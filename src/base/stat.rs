// Statistic records exposed to observers and to the admin entry points

use serde::Serialize;

/// Session statistics
#[derive(Clone, Debug, Serialize)]
pub struct StatSession {
    pub session_id: u64,
    pub protocol: String,
    pub remote_addr: String,
    pub start_time_ms: i64,
    pub read_bytes: u64,
    pub wrote_bytes: u64,
}

/// Group statistics
#[derive(Clone, Debug, Serialize)]
pub struct StatGroup {
    pub app_name: String,
    pub stream_name: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_width: u32,
    pub video_height: u32,
    pub input: Option<StatSession>,
    pub subscribers: Vec<StatSession>,
    pub relay_pushes: Vec<StatSession>,
}

/// Information about a publisher or subscriber, passed to observer hooks
#[derive(Clone, Debug, Serialize)]
pub struct PubSubInfo {
    pub session_id: u64,
    pub protocol: String,
    pub app_name: String,
    pub stream_name: String,
    pub raw_query: String,
    pub remote_addr: String,
}

/// Information about a relay pull, passed to observer hooks
#[derive(Clone, Debug, Serialize)]
pub struct RelayPullInfo {
    pub session_id: u64,
    pub url: String,
    pub app_name: String,
    pub stream_name: String,
}
