// Observer hooks

use async_trait::async_trait;

use crate::base::{PubSubInfo, RelayPullInfo, StatGroup, StreamResult};

/// Hooks called by the streaming core.
///
/// Every method has a no-op default. Hooks are never called
/// while a group lock is held.
#[async_trait]
pub trait Observer: Send + Sync {
    /// A publisher was admitted
    async fn on_pub_start(&self, _info: &PubSubInfo) {}

    /// A publisher left
    async fn on_pub_stop(&self, _info: &PubSubInfo) {}

    /// A subscriber asks to be admitted. An error refuses it.
    async fn on_sub_start(&self, _info: &PubSubInfo) -> StreamResult<()> {
        Ok(())
    }

    /// A subscriber left
    async fn on_sub_stop(&self, _info: &PubSubInfo) {}

    async fn on_relay_pull_start(&self, _info: &RelayPullInfo) {}

    async fn on_relay_pull_stop(&self, _info: &RelayPullInfo) {}

    /// A TS segment was written. Only fired by HLS segmenters.
    async fn on_hls_make_ts(&self, _app_name: &str, _stream_name: &str, _path: &str) {}

    /// Periodic statistics of every group
    async fn on_update(&self, _groups: &[StatGroup]) {}
}

/// Observer that ignores every event
pub struct NoopObserver;

impl Observer for NoopObserver {}
