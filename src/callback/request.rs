// Callback requests

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{
    base::{PubSubInfo, RelayPullInfo, StatGroup, StreamError, StreamResult},
    log::Logger,
    log_debug, log_error,
};

use super::{make_event_token, CallbackConfiguration, CallbackEvent, Observer};

/// Observer posting every event to the callback URL.
///
/// The event is carried by a signed JWT in the `rtmp-event` header.
/// Statistics updates also carry the group list as a JSON body.
pub struct CallbackObserver {
    logger: Arc<Logger>,
    config: CallbackConfiguration,
    client: reqwest::Client,
}

impl CallbackObserver {
    pub fn new(logger: Arc<Logger>, config: CallbackConfiguration) -> CallbackObserver {
        CallbackObserver {
            logger,
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Posts an event
    ///
    /// # Arguments
    ///
    /// * `event` - The event
    /// * `body` - Optional JSON body
    ///
    /// # Return value
    ///
    /// Returns true if the callback answered 200 (or is disabled)
    async fn post_event(&self, event: &CallbackEvent<'_>, body: Option<String>) -> bool {
        let callback_url = &self.config.callback_url;

        if callback_url.is_empty() {
            return true;
        }

        let logger = &self.logger;

        log_debug!(
            logger,
            format!(
                "POST {} | Event: {} | Stream: {}",
                callback_url,
                event.get_event(),
                event.get_stream().unwrap_or_default()
            )
        );

        let token = match make_event_token(&self.config, event) {
            Ok(t) => t,
            Err(e) => {
                log_error!(logger, format!("Could not sign event token: {}", e));
                return false;
            }
        };

        let mut request_builder = self.client.post(callback_url).header("rtmp-event", token);

        if let Some(b) = body {
            request_builder = request_builder
                .header("Content-Type", "application/json")
                .body(b);
        }

        match request_builder.send().await {
            Ok(r) if r.status() == StatusCode::OK => true,
            Ok(r) => {
                log_debug!(logger, format!("Callback answered {}", r.status().as_u16()));
                false
            }
            Err(e) => {
                log_debug!(logger, format!("Callback failed: {}", e));
                false
            }
        }
    }
}

#[async_trait]
impl Observer for CallbackObserver {
    async fn on_pub_start(&self, info: &PubSubInfo) {
        self.post_event(&CallbackEvent::PubStart(info), None).await;
    }

    async fn on_pub_stop(&self, info: &PubSubInfo) {
        self.post_event(&CallbackEvent::PubStop(info), None).await;
    }

    async fn on_sub_start(&self, info: &PubSubInfo) -> StreamResult<()> {
        if self.post_event(&CallbackEvent::SubStart(info), None).await {
            Ok(())
        } else {
            Err(StreamError::Refused("rejected by callback".to_string()))
        }
    }

    async fn on_sub_stop(&self, info: &PubSubInfo) {
        self.post_event(&CallbackEvent::SubStop(info), None).await;
    }

    async fn on_relay_pull_start(&self, info: &RelayPullInfo) {
        self.post_event(&CallbackEvent::RelayPullStart(info), None)
            .await;
    }

    async fn on_relay_pull_stop(&self, info: &RelayPullInfo) {
        self.post_event(&CallbackEvent::RelayPullStop(info), None)
            .await;
    }

    async fn on_update(&self, groups: &[StatGroup]) {
        let body = match serde_json::to_string(groups) {
            Ok(b) => b,
            Err(_) => return,
        };

        self.post_event(&CallbackEvent::Update, Some(body)).await;
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Answers every request with a fixed status and reports the event header
    async fn start_responder(
        status_line: &'static str,
    ) -> (String, tokio::sync::mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sender, receiver) = tokio::sync::mpsc::channel(8);

        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let n = conn.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();

                let has_token = request.contains("\r\nrtmp-event: ");
                let _ = sender.send(format!("{}", has_token)).await;

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = conn.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{}/callback", addr), receiver)
    }

    fn make_observer(url: String) -> CallbackObserver {
        CallbackObserver::new(
            Arc::new(Logger::new_disabled()),
            CallbackConfiguration {
                callback_url: url,
                jwt_secret: "secret".to_string(),
                jwt_custom_subject: "".to_string(),
                update_interval_seconds: 10,
            },
        )
    }

    fn sub_info() -> PubSubInfo {
        PubSubInfo {
            session_id: 7,
            protocol: "FLVSUB".to_string(),
            app_name: "live".to_string(),
            stream_name: "cb".to_string(),
            raw_query: "".to_string(),
            remote_addr: "127.0.0.1:40000".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sub_start_accepted() {
        let (url, mut requests) = start_responder("200 OK").await;
        let observer = make_observer(url);

        observer.on_sub_start(&sub_info()).await.unwrap();

        assert_eq!(requests.recv().await.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_sub_start_rejected() {
        let (url, _requests) = start_responder("403 Forbidden").await;
        let observer = make_observer(url);

        assert!(matches!(
            observer.on_sub_start(&sub_info()).await,
            Err(StreamError::Refused(_))
        ));
    }
}
