// Signed event tokens

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::{CallbackConfiguration, CallbackEvent};

/// Lifetime of an event token
const EVENT_TOKEN_TTL_SECONDS: i64 = 120;

/// Claims carried by the `rtmp-event` header
#[derive(Debug, Serialize, Deserialize)]
pub struct EventClaims {
    pub iat: i64,
    pub exp: i64,
    pub sub: String,

    /// Event name (pub_start, sub_stop, update...)
    pub event: String,

    /// `app/stream`, absent for updates
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote_addr: Option<String>,
}

impl EventClaims {
    /// Claims for an event, issued at `now` (unix seconds)
    pub fn new(config: &CallbackConfiguration, event: &CallbackEvent, now: i64) -> EventClaims {
        EventClaims {
            iat: now,
            exp: now + EVENT_TOKEN_TTL_SECONDS,
            sub: config.get_jwt_subject().to_string(),
            event: event.get_event().to_string(),
            stream: event.get_stream(),
            session_id: event.get_session_id(),
            remote_addr: event.get_remote_addr(),
        }
    }

    /// Signs the claims with HS256
    pub fn sign(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        encode(
            &Header::new(Algorithm::HS256),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }
}

/// Signed token of an event, issued now
pub fn make_event_token(
    config: &CallbackConfiguration,
    event: &CallbackEvent,
) -> Result<String, jsonwebtoken::errors::Error> {
    EventClaims::new(config, event, Utc::now().timestamp()).sign(&config.jwt_secret)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::PubSubInfo;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn test_config(subject: &str) -> CallbackConfiguration {
        CallbackConfiguration {
            callback_url: "http://localhost/cb".to_string(),
            jwt_secret: "secret".to_string(),
            jwt_custom_subject: subject.to_string(),
            update_interval_seconds: 10,
        }
    }

    #[test]
    fn test_event_token() {
        let info = PubSubInfo {
            session_id: 3,
            protocol: "RTMPPUB".to_string(),
            app_name: "live".to_string(),
            stream_name: "test".to_string(),
            raw_query: "".to_string(),
            remote_addr: "10.0.0.1:4000".to_string(),
        };

        let token = make_event_token(&test_config(""), &CallbackEvent::PubStart(&info)).unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);

        let key = DecodingKey::from_secret(b"secret");
        let claims = decode::<EventClaims>(&token, &key, &validation).unwrap().claims;

        assert_eq!(claims.sub, "stream_event");
        assert_eq!(claims.event, "pub_start");
        assert_eq!(claims.stream.as_deref(), Some("live/test"));
        assert_eq!(claims.session_id, Some(3));
        assert_eq!(claims.exp - claims.iat, EVENT_TOKEN_TTL_SECONDS);
    }

    #[test]
    fn test_update_claims() {
        let claims = EventClaims::new(&test_config("custom"), &CallbackEvent::Update, 1000);

        assert_eq!(claims.sub, "custom");
        assert_eq!(claims.event, "update");
        assert_eq!(claims.exp, 1120);
        assert!(claims.stream.is_none());
        assert!(claims.remote_addr.is_none());
    }
}
