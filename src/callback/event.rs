// Callback events

use crate::base::{PubSubInfo, RelayPullInfo};

/// Event posted to the callback URL
pub enum CallbackEvent<'a> {
    PubStart(&'a PubSubInfo),
    PubStop(&'a PubSubInfo),
    SubStart(&'a PubSubInfo),
    SubStop(&'a PubSubInfo),
    RelayPullStart(&'a RelayPullInfo),
    RelayPullStop(&'a RelayPullInfo),
    Update,
}

impl CallbackEvent<'_> {
    /// Gets event name
    pub fn get_event(&self) -> &'static str {
        match self {
            CallbackEvent::PubStart(_) => "pub_start",
            CallbackEvent::PubStop(_) => "pub_stop",
            CallbackEvent::SubStart(_) => "sub_start",
            CallbackEvent::SubStop(_) => "sub_stop",
            CallbackEvent::RelayPullStart(_) => "relay_pull_start",
            CallbackEvent::RelayPullStop(_) => "relay_pull_stop",
            CallbackEvent::Update => "update",
        }
    }

    /// Gets the stream the event is about, as `app/stream`
    pub fn get_stream(&self) -> Option<String> {
        match self {
            CallbackEvent::PubStart(i)
            | CallbackEvent::PubStop(i)
            | CallbackEvent::SubStart(i)
            | CallbackEvent::SubStop(i) => Some(format!("{}/{}", i.app_name, i.stream_name)),
            CallbackEvent::RelayPullStart(i) | CallbackEvent::RelayPullStop(i) => {
                Some(format!("{}/{}", i.app_name, i.stream_name))
            }
            CallbackEvent::Update => None,
        }
    }

    /// Gets the session id
    pub fn get_session_id(&self) -> Option<u64> {
        match self {
            CallbackEvent::PubStart(i)
            | CallbackEvent::PubStop(i)
            | CallbackEvent::SubStart(i)
            | CallbackEvent::SubStop(i) => Some(i.session_id),
            CallbackEvent::RelayPullStart(i) | CallbackEvent::RelayPullStop(i) => {
                Some(i.session_id)
            }
            CallbackEvent::Update => None,
        }
    }

    /// Gets client IP
    pub fn get_remote_addr(&self) -> Option<String> {
        match self {
            CallbackEvent::PubStart(i)
            | CallbackEvent::PubStop(i)
            | CallbackEvent::SubStart(i)
            | CallbackEvent::SubStop(i) => Some(i.remote_addr.clone()),
            _ => None,
        }
    }
}
