// Stream sign check

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    base::{StreamError, StreamResult},
    utils::{parse_query_string, string_compare_constant_time},
};

use super::{AuthConfiguration, AuthScope};

/// Kind of session asking for admission
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthTarget {
    RtmpPub,
    OtherPub,
    Sub,
}

/// Computes the sign of a stream: hex(HMAC-SHA256(key, stream_name))
pub fn make_stream_sign(key: &str, stream_name: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(key.as_bytes()) {
        Ok(m) => m,
        Err(_) => return "".to_string(),
    };

    mac.update(stream_name.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}

/// Checks the sign carried in the query string
///
/// # Arguments
///
/// * `auth` - Authentication configuration
/// * `target` - Kind of session
/// * `stream_name` - Stream name, without query
/// * `raw_query` - Query string of the request
///
/// # Return value
///
/// Returns `Refused` if the session is in scope and the sign is missing or wrong
pub fn check_stream_sign(
    auth: &AuthConfiguration,
    target: AuthTarget,
    stream_name: &str,
    raw_query: &str,
) -> StreamResult<()> {
    let in_scope = match auth.scope {
        AuthScope::None => false,
        AuthScope::RtmpPub => target == AuthTarget::RtmpPub,
        AuthScope::AnySub => target == AuthTarget::RtmpPub || target == AuthTarget::Sub,
    };

    if !in_scope {
        return Ok(());
    }

    let query = parse_query_string(raw_query);

    let sign = match query.get("sign") {
        Some(s) => s.to_lowercase(),
        None => return Err(StreamError::Refused("missing sign".to_string())),
    };

    let expected = make_stream_sign(&auth.key, stream_name);

    if string_compare_constant_time(&sign, &expected) {
        Ok(())
    } else {
        Err(StreamError::Refused("invalid sign".to_string()))
    }
}

// Tests
