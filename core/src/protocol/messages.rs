//! Unicast request/response bodies and clipboard content hashing

use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::constants::{ADDRESS_HEADER, PING_HEADER, PING_VALUE, STATUS_OK};

/// `{"status": ...}` body returned for clipboard pushes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

impl StatusBody {
    pub fn ok() -> Self {
        Self { status: STATUS_OK.to_string() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { status: reason.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// `{"error": ...}` body returned for rejected requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// A heartbeat ping as seen by the listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    /// Where the pinging side says it can be reached. `None` when the
    /// header is missing or not a `host:port` socket address.
    pub reply_to: Option<SocketAddr>,
}

/// Recognize a heartbeat ping from its headers.
///
/// Returns `None` for anything that is not a ping, in which case the
/// request body is a clipboard push.
pub fn parse_ping(headers: &HeaderMap) -> Option<PingRequest> {
    let marker = headers.get(PING_HEADER)?.to_str().ok()?;
    if marker != PING_VALUE {
        return None;
    }

    let reply_to = headers
        .get(ADDRESS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<SocketAddr>().ok());

    Some(PingRequest { reply_to })
}

/// SHA256 hash of clipboard text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"text:");
        hasher.update(text.as_bytes());
        ContentHash(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn name(header: &str) -> HeaderName {
        HeaderName::from_bytes(header.as_bytes()).unwrap()
    }

    #[test]
    fn test_status_body_wire_format() {
        let body = serde_json::to_string(&StatusBody::ok()).unwrap();
        assert_eq!(body, r#"{"status":"OK"}"#);

        let failed = serde_json::to_string(&StatusBody::failed("boom")).unwrap();
        assert_eq!(failed, r#"{"status":"boom"}"#);
    }

    #[test]
    fn test_parse_ping_with_address() {
        let mut headers = HeaderMap::new();
        headers.insert(name(PING_HEADER), HeaderValue::from_static("PING"));
        headers.insert(name(ADDRESS_HEADER), HeaderValue::from_static("192.168.1.5:6942"));

        let ping = parse_ping(&headers).unwrap();
        assert_eq!(ping.reply_to, Some("192.168.1.5:6942".parse().unwrap()));
    }

    #[test]
    fn test_parse_ping_garbled_address() {
        let mut headers = HeaderMap::new();
        headers.insert(name(PING_HEADER), HeaderValue::from_static("PING"));
        headers.insert(name(ADDRESS_HEADER), HeaderValue::from_static("not-an-address"));

        let ping = parse_ping(&headers).unwrap();
        assert_eq!(ping.reply_to, None);
    }

    #[test]
    fn test_not_a_ping() {
        assert!(parse_ping(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(name(PING_HEADER), HeaderValue::from_static("PONG"));
        assert!(parse_ping(&headers).is_none());
    }

    #[test]
    fn test_content_hash_consistency() {
        assert_eq!(ContentHash::of("hello"), ContentHash::of("hello"));
        assert_ne!(ContentHash::of("hello"), ContentHash::of("world"));
    }
}
