//! Outbound requests to the tracked peer

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use crate::discovery;
use crate::protocol::constants::{ADDRESS_HEADER, PING_HEADER, PING_VALUE, PONG_BODY};
use crate::sync::PeerAddress;
use crate::{Error, Result};

/// Upper bound on a clipboard push round trip
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one heartbeat ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    /// `200 PONG`
    Pong,
    /// The peer answered, but not with `200 PONG`
    Rejected { status: u16, body: String },
    /// Connection refused or host unreachable
    Unreachable(String),
    /// No answer within the ping timeout
    TimedOut,
    /// Any other transport error
    Failed(String),
}

impl PingOutcome {
    /// Whether this outcome ends the peer relationship
    pub fn is_peer_lost(&self) -> bool {
        matches!(
            self,
            PingOutcome::Rejected { .. } | PingOutcome::Unreachable(_) | PingOutcome::TimedOut
        )
    }
}

/// Liveness probe used by the heartbeat
pub trait PeerProbe: Send + Sync + 'static {
    fn ping(&self, peer: PeerAddress) -> Pin<Box<dyn Future<Output = PingOutcome> + Send + '_>>;
}

/// HTTP client for pings and clipboard pushes
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    ping_timeout: Duration,
    sync_port: u16,
    advertised: Option<SocketAddr>,
}

impl PeerClient {
    /// `sync_port` is the local listener port announced in pings
    pub fn new(ping_timeout: Duration, sync_port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            http,
            ping_timeout,
            sync_port,
            advertised: None,
        })
    }

    /// Announce `addr` in pings instead of the detected local address
    pub fn with_advertised_addr(mut self, addr: SocketAddr) -> Self {
        self.advertised = Some(addr);
        self
    }

    /// Address the peer should use to reach us
    pub fn advertised_addr(&self) -> Option<SocketAddr> {
        self.advertised.or_else(|| {
            discovery::local_ipv4().map(|ip| SocketAddr::new(IpAddr::V4(ip), self.sync_port))
        })
    }

    /// Send one heartbeat ping to `peer`
    pub async fn send_ping(&self, peer: PeerAddress) -> PingOutcome {
        let mut request = self
            .http
            .post(peer_url(peer))
            .timeout(self.ping_timeout)
            .header(PING_HEADER, PING_VALUE);
        if let Some(addr) = self.advertised_addr() {
            request = request.header(ADDRESS_HEADER, addr.to_string());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return classify_error(e),
        };

        let status = response.status();
        match response.text().await {
            Ok(body) if status == StatusCode::OK && body == PONG_BODY => PingOutcome::Pong,
            Ok(body) => PingOutcome::Rejected {
                status: status.as_u16(),
                body,
            },
            Err(e) => classify_error(e),
        }
    }

    /// Push clipboard text to `peer`
    pub async fn push(&self, peer: PeerAddress, text: &str) -> Result<()> {
        let response = self
            .http
            .post(peer_url(peer))
            .timeout(PUSH_TIMEOUT)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text.to_string())
            .send()
            .await
            .map_err(|e| Error::Network(format!("push to {} failed: {}", peer, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!(
                "push to {} rejected with {}: {}",
                peer, status, body
            )));
        }

        Ok(())
    }
}

impl PeerProbe for PeerClient {
    fn ping(&self, peer: PeerAddress) -> Pin<Box<dyn Future<Output = PingOutcome> + Send + '_>> {
        Box::pin(self.send_ping(peer))
    }
}

fn peer_url(peer: PeerAddress) -> String {
    format!("http://{}/", peer)
}

fn classify_error(e: reqwest::Error) -> PingOutcome {
    if e.is_timeout() {
        PingOutcome::TimedOut
    } else if e.is_connect() {
        PingOutcome::Unreachable(e.to_string())
    } else {
        PingOutcome::Failed(e.to_string())
    }
}
