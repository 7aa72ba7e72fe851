//! ClipSync Core - LAN clipboard sync engine
//!
//! Two independent transports keep clipboards in sync:
//! - [`MulticastLink`]: same-subnet broadcast over a fixed UDP multicast group
//! - [`PeerSyncService`]: mDNS discovery of one peer, kept alive by an HTTP
//!   heartbeat, with clipboard pushes in both directions

pub mod clipboard;
pub mod discovery;
pub mod multicast;
pub mod protocol;
pub mod retry;
pub mod service;
pub mod sync;

mod error;

use std::net::IpAddr;
use std::time::Duration;

use protocol::constants::{
    CLIPBOARD_POLL_INTERVAL_MS, DEFAULT_SERVICE_NAME, HEARTBEAT_INTERVAL_MS, MULTICAST_PORT,
    PING_TIMEOUT_MS, SERVICE_TYPE, SYNC_PORT,
};

pub use error::{Error, Result};

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Address family of the multicast group
    pub ip_version: IpVersion,
    /// UDP port of the multicast group
    pub multicast_port: u16,
    /// Port of the push listener (0 picks a free port)
    pub sync_port: u16,
    /// Advertised mDNS instance name
    pub service_name: String,
    /// mDNS service type to advertise and browse
    pub service_type: String,
    /// Advertise and browse over mDNS
    pub discovery_enabled: bool,
    /// Address announced in pings; the first non-loopback IPv4 address
    /// when unset
    pub advertised_ip: Option<IpAddr>,
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub clipboard_poll_interval: Duration,
    /// Retry policy for mDNS registration and browsing
    pub discovery_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip_version: IpVersion::default(),
            multicast_port: MULTICAST_PORT,
            sync_port: SYNC_PORT,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            discovery_enabled: true,
            advertised_ip: None,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            ping_timeout: Duration::from_millis(PING_TIMEOUT_MS),
            clipboard_poll_interval: Duration::from_millis(CLIPBOARD_POLL_INTERVAL_MS),
            discovery_retry: RetryPolicy::default(),
        }
    }
}

// Re-export key types for convenience
pub use clipboard::{ClipboardStore, MemoryClipboard, SystemClipboard, TrackedClipboard};
pub use discovery::{DiscoveryEvent, DiscoveryService, ServiceIdentity};
pub use multicast::{GroupConfig, IpVersion, MulticastLink, MulticastLock};
pub use retry::RetryPolicy;
pub use service::{EventSink, PeerSyncService, SyncEvent, SyncSource};
pub use sync::{PeerAddress, PeerTracker, PingOutcome};
