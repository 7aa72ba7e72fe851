//! Centralized protocol constants
//!
//! All protocol-level constants are defined here to ensure consistency
//! across the codebase and make configuration easier.

use std::net::{Ipv4Addr, Ipv6Addr};

/// UDP port shared by every member of the multicast group
pub const MULTICAST_PORT: u16 = 7645;

/// IPv4 multicast group (link-local scope)
pub const MULTICAST_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 123);

/// IPv6 multicast group (link-local scope)
pub const MULTICAST_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x123);

/// Largest payload carried by a single multicast datagram
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Socket rebuild attempts after a non-timeout receive error
pub const RECEIVE_RETRY_ATTEMPTS: u32 = 3;

/// TCP port of the peer push listener
pub const SYNC_PORT: u16 = 6942;

/// mDNS service type for discovery
pub const SERVICE_TYPE: &str = "_clipsync._tcp.local.";

/// Default advertised instance name
pub const DEFAULT_SERVICE_NAME: &str = "android";

/// Delay between heartbeat pings
pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

/// Upper bound on a single ping round trip
pub const PING_TIMEOUT_MS: u64 = 1500;

/// Header marking a request as a heartbeat ping
pub const PING_HEADER: &str = "PING";

/// Value of [`PING_HEADER`] on a ping
pub const PING_VALUE: &str = "PING";

/// Header carrying the pinging side's reachable `host:port`
pub const ADDRESS_HEADER: &str = "IP";

/// Body returned for a ping
pub const PONG_BODY: &str = "PONG";

/// Status reported for a successful clipboard push
pub const STATUS_OK: &str = "OK";

/// Clipboard polling interval in milliseconds
pub const CLIPBOARD_POLL_INTERVAL_MS: u64 = 500;
