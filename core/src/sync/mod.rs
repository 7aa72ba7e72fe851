//! Single-peer unicast sync over HTTP

pub mod client;
pub mod heartbeat;
pub mod server;
pub mod tracker;

/// Socket address of the tracked peer's push listener
pub type PeerAddress = std::net::SocketAddr;

pub use client::{PeerClient, PeerProbe, PingOutcome};
pub use heartbeat::HeartbeatSettings;
pub use server::{PushServer, PushServerHandle};
pub use tracker::PeerTracker;
