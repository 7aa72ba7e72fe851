//! Wire vocabulary for the multicast and unicast channels

pub mod constants;
mod messages;

pub use messages::{parse_ping, ContentHash, ErrorBody, PingRequest, StatusBody};
