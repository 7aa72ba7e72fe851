//! Multicast socket construction

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::GroupConfig;
use crate::{Error, Result};

fn new_socket(config: &GroupConfig) -> Result<Socket> {
    let domain = Domain::for_address(config.group_addr());
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn unspecified(group: &IpAddr, port: u16) -> SocketAddr {
    match group {
        IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
        IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
    }
}

fn join(socket: &Socket, config: &GroupConfig) -> Result<()> {
    match config.group {
        IpAddr::V4(ref v4) => {
            socket.join_multicast_v4(v4, &config.interface_v4)?;
            socket.set_multicast_loop_v4(true)?;
        }
        IpAddr::V6(ref v6) => {
            socket.join_multicast_v6(v6, config.interface_v6)?;
            socket.set_multicast_loop_v6(true)?;
        }
    }
    Ok(())
}

fn into_tokio(socket: Socket) -> Result<UdpSocket> {
    UdpSocket::from_std(socket.into())
        .map_err(|e| Error::Network(format!("failed to register socket: {}", e)))
}

/// Socket used for outgoing broadcasts.
///
/// Bound to an ephemeral port, joined to the group with loopback enabled so
/// a device also receives what it sends.
pub(crate) fn sender_socket(config: &GroupConfig) -> Result<UdpSocket> {
    let socket = new_socket(config)?;

    match config.group {
        IpAddr::V4(_) => {
            socket.set_multicast_if_v4(&config.interface_v4)?;
            socket.set_multicast_ttl_v4(1)?;
        }
        IpAddr::V6(_) => {
            socket.set_only_v6(true)?;
            socket.set_multicast_if_v6(config.interface_v6)?;
        }
    }

    socket.bind(&unspecified(&config.group, 0).into())?;
    join(&socket, config)?;

    into_tokio(socket)
}

/// Socket the receive loop reads from, bound to the group port.
pub(crate) fn receiver_socket(config: &GroupConfig) -> Result<UdpSocket> {
    let socket = new_socket(config)?;

    if config.group.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    socket.bind(&unspecified(&config.group, config.port).into())?;
    join(&socket, config)?;

    tracing::info!("joined multicast group {}", config.group_addr());
    into_tokio(socket)
}

/// What the receive loop reads datagrams from
pub(crate) trait DatagramSource: Send + 'static {
    fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Leave the group on the same interface it was joined with
    fn leave(&self, config: &GroupConfig) -> Result<()>;
}

impl DatagramSource for UdpSocket {
    fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        UdpSocket::recv_from(self, buf)
    }

    fn leave(&self, config: &GroupConfig) -> Result<()> {
        match config.group {
            IpAddr::V4(v4) => self.leave_multicast_v4(v4, config.interface_v4)?,
            IpAddr::V6(ref v6) => self.leave_multicast_v6(v6, config.interface_v6)?,
        }
        tracing::info!("left multicast group {}", config.group_addr());
        Ok(())
    }
}
