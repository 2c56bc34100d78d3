//! UDP multicast transport

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::{MulticastConfig, Transport, TransportError, TransportResult};

/// Socket joined to the multicast group
pub struct MulticastTransport {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastTransport {
    /// Bind the group port and join the group.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &MulticastConfig) -> TransportResult<Self> {
        let socket = create_multicast_socket(config)?;
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        let socket = UdpSocket::from_std(socket.into()).map_err(|e| {
            TransportError::BindFailed {
                addr: bind_addr,
                reason: e.to_string(),
            }
        })?;

        info!(
            "Joined multicast group {} (ttl {})",
            config.group_addr(),
            config.ttl
        );

        Ok(Self {
            socket,
            group: config.group_addr(),
        })
    }

    pub fn group_addr(&self) -> SocketAddr {
        self.group
    }
}

/// Create the std socket with all multicast options applied
fn create_multicast_socket(config: &MulticastConfig) -> TransportResult<Socket> {
    if !config.group.is_multicast() {
        return Err(TransportError::InvalidGroup(config.group));
    }

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // Several instances on one host share the group port
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;

    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|e| TransportError::BindFailed {
            addr: bind_addr,
            reason: e.to_string(),
        })?;

    let interface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(&config.group, &interface)?;
    if let Some(interface) = config.interface {
        socket.set_multicast_if_v4(&interface)?;
    }
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    debug!("Multicast socket bound to {} on interface {}", bind_addr, interface);
    Ok(socket)
}

#[async_trait]
impl Transport for MulticastTransport {
    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        Ok(self.socket.send_to(data, addr).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unicast_group() {
        let config = MulticastConfig::new(Ipv4Addr::new(192, 168, 1, 1), 49788);
        assert!(matches!(
            create_multicast_socket(&config),
            Err(TransportError::InvalidGroup(_))
        ));
    }
}
