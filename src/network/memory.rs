//! In-memory transport
//!
//! Every endpoint attached to a [`MemoryHub`] receives the datagrams the
//! other endpoints send, the same way members of a multicast group do.
//! Used to run the drivers without touching real sockets.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{Transport, TransportError, TransportResult};

type Datagram = (Vec<u8>, SocketAddr);

/// Shared medium of a set of memory endpoints
#[derive(Clone, Default)]
pub struct MemoryHub {
    members: Arc<RwLock<Vec<(SocketAddr, mpsc::UnboundedSender<Datagram>)>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint with a distinct host address
    pub async fn endpoint(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut members = self.members.write().await;
        // 10.0.0.1 upwards, one host per endpoint
        let host = u32::from(Ipv4Addr::new(10, 0, 0, 0)) + members.len() as u32 + 1;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(host)), 49788);
        members.push((addr, tx));

        MemoryTransport {
            addr,
            hub: self.clone(),
            rx: Mutex::new(rx),
        }
    }

    async fn deliver(&self, from: SocketAddr, data: &[u8]) {
        let members = self.members.read().await;
        for (addr, tx) in members.iter() {
            if *addr != from {
                let _ = tx.send((data.to_vec(), from));
            }
        }
    }
}

/// One endpoint of a [`MemoryHub`]
pub struct MemoryTransport {
    addr: SocketAddr,
    hub: MemoryHub,
    rx: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl MemoryTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Copy a queued datagram into the caller's buffer, truncating like UDP
fn copy_out((data, from): Datagram, buf: &mut [u8]) -> (usize, SocketAddr) {
    let len = data.len().min(buf.len());
    buf[..len].copy_from_slice(&data[..len]);
    (len, from)
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    async fn send_to(&self, data: &[u8], _addr: SocketAddr) -> TransportResult<usize> {
        self.hub.deliver(self.addr, data).await;
        Ok(data.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        let datagram = rx.recv().await.ok_or(TransportError::Closed)?;
        Ok(copy_out(datagram, buf))
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(datagram) => Ok(Some(copy_out(datagram, buf))),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_to_other_members_only() {
        let hub = MemoryHub::new();
        let a = hub.endpoint().await;
        let b = hub.endpoint().await;
        let c = hub.endpoint().await;
        assert_ne!(a.addr(), b.addr());

        let group: SocketAddr = "239.255.1.1:49788".parse().unwrap();
        a.send_to(b"hello", group).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.addr());

        assert_eq!(c.try_recv_from(&mut buf).unwrap(), Some((5, a.addr())));
        assert_eq!(a.try_recv_from(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_many_endpoints_get_distinct_addresses() {
        let hub = MemoryHub::new();
        let first = hub.endpoint().await;
        let mut rest = Vec::new();
        for _ in 0..300 {
            rest.push(hub.endpoint().await);
        }
        let last = rest.pop().unwrap();
        assert_eq!(first.addr().ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(last.addr().ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 1, 45)));

        first.send_to(b"ping", first.addr()).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(last.try_recv_from(&mut buf).unwrap(), Some((4, first.addr())));
    }

    #[tokio::test]
    async fn test_truncates_to_buffer() {
        let hub = MemoryHub::new();
        let a = hub.endpoint().await;
        let b = hub.endpoint().await;

        a.send_to(&[7u8; 32], a.addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let (len, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 8);
    }
}
