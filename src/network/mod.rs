//! Network module - Moves datagrams between instances on a multicast group
//!
//! Provides:
//! - A transport abstraction with a UDP multicast and an in-memory implementation
//! - Dispatch of received messages to a pluggable handler
//! - Sender and receiver driver loops owning the stateful protocol parts

mod handler;
mod memory;
mod multicast;
mod receiver;
mod sender;

pub use handler::*;
pub use memory::*;
pub use multicast::*;
pub use receiver::*;
pub use sender::*;

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

use crate::config::Config;
use crate::protocol::{DEFAULT_BUFFER_SIZE, DEFAULT_PORT, DEFAULT_TTL};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("{0} is not a multicast group")]
    InvalidGroup(Ipv4Addr),

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A driver gives up after this many transport errors in a row
pub const MAX_TRANSPORT_ERRORS: u32 = 5;

/// Datagram transport shared by the sender and receiver drivers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the local address.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Send one datagram, fire and forget.
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Wait for the next datagram.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Take a datagram that is already queued, `None` if there is none.
    fn try_recv_from(&self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>>;
}

/// Configuration for the multicast socket
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Group to join and send to
    pub group: Ipv4Addr,
    /// UDP port
    pub port: u16,
    /// Multicast time-to-live
    pub ttl: u32,
    /// Maximum datagram size
    pub buffer_size: usize,
    /// Interface to join on and send from
    pub interface: Option<Ipv4Addr>,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 1, 1),
            port: DEFAULT_PORT,
            ttl: DEFAULT_TTL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            interface: None,
        }
    }
}

impl MulticastConfig {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self {
            group,
            port,
            ..Default::default()
        }
    }

    /// Destination address of every datagram
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

impl From<&Config> for MulticastConfig {
    fn from(config: &Config) -> Self {
        Self {
            group: config.network.multicast_group,
            port: config.network.port,
            ttl: config.network.ttl,
            buffer_size: config.network.buffer_size,
            interface: config.network.bind_address,
        }
    }
}
