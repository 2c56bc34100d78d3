//! Protocol module - Defines the wire protocol for aircraft synchronization
//!
//! Every datagram starts with the same 8 byte header followed by an array
//! of fixed-size elements of one kind:
//! - 1 byte message type (low nibble) and version (high nibble)
//! - 1 byte reserved
//! - 2 bytes sender id (little-endian)
//! - 4 bytes reserved
//! - `n` elements, `n = (len - 8) / element size`
//!
//! All multi-byte values are little-endian.

mod codec;
mod hash;
mod message;
mod values;

pub use codec::*;
pub use hash::*;
pub use message::*;
pub use values::*;

/// Default UDP port of the multicast group
pub const DEFAULT_PORT: u16 = 49788;

/// Default multicast group all instances join
pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.1.1";

/// Default multicast time-to-live
pub const DEFAULT_TTL: u32 = 8;

/// Default maximum datagram size
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Largest payload of a UDP datagram over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
