//! AcSync - Aircraft synchronization over UDP multicast
//!
//! One instance sends its simulated aircraft, any number of instances on
//! the same multicast group receive them. Position changes travel as
//! compact 16-bit deltas with periodic full resyncs.

pub mod config;
pub mod delta;
pub mod fleet;
pub mod model;
pub mod network;
pub mod protocol;
pub mod session;
