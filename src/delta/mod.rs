//! Delta module - Incremental position encoding
//!
//! The sender keeps, per aircraft, the absolute position the receivers
//! know about and transmits only the quantized difference. Whenever the
//! difference does not fit a position update a full detail record resets
//! the shared baseline.

mod decoder;
mod encoder;

pub use decoder::*;
pub use encoder::*;
