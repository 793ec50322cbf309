//! OSC Output
//!
//! - [`codec`] - OSC 1.0 message encoding (int32 and boolean arguments)
//! - [`sender`] - UDP transmitter mirroring heart rate and heartbeat state

pub mod codec;
pub mod sender;

pub use sender::{OscAddresses, OscEndpoint, OscError, OscSender};
