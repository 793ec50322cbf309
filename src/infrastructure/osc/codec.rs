//! OSC Message Encoding
//!
//! Only the subset needed for avatar parameters: single messages (no
//! bundles) carrying one int32 or one boolean argument. Wire encoding is
//! done by `rosc`.
//!
//! ```text
//! address   : ASCII, NUL terminated, zero padded to a multiple of 4
//! type tag  : ",i" | ",T" | ",F", padded the same way
//! payload   : int32 big-endian for ",i"; nothing for booleans
//! ```

use rosc::{encoder, OscPacket, OscType};

/// A single OSC argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscArg {
    Int(i32),
    Bool(bool),
}

impl From<OscArg> for OscType {
    fn from(arg: OscArg) -> Self {
        match arg {
            OscArg::Int(value) => OscType::Int(value),
            OscArg::Bool(value) => OscType::Bool(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OscMessage<'a> {
    pub address: &'a str,
    pub arg: OscArg,
}

impl<'a> OscMessage<'a> {
    pub fn int(address: &'a str, value: i32) -> Self {
        Self {
            address,
            arg: OscArg::Int(value),
        }
    }

    pub fn bool(address: &'a str, value: bool) -> Self {
        Self {
            address,
            arg: OscArg::Bool(value),
        }
    }

    /// Wire bytes of this message, ready to be sent as one datagram
    pub fn encode(&self) -> Result<Vec<u8>, rosc::OscError> {
        let packet = OscPacket::Message(rosc::OscMessage {
            addr: self.address.to_string(),
            args: vec![self.arg.into()],
        });
        encoder::encode(&packet)
    }
}
