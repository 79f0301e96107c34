//! Packet grammars and the streaming packet codec.
//!
//! A [`Grammar`] describes how one device family delimits packets on the
//! wire. It never owns state: bytes accumulate in a [`PacketCodec`], which
//! asks the grammar after every byte whether the buffer is a complete
//! packet, needs more input, or has to be thrown away.
//!
//! Two families are provided:
//!
//! - [`EscapedGrammar`]: `START escaped(body ++ checksum) END`, with reserved
//!   bytes escaped inside and a 16-bit checksum over the unescaped body.
//! - [`TabledGrammar`]: the leading type byte selects a fixed total length,
//!   or names a length field, from a per-type table.

pub mod checksum;
pub mod codec;
pub mod escaped;
pub mod tabled;

use bytes::Bytes;
use std::fmt;

use crate::error::ProtocolError;

pub use checksum::Checksum;
pub use codec::{Decoded, PacketCodec};
pub use escaped::EscapedGrammar;
pub use tabled::{PacketLength, TabledGrammar};

/// How to recover after an invalid byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resync {
    /// Drop everything accumulated, including the offending byte.
    Discard,
    /// Drop what came before; the offending byte may start the next packet.
    Restart,
}

/// Outcome of checking an accumulated buffer after one more byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The last byte belongs to the packet. The packet is complete once the
    /// buffer holds `expected` bytes.
    Include { expected: usize },
    /// The last byte is not part of the packet.
    Exclude,
    /// The buffer cannot become a valid packet.
    Invalid(Resync),
}

/// Per-family framing rules.
pub trait Grammar: Send + Sync + fmt::Debug {
    /// Judge `packet`, which has just grown by one byte.
    fn verify(&self, packet: &[u8]) -> Verdict;

    /// Wrap a payload for transmission.
    fn frame(&self, payload: &[u8]) -> Result<Bytes, ProtocolError>;

    /// Recover the payload from one complete wire packet.
    fn deframe(&self, wire: &[u8]) -> Result<Bytes, ProtocolError>;
}
