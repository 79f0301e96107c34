//! Packets whose length is known from their leading type byte.

use bytes::Bytes;
use std::collections::HashMap;

use super::{Grammar, Resync, Verdict};
use crate::error::ProtocolError;

/// How the total length of one packet type is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// Total length including the type byte.
    Fixed(usize),
    /// Total length is the byte at `offset` plus `overhead`.
    Field { offset: usize, overhead: usize },
}

#[derive(Debug, Clone)]
pub struct TabledGrammar {
    table: HashMap<u8, PacketLength>,
    max_len: usize,
}

impl TabledGrammar {
    pub fn new(max_len: usize) -> Self {
        Self {
            table: HashMap::new(),
            max_len,
        }
    }

    pub fn with(mut self, packet_type: u8, length: PacketLength) -> Self {
        self.table.insert(packet_type, length);
        self
    }

    /// Total length of `packet`, if enough of it has arrived to tell.
    fn expected_len(&self, length: PacketLength, packet: &[u8]) -> Option<usize> {
        match length {
            PacketLength::Fixed(n) => Some(n),
            PacketLength::Field { offset, overhead } => {
                packet.get(offset).map(|&n| n as usize + overhead)
            }
        }
    }
}

impl Grammar for TabledGrammar {
    fn verify(&self, packet: &[u8]) -> Verdict {
        let Some(&length) = packet.first().and_then(|t| self.table.get(t)) else {
            return Verdict::Exclude;
        };

        match self.expected_len(length, packet) {
            Some(expected) if expected > self.max_len => Verdict::Invalid(Resync::Discard),
            Some(expected) if expected < packet.len() => Verdict::Invalid(Resync::Discard),
            Some(expected) => Verdict::Include { expected },
            None => Verdict::Include {
                expected: packet.len() + 1,
            },
        }
    }

    fn frame(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::Length {
                expected: 1,
                actual: 0,
            });
        }
        if payload.len() > self.max_len {
            return Err(ProtocolError::TooLarge(payload.len()));
        }
        Ok(Bytes::copy_from_slice(payload))
    }

    fn deframe(&self, wire: &[u8]) -> Result<Bytes, ProtocolError> {
        let Some(&packet_type) = wire.first() else {
            return Err(ProtocolError::Truncated(0));
        };
        let length = self
            .table
            .get(&packet_type)
            .copied()
            .ok_or(ProtocolError::UnexpectedType(packet_type))?;
        let expected = self
            .expected_len(length, wire)
            .ok_or(ProtocolError::Truncated(wire.len()))?;

        if wire.len() < expected {
            return Err(ProtocolError::Truncated(wire.len()));
        }
        if wire.len() > expected {
            return Err(ProtocolError::Length {
                expected,
                actual: wire.len(),
            });
        }
        Ok(Bytes::copy_from_slice(wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn grammar() -> TabledGrammar {
        TabledGrammar::new(32)
            .with(0x82, PacketLength::Fixed(3))
            .with(0x7e, PacketLength::Fixed(1))
            .with(0x86, PacketLength::Field { offset: 1, overhead: 2 })
    }

    #[test_case(&[0x82], Verdict::Include { expected: 3 } ; "fixed header")]
    #[test_case(&[0x82, 0x01, 0x01], Verdict::Include { expected: 3 } ; "fixed complete")]
    #[test_case(&[0x7e], Verdict::Include { expected: 1 } ; "single byte")]
    #[test_case(&[0x86], Verdict::Include { expected: 2 } ; "field not yet seen")]
    #[test_case(&[0x86, 0x04], Verdict::Include { expected: 6 } ; "field seen")]
    #[test_case(&[0x86, 0x40], Verdict::Invalid(Resync::Discard) ; "field too long")]
    #[test_case(&[0x55], Verdict::Exclude ; "unknown type")]
    fn test_verify(packet: &[u8], expected: Verdict) {
        assert_eq!(grammar().verify(packet), expected);
    }

    #[test]
    fn test_deframe() {
        let g = grammar();
        assert_eq!(&g.deframe(&[0x82, 0x05, 0x01]).unwrap()[..], &[0x82, 0x05, 0x01]);
        assert_eq!(
            &g.deframe(&[0x86, 0x02, b'v', b'2']).unwrap()[..],
            &[0x86, 0x02, b'v', b'2']
        );
    }

    #[test_case(&[], ProtocolError::Truncated(0) ; "empty")]
    #[test_case(&[0x82, 0x05], ProtocolError::Truncated(2) ; "short")]
    #[test_case(&[0x82, 0x05, 0x01, 0x00], ProtocolError::Length { expected: 3, actual: 4 } ; "long")]
    #[test_case(&[0x99, 0x00], ProtocolError::UnexpectedType(0x99) ; "unknown")]
    fn test_deframe_rejects(wire: &[u8], expected: ProtocolError) {
        assert_eq!(grammar().deframe(wire), Err(expected));
    }

    #[test]
    fn test_frame_is_verbatim() {
        let g = grammar();
        assert_eq!(&g.frame(&[0x81, 0x00, 0xff]).unwrap()[..], &[0x81, 0x00, 0xff]);
        assert_eq!(
            g.frame(&[]),
            Err(ProtocolError::Length { expected: 1, actual: 0 })
        );
        assert_eq!(g.frame(&[0u8; 33]), Err(ProtocolError::TooLarge(33)));
    }
}
