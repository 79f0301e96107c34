//! Escaped framing with a trailing checksum.
//!
//! Wire layout:
//!
//! ```text
//! START  escaped(payload ++ checksum_lo ++ checksum_hi)  END
//! ```
//!
//! Inside the markers every literal START, END or ESC byte is sent as
//! `ESC, byte ^ toggle`, so the end marker can only appear at the end. The
//! checksum covers the unescaped payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Checksum, Grammar, Resync, Verdict};
use crate::error::ProtocolError;

const CHECKSUM_LEN: usize = 2;

#[derive(Debug, Clone)]
pub struct EscapedGrammar {
    start: u8,
    end: u8,
    escape: u8,
    toggle: u8,
    checksum: Checksum,
    min_payload: usize,
    max_payload: usize,
}

impl EscapedGrammar {
    pub fn new(start: u8, end: u8, escape: u8, toggle: u8, checksum: Checksum) -> Self {
        Self {
            start,
            end,
            escape,
            toggle,
            checksum,
            min_payload: 1,
            max_payload: 256,
        }
    }

    /// Bound the unescaped payload length, checksum excluded.
    pub fn with_payload_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_payload = min;
        self.max_payload = max.max(min);
        self
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    fn is_reserved(&self, byte: u8) -> bool {
        byte == self.start || byte == self.end || byte == self.escape
    }

    /// Longest packet that can appear on the wire, with every byte escaped.
    fn max_wire_len(&self) -> usize {
        2 + 2 * (self.max_payload + CHECKSUM_LEN)
    }

    fn put_escaped(&self, dst: &mut BytesMut, byte: u8) {
        if self.is_reserved(byte) {
            dst.put_u8(self.escape);
            dst.put_u8(byte ^ self.toggle);
        } else {
            dst.put_u8(byte);
        }
    }

    fn unescape(&self, wire: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::with_capacity(wire.len());
        let mut bytes = wire.iter();
        while let Some(&byte) = bytes.next() {
            if byte == self.escape {
                match bytes.next() {
                    Some(&escaped) => body.push(escaped ^ self.toggle),
                    None => return Err(ProtocolError::Truncated(wire.len() + 2)),
                }
            } else if self.is_reserved(byte) {
                return Err(ProtocolError::Framing);
            } else {
                body.push(byte);
            }
        }
        Ok(body)
    }
}

impl Grammar for EscapedGrammar {
    fn verify(&self, packet: &[u8]) -> Verdict {
        let Some((&first, _)) = packet.split_first() else {
            return Verdict::Exclude;
        };
        if first != self.start {
            return Verdict::Exclude;
        }

        let len = packet.len();
        if len == 1 {
            return Verdict::Include { expected: 2 };
        }

        let last = packet[len - 1];
        if last == self.end {
            // With shared markers, START START is the tail of a lost packet
            // followed by the head of the next one.
            if self.start == self.end && len == 2 {
                return Verdict::Invalid(Resync::Restart);
            }
            return Verdict::Include { expected: len };
        }
        if last == self.start {
            return Verdict::Invalid(Resync::Restart);
        }
        if len >= self.max_wire_len() {
            return Verdict::Invalid(Resync::Discard);
        }

        Verdict::Include { expected: len + 1 }
    }

    fn frame(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() > self.max_payload {
            return Err(ProtocolError::TooLarge(payload.len()));
        }
        if payload.len() < self.min_payload {
            return Err(ProtocolError::Length {
                expected: self.min_payload,
                actual: payload.len(),
            });
        }

        let [lo, hi] = self.checksum.compute(payload).to_le_bytes();
        let mut dst = BytesMut::with_capacity(2 + 2 * (payload.len() + CHECKSUM_LEN));
        dst.put_u8(self.start);
        for &byte in payload.iter().chain([lo, hi].iter()) {
            self.put_escaped(&mut dst, byte);
        }
        dst.put_u8(self.end);

        Ok(dst.freeze())
    }

    fn deframe(&self, wire: &[u8]) -> Result<Bytes, ProtocolError> {
        if wire.len() < 2 || wire[0] != self.start || wire[wire.len() - 1] != self.end {
            return Err(ProtocolError::Framing);
        }

        let body = self.unescape(&wire[1..wire.len() - 1])?;
        if body.len() < CHECKSUM_LEN + self.min_payload {
            return Err(ProtocolError::Truncated(wire.len()));
        }

        let (payload, trailer) = body.split_at(body.len() - CHECKSUM_LEN);
        if payload.len() > self.max_payload {
            return Err(ProtocolError::TooLarge(payload.len()));
        }

        let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
        let expected = self.checksum.compute(payload);
        if actual != expected {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        Ok(Bytes::copy_from_slice(payload))
    }
}
