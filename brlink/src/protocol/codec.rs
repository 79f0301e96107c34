//! Incremental packet reader on top of a [`Grammar`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

use super::{Grammar, Resync, Verdict};
use crate::error::ProtocolError;
use crate::tracing::prelude::*;

/// One unit recovered from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Deframed payload of a valid packet.
    Packet(Bytes),
    /// A packet-sized chunk that failed verification. The stream carries on.
    Rejected(ProtocolError),
}

/// Accumulates bytes and hands them to the grammar one at a time.
///
/// The result never depends on how the input was chunked.
#[derive(Debug)]
pub struct PacketCodec {
    grammar: Arc<dyn Grammar>,
    pending: BytesMut,
    ready: VecDeque<Decoded>,
}

impl PacketCodec {
    pub fn new(grammar: Arc<dyn Grammar>) -> Self {
        Self {
            grammar,
            pending: BytesMut::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn grammar(&self) -> &Arc<dyn Grammar> {
        &self.grammar
    }

    /// Feed raw bytes and collect everything they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        for &byte in bytes {
            self.push(byte);
        }
        self.ready.drain(..).collect()
    }

    /// Drop any partial packet, e.g. after the link was reopened.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.ready.clear();
    }

    /// Bytes held towards an incomplete packet.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, byte: u8) {
        self.pending.put_u8(byte);

        match self.grammar.verify(&self.pending) {
            Verdict::Include { expected } => {
                if self.pending.len() >= expected {
                    self.complete();
                }
            }
            Verdict::Exclude => {
                self.pending.truncate(self.pending.len() - 1);
                if self.pending.is_empty() {
                    trace!("Skipping byte {byte:#04x} outside packet");
                } else {
                    self.complete();
                    self.push(byte);
                }
            }
            Verdict::Invalid(Resync::Discard) => {
                debug!(len = self.pending.len(), "Discarding invalid byte run");
                self.pending.clear();
                self.ready.push_back(Decoded::Rejected(ProtocolError::Framing));
            }
            Verdict::Invalid(Resync::Restart) => {
                let abandoned = self.pending.len() - 1;
                self.pending.clear();
                debug!(len = abandoned, "Packet interrupted, resynchronizing");
                self.ready
                    .push_back(Decoded::Rejected(ProtocolError::Truncated(abandoned)));
                if abandoned > 0 {
                    self.push(byte);
                }
            }
        }
    }

    fn complete(&mut self) {
        let wire = self.pending.split().freeze();
        let decoded = match self.grammar.deframe(&wire) {
            Ok(payload) => {
                trace!(rx = %hex::encode(&wire), "Packet");
                Decoded::Packet(payload)
            }
            Err(e) => {
                debug!(rx = %hex::encode(&wire), error = %e, "Rejected packet");
                Decoded::Rejected(e)
            }
        };
        self.ready.push_back(decoded);
    }
}

impl Decoder for PacketCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while self.ready.is_empty() && src.has_remaining() {
            let byte = src.get_u8();
            self.push(byte);
        }
        Ok(self.ready.pop_front())
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = self
            .grammar
            .frame(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        dst.put_slice(&wire);
        Ok(())
    }
}
