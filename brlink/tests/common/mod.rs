//! Scripted fake display for session tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use brlink::model::framed::FramedModel;
use brlink::model::tabled::TabledModel;
use brlink::model::Model;
use brlink::transport::{Endpoint, TransportHandle};

/// Answers one written packet with zero or more inbound chunks.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct State {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
    failed: bool,
    closed: bool,
}

/// Test side of a fake channel. Clones share the same device.
#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<State>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle::new(Box::new(FakeEndpoint {
            state: self.state.clone(),
        }))
    }

    pub fn respond(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queue bytes for the session to read.
    pub fn push(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend(bytes);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Make every later read and write fail.
    pub fn fail(&self) {
        self.state.lock().failed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

struct FakeEndpoint {
    state: Arc<Mutex<State>>,
}

impl FakeEndpoint {
    fn take(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.failed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = state.inbound.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    fn describe(&self) -> String {
        "fake".into()
    }

    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let n = self.take(buf)?;
        if n > 0 {
            return Ok(n);
        }
        tokio::time::sleep(timeout).await;
        self.take(buf)
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.failed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.writes.push(data.to_vec());
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        for reply in replies {
            state.inbound.extend(reply);
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

pub fn fx() -> Arc<dyn Model> {
    Arc::new(FramedModel::new())
}

pub fn tx() -> Arc<dyn Model> {
    Arc::new(TabledModel::new())
}

pub fn frame(model: &dyn Model, payload: &[u8]) -> Vec<u8> {
    model.grammar().frame(payload).unwrap().to_vec()
}

pub fn deframe(model: &dyn Model, wire: &[u8]) -> Vec<u8> {
    model.grammar().deframe(wire).unwrap().to_vec()
}

/// An fx display of `cols` x `rows` that identifies and answers writes and
/// polls as configured.
pub struct FxScript {
    pub cols: u8,
    pub rows: u8,
    /// Reply to writes: `Some(b"AW")` acknowledges.
    pub write_reply: Option<Vec<u8>>,
    /// Reply to key polls.
    pub poll_reply: Option<Vec<u8>>,
}

impl Default for FxScript {
    fn default() -> Self {
        Self {
            cols: 40,
            rows: 1,
            write_reply: Some(b"AW".to_vec()),
            poll_reply: Some(vec![b'K', 0]),
        }
    }
}

impl FxScript {
    pub fn install(self, device: &FakeDevice) {
        let model = FramedModel::new();
        device.respond(move |wire| {
            let payload = deframe(&model, wire);
            let reply = match payload.first() {
                Some(b'I') => Some(vec![b'I', self.cols, self.rows, b'2', b'.', b'1']),
                Some(b'W') => self.write_reply.clone(),
                Some(b'P') => self.poll_reply.clone(),
                _ => None,
            };
            reply.map(|r| frame(&model, &r)).into_iter().collect()
        });
    }
}

/// Write payload the fx model sends for `cells` at `start`.
pub fn fx_write(start: u16, cells: &[u8]) -> Vec<u8> {
    let mut payload = vec![b'W'];
    payload.extend_from_slice(&start.to_le_bytes());
    payload.push(cells.len() as u8);
    payload.extend_from_slice(cells);
    payload
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
