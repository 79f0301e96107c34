//! "tx" family: unframed packets sized by their type byte.
//!
//! The device pushes key and routing events as they happen and can only
//! rewrite whole rows.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{DeviceProfile, Inbound, Model, ModelDescriptor, ModelTiming};
use crate::cells::{Alignment, Span};
use crate::error::ProtocolError;
use crate::keys::{Binding, KeyCode, KeyEvent, KeyTable, Mode, NormalizedCommand};
use crate::protocol::{Grammar, PacketLength, TabledGrammar};

pub const NAME: &str = "tx";

const MAX_PACKET: usize = 260;

const PKT_IDENTIFY: u8 = 0x84;
const PKT_WRITE_ROW: u8 = 0x81;
const PKT_ACK: u8 = 0x7e;
const PKT_NAK: u8 = 0x7f;
const PKT_KEY: u8 = 0x82;
const PKT_ROUTING: u8 = 0x83;
const PKT_INFO: u8 = 0x86;

pub mod key {
    pub const WINDOW_LEFT: u8 = 0x01;
    pub const WINDOW_RIGHT: u8 = 0x02;
    pub const LINE_UP: u8 = 0x03;
    pub const LINE_DOWN: u8 = 0x04;
    pub const CURSOR: u8 = 0x05;
    pub const TOP: u8 = 0x06;
    pub const BOTTOM: u8 = 0x07;
    pub const POSITION: u8 = 0x08;
    pub const MENU: u8 = 0x09;
    pub const HELP: u8 = 0x0a;
    pub const CHORD: u8 = 0x0b;
    pub const CLEAR: u8 = 0x0c;
}

fn grammar() -> TabledGrammar {
    TabledGrammar::new(MAX_PACKET)
        .with(PKT_IDENTIFY, PacketLength::Fixed(5))
        .with(PKT_ACK, PacketLength::Fixed(1))
        .with(PKT_NAK, PacketLength::Fixed(2))
        .with(PKT_KEY, PacketLength::Fixed(3))
        .with(PKT_ROUTING, PacketLength::Fixed(3))
        .with(PKT_INFO, PacketLength::Field { offset: 1, overhead: 2 })
}

fn key_table() -> KeyTable {
    use NormalizedCommand::*;

    KeyTable::new(NAME)
        .bind(key::WINDOW_LEFT, Binding::command("left", WindowLeft))
        .bind(key::WINDOW_RIGHT, Binding::command("right", WindowRight))
        .bind(key::LINE_UP, Binding::command("up", LineUp))
        .bind(key::LINE_DOWN, Binding::command("down", LineDown))
        .bind(key::CURSOR, Binding::command("cursor", ReturnToCursor))
        .bind(key::TOP, Binding::command("top", Top).chorded())
        .bind(key::BOTTOM, Binding::command("bottom", Bottom).chorded())
        .bind(key::POSITION, Binding::enter("position", Mode::CursorPositioning))
        .bind(key::MENU, Binding::enter("menu", Mode::ConfigMenu).chorded())
        .bind(key::HELP, Binding::command("help", Help))
        .bind(key::CLEAR, Binding::command("clear", ClearDisplay).dangerous())
        .chord_key(key::CHORD)
}

#[derive(Debug)]
pub struct TabledModel {
    grammar: Arc<TabledGrammar>,
    keys: Arc<KeyTable>,
}

impl TabledModel {
    pub fn new() -> Self {
        Self {
            grammar: Arc::new(grammar()),
            keys: Arc::new(key_table()),
        }
    }
}

impl Default for TabledModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for TabledModel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn grammar(&self) -> Arc<dyn Grammar> {
        self.grammar.clone()
    }

    fn timing(&self) -> ModelTiming {
        ModelTiming {
            identify_timeout: Duration::from_millis(500),
            identify_retries: 3,
            ack_timeout: Duration::from_millis(250),
            poll_interval: None,
        }
    }

    fn key_table(&self) -> Arc<KeyTable> {
        self.keys.clone()
    }

    fn identify_request(&self) -> Bytes {
        Bytes::from_static(&[PKT_IDENTIFY])
    }

    fn interpret(&self, payload: &[u8], at: Instant) -> Inbound {
        match *payload {
            [PKT_IDENTIFY, cols, rows, major, minor] => {
                if cols == 0 || rows == 0 {
                    return Inbound::Malformed(ProtocolError::Framing);
                }
                Inbound::Identity(DeviceProfile {
                    model: NAME,
                    firmware: format!("{major}.{minor}"),
                    columns: cols as usize,
                    rows: rows as usize,
                    status_cells: 0,
                    key_count: self.keys.len(),
                    routing_keys: cols as usize * rows as usize,
                    key_table: self.keys.clone(),
                })
            }
            [PKT_ACK] => Inbound::Acknowledged,
            [PKT_NAK, code] => Inbound::Rejected { code },
            [PKT_KEY, code, state] => Inbound::Keys(vec![KeyEvent {
                code: KeyCode::Key(code),
                pressed: state != 0,
                at,
            }]),
            [PKT_ROUTING, cell, state] => Inbound::Keys(vec![KeyEvent {
                code: KeyCode::Routing(cell as u16),
                pressed: state != 0,
                at,
            }]),
            [PKT_INFO, _, ref text @ ..] => {
                Inbound::Info(String::from_utf8_lossy(text).into_owned())
            }
            [] => Inbound::Malformed(ProtocolError::Truncated(0)),
            [kind, ..] => Inbound::Unknown(kind),
        }
    }

    fn write_request(&self, profile: &DeviceProfile, span: Span, cells: &[u8]) -> Bytes {
        let cols = profile.columns.max(1);
        let row = span.start / cols;
        let count = cells.len().min(cols);
        let mut payload = BytesMut::with_capacity(2 + count);
        payload.put_u8(PKT_WRITE_ROW);
        payload.put_u8(row as u8);
        payload.put_slice(&cells[..count]);
        payload.freeze()
    }

    fn write_alignment(&self, profile: &DeviceProfile) -> Alignment {
        Alignment::Rows(profile.columns)
    }

    fn max_write_cells(&self, profile: &DeviceProfile) -> usize {
        profile.columns
    }
}

inventory::submit! {
    ModelDescriptor {
        name: NAME,
        description: "Length-tabled displays that push key events",
        priority: 10,
        create,
    }
}

fn create() -> Arc<dyn Model> {
    Arc::new(TabledModel::new())
}
