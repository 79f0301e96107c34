//! "fx" family: STX/ETX framed packets with CRC-16/CCITT.
//!
//! Payloads start with an ASCII command letter:
//!
//! | dir | payload                                   |
//! |-----|-------------------------------------------|
//! | ->  | `I`                                       |
//! | <-  | `I cols rows version...`                  |
//! | ->  | `W start_lo start_hi count cells...`      |
//! | <-  | `A cmd` / `N cmd code`                    |
//! | ->  | `P`                                       |
//! | <-  | `K n (group index state){n}`              |
//! | <-  | `T text...`                               |
//!
//! Key groups are 0 for function keys and 1 for routing keys. The device
//! does not push key events, so the session polls.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{DeviceProfile, Inbound, Model, ModelDescriptor, ModelTiming};
use crate::cells::{Alignment, Span};
use crate::error::ProtocolError;
use crate::keys::{Binding, KeyCode, KeyEvent, KeyTable, Mode, NormalizedCommand};
use crate::protocol::{Checksum, EscapedGrammar, Grammar};
use crate::tracing::prelude::*;

pub const NAME: &str = "fx";

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ESC: u8 = 0x1b;
const TOGGLE: u8 = 0x20;
const MAX_PAYLOAD: usize = 256;

/// Largest cell count in one write packet.
pub const MAX_WRITE_CELLS: usize = 240;

const CMD_IDENTIFY: u8 = b'I';
const CMD_WRITE: u8 = b'W';
const CMD_POLL: u8 = b'P';
const RSP_ACK: u8 = b'A';
const RSP_NAK: u8 = b'N';
const RSP_KEYS: u8 = b'K';
const RSP_TEXT: u8 = b'T';

const GROUP_KEY: u8 = 0;
const GROUP_ROUTING: u8 = 1;

pub mod key {
    pub const WINDOW_LEFT: u8 = 0x01;
    pub const WINDOW_RIGHT: u8 = 0x02;
    pub const LINE_UP: u8 = 0x03;
    pub const LINE_DOWN: u8 = 0x04;
    pub const CURSOR: u8 = 0x05;
    pub const TOP: u8 = 0x06;
    pub const BOTTOM: u8 = 0x07;
    pub const REPEAT: u8 = 0x08;
    pub const MENU: u8 = 0x09;
    pub const POSITION: u8 = 0x0a;
    pub const CHORD: u8 = 0x0b;
    pub const RESTART: u8 = 0x0c;
    pub const SPACE: u8 = 0x10;
    pub const DOT1: u8 = 0x11;
}

fn key_table() -> KeyTable {
    use NormalizedCommand::*;

    let mut table = KeyTable::new(NAME)
        .bind(key::WINDOW_LEFT, Binding::command("left", WindowLeft))
        .bind(key::WINDOW_RIGHT, Binding::command("right", WindowRight))
        .bind(key::LINE_UP, Binding::command("up", LineUp))
        .bind(key::LINE_DOWN, Binding::command("down", LineDown))
        .bind(key::CURSOR, Binding::command("cursor", ReturnToCursor))
        .bind(key::TOP, Binding::command("top", Top).chorded())
        .bind(key::BOTTOM, Binding::command("bottom", Bottom).chorded())
        .bind(key::REPEAT, Binding::enter("repeat", Mode::RepeatCount))
        .bind(key::MENU, Binding::enter("menu", Mode::ConfigMenu).chorded())
        .bind(key::POSITION, Binding::enter("position", Mode::CursorPositioning))
        .bind(key::RESTART, Binding::command("restart", Restart).dangerous())
        .bind(key::SPACE, Binding::command("space", Dots(0)).digit(0))
        .chord_key(key::CHORD);

    const DOT_NAMES: [&str; 8] = ["dot1", "dot2", "dot3", "dot4", "dot5", "dot6", "dot7", "dot8"];
    for (i, name) in DOT_NAMES.into_iter().enumerate() {
        let binding = Binding::command(name, Dots(1 << i)).digit(i as u8 + 1);
        table = table.bind(key::DOT1 + i as u8, binding);
    }
    table
}

#[derive(Debug)]
pub struct FramedModel {
    grammar: Arc<EscapedGrammar>,
    keys: Arc<KeyTable>,
}

impl FramedModel {
    pub fn new() -> Self {
        Self {
            grammar: Arc::new(
                EscapedGrammar::new(STX, ETX, ESC, TOGGLE, Checksum::Crc16Ccitt)
                    .with_payload_bounds(1, MAX_PAYLOAD),
            ),
            keys: Arc::new(key_table()),
        }
    }

    fn identity(&self, body: &[u8]) -> Inbound {
        let [cols, rows, version @ ..] = body else {
            return Inbound::Malformed(ProtocolError::Truncated(body.len() + 1));
        };
        if *cols == 0 || *rows == 0 {
            return Inbound::Malformed(ProtocolError::Framing);
        }
        Inbound::Identity(DeviceProfile {
            model: NAME,
            firmware: String::from_utf8_lossy(version).trim().to_string(),
            columns: *cols as usize,
            rows: *rows as usize,
            status_cells: 0,
            key_count: self.keys.len(),
            routing_keys: *cols as usize,
            key_table: self.keys.clone(),
        })
    }

    fn keys(&self, body: &[u8], at: Instant) -> Inbound {
        let Some((&n, entries)) = body.split_first() else {
            return Inbound::Malformed(ProtocolError::Truncated(1));
        };
        if entries.len() != n as usize * 3 {
            return Inbound::Malformed(ProtocolError::Length {
                expected: 2 + n as usize * 3,
                actual: 1 + body.len(),
            });
        }

        let events = entries
            .chunks_exact(3)
            .filter_map(|entry| {
                let code = match entry[0] {
                    GROUP_KEY => KeyCode::Key(entry[1]),
                    GROUP_ROUTING => KeyCode::Routing(entry[1] as u16),
                    group => {
                        debug!(group, "Unknown key group");
                        return None;
                    }
                };
                Some(KeyEvent {
                    code,
                    pressed: entry[2] != 0,
                    at,
                })
            })
            .collect();
        Inbound::Keys(events)
    }
}

impl Default for FramedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for FramedModel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn grammar(&self) -> Arc<dyn Grammar> {
        self.grammar.clone()
    }

    fn timing(&self) -> ModelTiming {
        ModelTiming {
            identify_timeout: Duration::from_millis(1000),
            identify_retries: 2,
            ack_timeout: Duration::from_millis(500),
            poll_interval: Some(Duration::from_millis(100)),
        }
    }

    fn key_table(&self) -> Arc<KeyTable> {
        self.keys.clone()
    }

    fn identify_request(&self) -> Bytes {
        Bytes::from_static(&[CMD_IDENTIFY])
    }

    fn interpret(&self, payload: &[u8], at: Instant) -> Inbound {
        let Some((&kind, body)) = payload.split_first() else {
            return Inbound::Malformed(ProtocolError::Truncated(0));
        };
        match kind {
            CMD_IDENTIFY => self.identity(body),
            RSP_ACK => Inbound::Acknowledged,
            RSP_NAK => match body {
                [_, code, ..] => Inbound::Rejected { code: *code },
                _ => Inbound::Malformed(ProtocolError::Truncated(payload.len())),
            },
            RSP_KEYS => self.keys(body, at),
            RSP_TEXT => Inbound::Info(String::from_utf8_lossy(body).into_owned()),
            other => Inbound::Unknown(other),
        }
    }

    fn write_request(&self, _profile: &DeviceProfile, span: Span, cells: &[u8]) -> Bytes {
        let count = span.len.min(MAX_WRITE_CELLS).min(cells.len());
        let mut payload = BytesMut::with_capacity(4 + count);
        payload.put_u8(CMD_WRITE);
        payload.put_u16_le(span.start as u16);
        payload.put_u8(count as u8);
        payload.put_slice(&cells[..count]);
        payload.freeze()
    }

    fn write_alignment(&self, _profile: &DeviceProfile) -> Alignment {
        Alignment::Cells
    }

    fn max_write_cells(&self, _profile: &DeviceProfile) -> usize {
        MAX_WRITE_CELLS
    }

    fn poll_request(&self) -> Option<Bytes> {
        Some(Bytes::from_static(&[CMD_POLL]))
    }
}

inventory::submit! {
    ModelDescriptor {
        name: NAME,
        description: "STX/ETX framed displays with CRC-16 and key polling",
        priority: 0,
        create,
    }
}

fn create() -> Arc<dyn Model> {
    Arc::new(FramedModel::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(model: &FramedModel) -> DeviceProfile {
        match model.interpret(b"I\x28\x01v1.2", Instant::now()) {
            Inbound::Identity(profile) => profile,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_identity() {
        let model = FramedModel::new();
        let profile = profile(&model);
        assert_eq!(profile.columns, 40);
        assert_eq!(profile.rows, 1);
        assert_eq!(profile.firmware, "v1.2");
        assert_eq!(profile.routing_keys, 40);
        assert_eq!(profile.cells(), 40);
    }

    #[test]
    fn test_short_identity_is_malformed() {
        let model = FramedModel::new();
        assert!(matches!(
            model.interpret(b"I\x28", Instant::now()),
            Inbound::Malformed(_)
        ));
    }

    #[test]
    fn test_write_request() {
        let model = FramedModel::new();
        let profile = profile(&model);
        let payload = model.write_request(&profile, Span::new(10, 5), &[1, 1, 1, 1, 1]);
        assert_eq!(&payload[..], &[b'W', 10, 0, 5, 1, 1, 1, 1, 1]);

        let wire = model.grammar().frame(&payload).unwrap();
        assert_eq!(&model.grammar().deframe(&wire).unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_key_report() {
        let model = FramedModel::new();
        let at = Instant::now();
        let inbound = model.interpret(&[b'K', 2, 0, key::LINE_UP, 1, 1, 7, 0], at);
        let Inbound::Keys(events) = inbound else {
            panic!("expected keys");
        };
        assert_eq!(
            events,
            vec![
                KeyEvent::press(KeyCode::Key(key::LINE_UP), at),
                KeyEvent::release(KeyCode::Routing(7), at),
            ]
        );
    }

    #[test]
    fn test_key_report_length_checked() {
        let model = FramedModel::new();
        assert!(matches!(
            model.interpret(&[b'K', 2, 0, 1, 1], Instant::now()),
            Inbound::Malformed(ProtocolError::Length { expected: 8, actual: 5 })
        ));
    }

    #[test]
    fn test_ack_nak() {
        let model = FramedModel::new();
        let now = Instant::now();
        assert!(matches!(model.interpret(b"AW", now), Inbound::Acknowledged));
        assert!(matches!(
            model.interpret(&[b'N', b'W', 0x05], now),
            Inbound::Rejected { code: 0x05 }
        ));
        assert!(matches!(model.interpret(b"Z", now), Inbound::Unknown(b'Z')));
    }

    #[test]
    fn test_dot_keys_are_digits() {
        let table = FramedModel::new().key_table();
        let dot3 = table.lookup(key::DOT1 + 2).unwrap();
        assert_eq!(dot3.digit, Some(3));
        assert_eq!(
            dot3.action,
            crate::keys::KeyAction::Command(NormalizedCommand::Dots(0x04))
        );
        assert!(table.lookup(key::RESTART).unwrap().needs_chord());
    }
}
