//! State machine from raw key events to normalized commands.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{Binding, KeyAction, KeyCode, KeyEvent, KeyTable, Mode, NormalizedCommand};
use crate::tracing::prelude::*;

/// Largest repeat count that can be typed.
pub const MAX_REPEAT: u32 = 99;

/// Idle time after which an unfinished repeat count or cursor move is
/// abandoned. The configuration menu stays open until closed.
const SEQUENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct KeyDecoder {
    table: Arc<KeyTable>,
    mode: Mode,
    chord_held: bool,
    /// Command key currently held down, with its code.
    held: Option<(u8, NormalizedCommand)>,
    /// Command held when repeat count entry started.
    repeat_target: Option<NormalizedCommand>,
    count: u32,
    window_offset: usize,
    last_event: Option<Instant>,
}

impl KeyDecoder {
    pub fn new(table: Arc<KeyTable>) -> Self {
        Self {
            table,
            mode: Mode::Normal,
            chord_held: false,
            held: None,
            repeat_target: None,
            count: 0,
            window_offset: 0,
            last_event: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Pending repeat count, zero when none has been typed.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Cell of the source text shown in the leftmost display cell.
    pub fn set_window_offset(&mut self, offset: usize) {
        self.window_offset = offset;
    }

    pub fn window_offset(&self) -> usize {
        self.window_offset
    }

    /// Forget held keys and partial sequences.
    pub fn reset(&mut self) {
        self.mode = Mode::Normal;
        self.chord_held = false;
        self.held = None;
        self.repeat_target = None;
        self.count = 0;
    }

    pub fn decode(&mut self, event: &KeyEvent) -> Vec<NormalizedCommand> {
        self.expire(event.at);
        self.last_event = Some(event.at);

        match event.code {
            KeyCode::Routing(cell) => {
                if event.pressed {
                    self.routing(cell as usize)
                } else {
                    Vec::new()
                }
            }
            KeyCode::Key(code) if self.table.is_chord(code) => {
                self.chord_held = event.pressed;
                Vec::new()
            }
            KeyCode::Key(code) if !event.pressed => {
                if matches!(self.held, Some((held, _)) if held == code) {
                    self.held = None;
                }
                Vec::new()
            }
            KeyCode::Key(code) => self.press(code),
        }
    }

    fn expire(&mut self, now: Instant) {
        let Some(last) = self.last_event else {
            return;
        };
        if matches!(self.mode, Mode::RepeatCount | Mode::CursorPositioning)
            && now.duration_since(last) > SEQUENCE_TIMEOUT
        {
            debug!(mode = %self.mode, "Key sequence timed out");
            self.leave();
        }
    }

    fn routing(&mut self, cell: usize) -> Vec<NormalizedCommand> {
        let route = NormalizedCommand::RouteCursor(self.window_offset + cell);
        match self.mode {
            Mode::Normal => vec![route],
            Mode::CursorPositioning => {
                self.leave();
                vec![route]
            }
            Mode::RepeatCount => {
                self.leave();
                vec![route]
            }
            Mode::ConfigMenu => {
                debug!(cell, "Routing key ignored in menu");
                Vec::new()
            }
        }
    }

    fn press(&mut self, code: u8) -> Vec<NormalizedCommand> {
        let Some(binding) = self.table.lookup(code).cloned() else {
            debug!("Unbound key {code:#04x} in {} mode", self.mode);
            return Vec::new();
        };
        if binding.needs_chord() && !self.chord_held {
            debug!(key = binding.name, "Key needs the chord modifier, ignored");
            return Vec::new();
        }

        match self.mode {
            Mode::Normal => self.normal(code, &binding),
            Mode::RepeatCount => self.repeat(&binding),
            Mode::CursorPositioning => self.cursor(&binding),
            Mode::ConfigMenu => self.menu(&binding),
        }
    }

    fn normal(&mut self, code: u8, binding: &Binding) -> Vec<NormalizedCommand> {
        match binding.action {
            KeyAction::Command(command) => {
                self.held = Some((code, command));
                vec![command]
            }
            KeyAction::Enter(mode) => self.enter(mode),
        }
    }

    fn repeat(&mut self, binding: &Binding) -> Vec<NormalizedCommand> {
        if let Some(digit) = binding.digit {
            self.count = (self.count * 10 + digit as u32).min(MAX_REPEAT);
            trace!(count = self.count, "Repeat count");
            return Vec::new();
        }

        let count = self.count as usize;
        match binding.action {
            KeyAction::Enter(Mode::RepeatCount) => {
                let target = self.repeat_target;
                self.leave();
                target.map(|c| vec![c; count]).unwrap_or_default()
            }
            KeyAction::Enter(mode) => {
                self.leave();
                self.enter(mode)
            }
            KeyAction::Command(command) => {
                self.leave();
                vec![command; count.max(1)]
            }
        }
    }

    fn cursor(&mut self, binding: &Binding) -> Vec<NormalizedCommand> {
        use NormalizedCommand::*;

        match binding.action {
            KeyAction::Command(command) => {
                let moved = match command {
                    LineUp => CursorUp,
                    LineDown => CursorDown,
                    WindowLeft => CursorLeft,
                    WindowRight => CursorRight,
                    other => other,
                };
                vec![moved]
            }
            KeyAction::Enter(Mode::CursorPositioning) => {
                self.leave();
                Vec::new()
            }
            KeyAction::Enter(mode) => {
                self.leave();
                self.enter(mode)
            }
        }
    }

    fn menu(&mut self, binding: &Binding) -> Vec<NormalizedCommand> {
        use NormalizedCommand::*;

        match binding.action {
            KeyAction::Enter(Mode::ConfigMenu) => {
                self.leave();
                vec![MenuClose]
            }
            KeyAction::Command(LineUp) => vec![MenuPreviousItem],
            KeyAction::Command(LineDown) => vec![MenuNextItem],
            KeyAction::Command(WindowLeft) => vec![MenuPreviousValue],
            KeyAction::Command(WindowRight) => vec![MenuNextValue],
            KeyAction::Command(ReturnToCursor) => vec![MenuSelect],
            _ => {
                debug!(key = binding.name, "Key not used in menu");
                Vec::new()
            }
        }
    }

    fn enter(&mut self, mode: Mode) -> Vec<NormalizedCommand> {
        debug!(from = %self.mode, to = %mode, "Key mode");
        self.mode = mode;
        match mode {
            Mode::RepeatCount => {
                self.count = 0;
                self.repeat_target = self.held.map(|(_, command)| command);
                Vec::new()
            }
            Mode::ConfigMenu => vec![NormalizedCommand::MenuOpen],
            Mode::Normal | Mode::CursorPositioning => Vec::new(),
        }
    }

    fn leave(&mut self) {
        if self.mode != Mode::Normal {
            debug!(from = %self.mode, "Key mode back to Normal");
        }
        self.mode = Mode::Normal;
        self.count = 0;
        self.repeat_target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Binding, KeyTable};
    use NormalizedCommand::*;

    const LEFT: u8 = 0x01;
    const UP: u8 = 0x03;
    const DOWN: u8 = 0x04;
    const HOME: u8 = 0x05;
    const REPEAT: u8 = 0x08;
    const MENU: u8 = 0x09;
    const CURSOR: u8 = 0x0a;
    const CHORD: u8 = 0x0b;
    const RESET: u8 = 0x0c;
    const DOT1: u8 = 0x11;
    const DOT3: u8 = 0x13;

    fn table() -> Arc<KeyTable> {
        Arc::new(
            KeyTable::new("test")
                .bind(LEFT, Binding::command("left", WindowLeft))
                .bind(UP, Binding::command("up", LineUp))
                .bind(DOWN, Binding::command("down", LineDown))
                .bind(HOME, Binding::command("home", ReturnToCursor))
                .bind(REPEAT, Binding::enter("repeat", Mode::RepeatCount))
                .bind(MENU, Binding::enter("menu", Mode::ConfigMenu))
                .bind(CURSOR, Binding::enter("cursor", Mode::CursorPositioning))
                .bind(RESET, Binding::command("reset", Restart).dangerous())
                .bind(DOT1, Binding::command("dot1", Dots(0x01)).digit(1))
                .bind(DOT3, Binding::command("dot3", Dots(0x04)).digit(3))
                .chord_key(CHORD),
        )
    }

    struct Keys {
        decoder: KeyDecoder,
        now: Instant,
    }

    impl Keys {
        fn new() -> Self {
            Self {
                decoder: KeyDecoder::new(table()),
                now: Instant::now(),
            }
        }

        fn down(&mut self, code: u8) -> Vec<NormalizedCommand> {
            self.decoder.decode(&KeyEvent::press(KeyCode::Key(code), self.now))
        }

        fn up(&mut self, code: u8) -> Vec<NormalizedCommand> {
            self.decoder.decode(&KeyEvent::release(KeyCode::Key(code), self.now))
        }

        fn tap(&mut self, code: u8) -> Vec<NormalizedCommand> {
            let out = self.down(code);
            assert!(self.up(code).is_empty());
            out
        }

        fn route(&mut self, cell: u16) -> Vec<NormalizedCommand> {
            self.decoder.decode(&KeyEvent::press(KeyCode::Routing(cell), self.now))
        }
    }

    #[test]
    fn test_plain_commands() {
        let mut keys = Keys::new();
        assert_eq!(keys.tap(LEFT), vec![WindowLeft]);
        assert_eq!(keys.tap(DOT3), vec![Dots(0x04)]);
    }

    #[test]
    fn test_dangerous_needs_chord() {
        let mut keys = Keys::new();
        assert!(keys.tap(RESET).is_empty());

        assert!(keys.down(CHORD).is_empty());
        assert_eq!(keys.tap(RESET), vec![Restart]);
        assert!(keys.up(CHORD).is_empty());

        assert!(keys.tap(RESET).is_empty());
    }

    #[test]
    fn test_unbound_key_is_dropped() {
        let mut keys = Keys::new();
        assert!(keys.tap(0x7f).is_empty());
        assert_eq!(keys.decoder.mode(), Mode::Normal);
    }

    #[test]
    fn test_routing_adds_window_offset() {
        let mut keys = Keys::new();
        keys.decoder.set_window_offset(80);
        assert_eq!(keys.route(5), vec![RouteCursor(85)]);
    }

    #[test]
    fn test_repeat_count_applies_to_next_command() {
        let mut keys = Keys::new();
        assert!(keys.tap(REPEAT).is_empty());
        assert!(keys.tap(DOT1).is_empty());
        assert!(keys.tap(DOT3).is_empty());
        assert_eq!(keys.decoder.count(), 13);
        assert_eq!(keys.tap(DOWN), vec![LineDown; 13]);
        assert_eq!(keys.decoder.mode(), Mode::Normal);
    }

    #[test]
    fn test_repeat_count_applies_to_held_command() {
        let mut keys = Keys::new();
        assert_eq!(keys.down(UP), vec![LineUp]);
        assert!(keys.tap(REPEAT).is_empty());
        assert!(keys.tap(DOT3).is_empty());
        assert_eq!(keys.tap(REPEAT), vec![LineUp; 3]);
        assert!(keys.up(UP).is_empty());
    }

    #[test]
    fn test_repeat_count_is_capped() {
        let mut keys = Keys::new();
        keys.tap(REPEAT);
        for _ in 0..4 {
            keys.tap(DOT3);
        }
        assert_eq!(keys.decoder.count(), MAX_REPEAT);
    }

    #[test]
    fn test_cursor_positioning() {
        let mut keys = Keys::new();
        keys.decoder.set_window_offset(40);
        assert!(keys.tap(CURSOR).is_empty());
        assert_eq!(keys.tap(UP), vec![CursorUp]);
        assert_eq!(keys.tap(LEFT), vec![CursorLeft]);
        assert_eq!(keys.route(2), vec![RouteCursor(42)]);
        assert_eq!(keys.decoder.mode(), Mode::Normal);
        assert_eq!(keys.tap(UP), vec![LineUp]);
    }

    #[test]
    fn test_cursor_positioning_meta_leaves() {
        let mut keys = Keys::new();
        keys.tap(CURSOR);
        assert!(keys.tap(CURSOR).is_empty());
        assert_eq!(keys.decoder.mode(), Mode::Normal);
    }

    #[test]
    fn test_config_menu() {
        let mut keys = Keys::new();
        assert_eq!(keys.tap(MENU), vec![MenuOpen]);
        assert_eq!(keys.tap(DOWN), vec![MenuNextItem]);
        assert_eq!(keys.tap(LEFT), vec![MenuPreviousValue]);
        assert_eq!(keys.tap(HOME), vec![MenuSelect]);
        assert_eq!(keys.decoder.mode(), Mode::ConfigMenu);
        assert!(keys.route(3).is_empty());
        assert!(keys.tap(DOT1).is_empty());
        assert_eq!(keys.tap(MENU), vec![MenuClose]);
        assert_eq!(keys.decoder.mode(), Mode::Normal);
    }

    #[test]
    fn test_unfinished_sequence_expires() {
        let mut keys = Keys::new();
        keys.tap(REPEAT);
        keys.tap(DOT3);
        keys.now += SEQUENCE_TIMEOUT + Duration::from_secs(1);
        assert_eq!(keys.tap(DOWN), vec![LineDown]);
    }
}
