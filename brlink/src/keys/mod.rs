//! Raw key events, normalized commands and per-model key tables.
//!
//! Models translate inbound key packets into [`KeyEvent`]s and describe their
//! keyboard with a [`KeyTable`]. The [`KeyDecoder`] turns the events into the
//! [`NormalizedCommand`]s that callers consume.

pub mod decoder;

use std::collections::BTreeMap;
use strum::Display;
use tokio::time::Instant;

pub use decoder::KeyDecoder;

/// Which physical key an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    /// A function, navigation or dot key, by model-specific code.
    Key(u8),
    /// The routing key above the given cell, counted from the left edge.
    Routing(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: KeyCode,
    pub pressed: bool,
    pub at: Instant,
}

impl KeyEvent {
    pub fn press(code: KeyCode, at: Instant) -> Self {
        Self {
            code,
            pressed: true,
            at,
        }
    }

    pub fn release(code: KeyCode, at: Instant) -> Self {
        Self {
            code,
            pressed: false,
            at,
        }
    }
}

/// Model-independent command handed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NormalizedCommand {
    LineUp,
    LineDown,
    WindowLeft,
    WindowRight,
    Top,
    Bottom,
    ReturnToCursor,
    CursorLeft,
    CursorRight,
    CursorUp,
    CursorDown,
    /// Move the cursor to an absolute cell of the source text.
    RouteCursor(usize),
    MenuOpen,
    MenuClose,
    MenuPreviousItem,
    MenuNextItem,
    MenuPreviousValue,
    MenuNextValue,
    MenuSelect,
    /// Dot pattern typed on the braille keyboard, dot 1 in bit 0.
    Dots(u8),
    ClearDisplay,
    Restart,
    Help,
}

/// Decoder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Mode {
    Normal,
    CursorPositioning,
    RepeatCount,
    ConfigMenu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Command(NormalizedCommand),
    /// Meta key: switch decoder state, or leave it when already there.
    Enter(Mode),
}

/// What one key does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: &'static str,
    pub action: KeyAction,
    pub chord_required: bool,
    pub dangerous: bool,
    /// Value of the key while entering a repeat count.
    pub digit: Option<u8>,
}

impl Binding {
    pub fn command(name: &'static str, command: NormalizedCommand) -> Self {
        Self {
            name,
            action: KeyAction::Command(command),
            chord_required: false,
            dangerous: false,
            digit: None,
        }
    }

    pub fn enter(name: &'static str, mode: Mode) -> Self {
        Self {
            name,
            action: KeyAction::Enter(mode),
            chord_required: false,
            dangerous: false,
            digit: None,
        }
    }

    pub fn chorded(mut self) -> Self {
        self.chord_required = true;
        self
    }

    /// Dangerous bindings only fire with the chord modifier held.
    pub fn dangerous(mut self) -> Self {
        self.dangerous = true;
        self
    }

    pub fn digit(mut self, digit: u8) -> Self {
        self.digit = Some(digit);
        self
    }

    pub fn needs_chord(&self) -> bool {
        self.chord_required || self.dangerous
    }
}

/// Mapping from raw key codes to bindings for one model.
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    name: &'static str,
    bindings: BTreeMap<u8, Binding>,
    chord: Option<u8>,
}

impl KeyTable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn bind(mut self, code: u8, binding: Binding) -> Self {
        self.bindings.insert(code, binding);
        self
    }

    /// Use `code` as the chord modifier. It never produces a command.
    pub fn chord_key(mut self, code: u8) -> Self {
        self.chord = Some(code);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lookup(&self, code: u8) -> Option<&Binding> {
        self.bindings.get(&code)
    }

    pub fn is_chord(&self, code: u8) -> bool {
        self.chord == Some(code)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Human readable listing, one line per key.
    pub fn describe(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .bindings
            .iter()
            .map(|(code, binding)| {
                let action = match binding.action {
                    KeyAction::Command(command) => command.to_string(),
                    KeyAction::Enter(mode) => format!("enter {mode}"),
                };
                let chord = if binding.needs_chord() { " (chord)" } else { "" };
                format!("{code:#04x} {}: {action}{chord}", binding.name)
            })
            .collect();
        if let Some(chord) = self.chord {
            lines.push(format!("{chord:#04x} chord modifier"));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let table = KeyTable::new("test")
            .bind(0x01, Binding::command("left", NormalizedCommand::WindowLeft))
            .bind(0x02, Binding::command("reset", NormalizedCommand::Restart).dangerous())
            .bind(0x03, Binding::enter("menu", Mode::ConfigMenu))
            .chord_key(0x0b);

        assert_eq!(
            table.describe(),
            vec![
                "0x01 left: WindowLeft",
                "0x02 reset: Restart (chord)",
                "0x03 menu: enter ConfigMenu",
                "0x0b chord modifier",
            ]
        );
        assert_eq!(table.len(), 3);
        assert!(table.is_chord(0x0b));
        assert!(table.lookup(0x0b).is_none());
    }
}
