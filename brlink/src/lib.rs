//! Driver framework for refreshable braille displays.
//!
//! Layers, lowest first:
//!
//! - [`transport`]: serial, USB, Bluetooth RFCOMM and HID channels behind
//!   one [`transport::TransportHandle`].
//! - [`protocol`]: packet grammars and the streaming packet codec.
//! - [`model`]: device families and their registry.
//! - [`cells`]: differential updates of the cell image.
//! - [`keys`]: key tables and the command decoder.
//! - [`session`]: identify handshake, acknowledged writes, key polling.

pub mod cells;
pub mod config;
pub mod error;
pub mod keys;
pub mod model;
pub mod protocol;
pub mod session;
pub mod tracing;
pub mod transport;

pub use error::{Error, Result};
pub use session::{Session, SessionConfig, SessionState};
