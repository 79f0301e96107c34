//! Common error types for brlink.
//!
//! This module provides a centralized Error enum using thiserror, plus the
//! narrower transport and protocol enums that the lower layers return. The
//! split follows how failures are handled: transport errors end a session,
//! protocol errors cost one packet, timeouts cost a retry.

use std::io;
use thiserror::Error;

// Same value on Linux and macOS.
const EBUSY: i32 = 16;

/// Failures of the physical channel.
///
/// These are `Clone` so a failed handle can keep returning the error that
/// killed it without touching the hardware again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("timed out waiting for data")]
    Timeout,

    #[error("operation not supported by this transport")]
    Unsupported,

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Classify an OS error.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TransportError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(err.to_string()),
            io::ErrorKind::AddrInUse => TransportError::Busy(err.to_string()),
            _ if err.raw_os_error() == Some(EBUSY) => TransportError::Busy(err.to_string()),
            io::ErrorKind::Unsupported => TransportError::Unsupported,
            _ => TransportError::Io(err.to_string()),
        }
    }

    /// Whether the handle must be considered dead after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout | TransportError::Unsupported)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::from_io(&err)
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::NoDevice => TransportError::NotFound(err.to_string()),
            tokio_serial::ErrorKind::Io(kind) => {
                TransportError::from_io(&io::Error::new(kind, err.to_string()))
            }
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// A packet that could not be accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("checksum mismatch: computed {expected:#06x}, received {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("truncated packet ({0} bytes)")]
    Truncated(usize),

    #[error("packet is {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("malformed framing")]
    Framing,

    #[error("unexpected packet type {0:#04x}")]
    UnexpectedType(u8),

    #[error("payload of {0} bytes exceeds the grammar maximum")]
    TooLarge(usize),
}

/// Main error type for brlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The channel failed; the session is gone.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A packet was rejected and the configured error budget is spent.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Too many consecutive acknowledgement or identify timeouts.
    #[error("display unresponsive after {0} consecutive timeouts")]
    Unresponsive(u32),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("cell image has {actual} cells, display has {expected}")]
    ImageSize { expected: usize, actual: usize },

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
