//! Device families.
//!
//! A [`Model`] knows one family's packet grammar, its identify exchange, how
//! to turn cell spans into write packets, and how to read the packets the
//! device sends back. Models register themselves with [`inventory`] through a
//! [`ModelDescriptor`], so the session can pick one by name or try them all.

pub mod framed;
pub mod tabled;

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cells::{Alignment, Span};
use crate::error::ProtocolError;
use crate::keys::{KeyEvent, KeyTable};
use crate::protocol::Grammar;

/// Timing constants of one family. Each can be overridden by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelTiming {
    pub identify_timeout: Duration,
    /// Resends after the first identify request; zero means one attempt.
    pub identify_retries: u32,
    pub ack_timeout: Duration,
    /// Interval between key polls, for devices that do not push key events.
    pub poll_interval: Option<Duration>,
}

/// What a successful identify exchange tells us about the device.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub model: &'static str,
    pub firmware: String,
    pub columns: usize,
    pub rows: usize,
    pub status_cells: usize,
    pub key_count: usize,
    pub routing_keys: usize,
    pub key_table: Arc<KeyTable>,
}

impl DeviceProfile {
    /// Text cells, excluding status cells.
    pub fn cells(&self) -> usize {
        self.columns * self.rows
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} firmware {}",
            self.model, self.columns, self.rows, self.firmware
        )
    }
}

/// One interpreted inbound packet.
#[derive(Debug, Clone)]
pub enum Inbound {
    Identity(DeviceProfile),
    /// The outstanding write was applied.
    Acknowledged,
    /// The outstanding command was refused with a device failure code.
    Rejected { code: u8 },
    Keys(Vec<KeyEvent>),
    /// Free-form status text.
    Info(String),
    /// A well-formed packet of a type the model does not handle.
    Unknown(u8),
    /// A packet of a known type with an impossible body.
    Malformed(ProtocolError),
}

pub trait Model: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn grammar(&self) -> Arc<dyn Grammar>;

    fn timing(&self) -> ModelTiming;

    fn key_table(&self) -> Arc<KeyTable>;

    /// Payload that asks the device to identify itself.
    fn identify_request(&self) -> Bytes;

    /// Interpret one deframed payload received at `at`.
    fn interpret(&self, payload: &[u8], at: Instant) -> Inbound;

    /// Payload writing `cells` at `span`. `span` respects
    /// [`Model::write_alignment`] and [`Model::max_write_cells`].
    fn write_request(&self, profile: &DeviceProfile, span: Span, cells: &[u8]) -> Bytes;

    fn write_alignment(&self, profile: &DeviceProfile) -> Alignment;

    fn max_write_cells(&self, profile: &DeviceProfile) -> usize;

    /// Payload asking for pending key events, if this family must be polled.
    fn poll_request(&self) -> Option<Bytes> {
        None
    }
}

/// Registration record for a model.
pub struct ModelDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    /// Autodetection order, lowest first.
    pub priority: u8,
    pub create: fn() -> Arc<dyn Model>,
}

inventory::collect!(ModelDescriptor);

/// Models that have registered with inventory.
pub struct ModelRegistry;

impl ModelRegistry {
    /// All registered models in autodetection order.
    pub fn all() -> Vec<&'static ModelDescriptor> {
        let mut models: Vec<_> = inventory::iter::<ModelDescriptor>().collect();
        models.sort_by_key(|desc| (desc.priority, desc.name));
        models
    }

    pub fn find(name: &str) -> Option<&'static ModelDescriptor> {
        inventory::iter::<ModelDescriptor>().find(|desc| desc.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order() {
        let names: Vec<_> = ModelRegistry::all().iter().map(|d| d.name).collect();
        assert_eq!(names, vec![framed::NAME, tabled::NAME]);
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let desc = ModelRegistry::find("FX").unwrap();
        assert_eq!(desc.name, framed::NAME);
        assert_eq!((desc.create)().name(), framed::NAME);
        assert!(ModelRegistry::find("nonexistent").is_none());
    }
}
