//! Configuration for the brlink daemon.
//!
//! Configuration comes from a TOML file plus environment overrides. Every
//! field has a default, so an empty file (or no file) is valid as long as a
//! device identifier is supplied somewhere.
//!
//! ```toml
//! [device]
//! identifier = "serial:/dev/ttyUSB0@57600"
//! model = "fx"
//!
//! [session]
//! ack_timeout_ms = 300
//! merge_gap = 4
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::session::SessionConfig;
use crate::transport::{
    BluetoothSettings, HidSettings, SerialSettings, TransportDescriptor, UsbSettings,
};

/// Overrides `device.identifier`.
pub const ENV_DEVICE: &str = "BRLINK_DEVICE";
/// Overrides `device.model`.
pub const ENV_MODEL: &str = "BRLINK_MODEL";
/// Path of the configuration file when none is given on the command line.
pub const ENV_CONFIG: &str = "BRLINK_CONFIG";

pub const DEFAULT_PATH: &str = "/etc/brlink/brlink.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub session: SessionConfig,
    pub daemon: DaemonConfig,
}

/// Which display to talk to and how.
///
/// `identifier` selects the transport and its address. The per-transport
/// tables refine it: a `[device.serial]` table supplies parity and flow
/// control for a `serial:` identifier, for example. A table alone, with no
/// identifier, selects that transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub identifier: Option<String>,
    /// Model name; every registered model is tried when unset.
    pub model: Option<String>,
    pub serial: Option<SerialSettings>,
    pub usb: Option<UsbSettings>,
    pub hid: Option<HidSettings>,
    pub bluetooth: Option<BluetoothSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How often the display loop drains input and retries.
    pub tick_ms: u64,
    /// Delay between reconnection attempts.
    pub reconnect_ms: u64,
    /// Scratchpad length, in displays.
    pub pages: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            reconnect_ms: 5000,
            pages: 4,
        }
    }
}

impl DaemonConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }
}

impl Config {
    /// Load from `path`, or from `BRLINK_CONFIG`, or from the default
    /// location if it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => match env::var(ENV_CONFIG) {
                Ok(path) => Some(PathBuf::from(path)),
                Err(_) => Some(PathBuf::from(DEFAULT_PATH)).filter(|p| p.exists()),
            },
        };

        let mut config = match path {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok());
        Ok(config)
    }

    /// Load configuration from a specific file, without overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `BRLINK_DEVICE` and `BRLINK_MODEL` through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device) = lookup(ENV_DEVICE).filter(|v| !v.is_empty()) {
            self.device.identifier = Some(device);
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.device.model = Some(model);
        }
    }
}

impl DeviceConfig {
    /// The transport to open.
    pub fn descriptor(&self) -> Result<TransportDescriptor> {
        let Some(identifier) = &self.identifier else {
            return self.table_descriptor();
        };

        let parsed: TransportDescriptor = identifier.parse()?;
        Ok(match parsed {
            TransportDescriptor::Serial(from_id) => match &self.serial {
                Some(table) => TransportDescriptor::Serial(SerialSettings {
                    path: from_id.path,
                    baud: if identifier.contains('@') { from_id.baud } else { table.baud },
                    ..table.clone()
                }),
                None => TransportDescriptor::Serial(from_id),
            },
            TransportDescriptor::Usb(from_id) => match &self.usb {
                Some(table) => TransportDescriptor::Usb(UsbSettings {
                    vendor_id: from_id.vendor_id,
                    product_id: from_id.product_id,
                    serial: from_id.serial.or_else(|| table.serial.clone()),
                    ..table.clone()
                }),
                None => TransportDescriptor::Usb(from_id),
            },
            TransportDescriptor::Hid(from_id) => match &self.hid {
                Some(table) => TransportDescriptor::Hid(HidSettings {
                    vendor_id: from_id.vendor_id,
                    product_id: from_id.product_id,
                    serial: from_id.serial.or_else(|| table.serial.clone()),
                    ..table.clone()
                }),
                None => TransportDescriptor::Hid(from_id),
            },
            TransportDescriptor::Bluetooth(from_id) => match &self.bluetooth {
                Some(table) => TransportDescriptor::Bluetooth(BluetoothSettings {
                    address: from_id.address,
                    channel: from_id.channel,
                    ..table.clone()
                }),
                None => TransportDescriptor::Bluetooth(from_id),
            },
        })
    }

    fn table_descriptor(&self) -> Result<TransportDescriptor> {
        if let Some(serial) = &self.serial {
            return Ok(TransportDescriptor::Serial(serial.clone()));
        }
        if let Some(usb) = &self.usb {
            return Ok(TransportDescriptor::Usb(usb.clone()));
        }
        if let Some(hid) = &self.hid {
            return Ok(TransportDescriptor::Hid(hid.clone()));
        }
        if let Some(bluetooth) = &self.bluetooth {
            return Ok(TransportDescriptor::Bluetooth(bluetooth.clone()));
        }
        Err(Error::Config(format!(
            "no device configured; set device.identifier or {ENV_DEVICE}"
        )))
    }
}
