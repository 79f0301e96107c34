//! Bluetooth RFCOMM links through the kernel's RFCOMM TTYs.
//!
//! The link must already be bound (`rfcomm bind`). The kernel exposes each
//! binding under `/sys/class/tty/rfcommN` with `address` and `channel`
//! attributes, which is how the TTY for a device is found.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_serial::SerialPortBuilderExt;

use super::{Endpoint, StreamEndpoint};
use crate::error::TransportError;
use crate::tracing::prelude::*;

const SYS_TTY: &str = "/sys/class/tty";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothSettings {
    /// Device address, `XX:XX:XX:XX:XX:XX`.
    pub address: String,
    pub channel: u8,
    /// Use this TTY instead of looking up the binding.
    pub tty: Option<PathBuf>,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            channel: 1,
            tty: None,
        }
    }
}

impl BluetoothSettings {
    pub fn new(address: impl Into<String>, channel: u8) -> Self {
        Self {
            address: address.into(),
            channel,
            tty: None,
        }
    }
}

/// Whether `address` is six colon-separated hex octets.
pub fn is_valid_address(address: &str) -> bool {
    let octets: Vec<&str> = address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Find the RFCOMM TTY bound to `address` and `channel` under `sys_tty`.
pub fn find_tty(sys_tty: &Path, address: &str, channel: u8) -> Option<PathBuf> {
    let entries = fs::read_dir(sys_tty).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with("rfcomm") {
            continue;
        }

        let attr = |file: &str| fs::read_to_string(entry.path().join(file)).ok();
        let bound_address = attr("address").unwrap_or_default();
        let bound_channel = attr("channel").and_then(|c| c.trim().parse::<u8>().ok());

        if bound_address.trim().eq_ignore_ascii_case(address) && bound_channel == Some(channel) {
            return Some(Path::new("/dev").join(name));
        }
    }
    None
}

pub fn open(settings: &BluetoothSettings) -> Result<Box<dyn Endpoint>, TransportError> {
    if !is_valid_address(&settings.address) {
        return Err(TransportError::NotFound(format!(
            "invalid Bluetooth address {:?}",
            settings.address
        )));
    }

    let tty = match &settings.tty {
        Some(tty) => tty.clone(),
        None => find_tty(Path::new(SYS_TTY), &settings.address, settings.channel).ok_or_else(
            || {
                TransportError::NotFound(format!(
                    "no RFCOMM binding for {} channel {}",
                    settings.address, settings.channel
                ))
            },
        )?,
    };

    // The line rate of an RFCOMM TTY is nominal.
    let port = tokio_serial::new(tty.to_string_lossy(), 115_200).open_native_async()?;
    debug!(address = %settings.address, channel = settings.channel, tty = %tty.display(), "Opened RFCOMM link");
    Ok(Box::new(StreamEndpoint::new(
        port,
        format!("bluetooth:{}@{}", settings.address, settings.channel),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("00:11:22:33:44:55", true ; "valid")]
    #[test_case("aa:BB:cc:DD:ee:FF", true ; "mixed case")]
    #[test_case("00:11:22:33:44", false ; "short")]
    #[test_case("00:11:22:33:44:5G", false ; "not hex")]
    fn test_address(address: &str, valid: bool) {
        assert_eq!(is_valid_address(address), valid);
    }

    #[test]
    fn test_find_tty() {
        let root = std::env::temp_dir().join(format!("brlink-rfcomm-{}", std::process::id()));
        for (name, address, channel) in [
            ("rfcomm0", "00:11:22:33:44:55", "3"),
            ("rfcomm1", "00:11:22:33:44:55", "1"),
            ("ttyS0", "00:11:22:33:44:55", "1"),
        ] {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("address"), format!("{address}\n")).unwrap();
            fs::write(dir.join("channel"), format!("{channel}\n")).unwrap();
        }

        assert_eq!(
            find_tty(&root, "00:11:22:33:44:55", 1),
            Some(PathBuf::from("/dev/rfcomm1"))
        );
        assert_eq!(find_tty(&root, "00:11:22:33:44:66", 1), None);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_invalid_address_not_opened() {
        assert!(matches!(
            open(&BluetoothSettings::new("nope", 1)),
            Err(TransportError::NotFound(_))
        ));
    }
}
