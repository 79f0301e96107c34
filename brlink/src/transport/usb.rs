//! Raw USB interfaces through nusb.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Queue, Recipient, RequestBuffer};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::time::{self, Instant};

use super::{ControlRequest, Endpoint, UsbRequestType};
use crate::error::TransportError;
use crate::tracing::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Only open the device with this serial number string.
    pub serial: Option<String>,
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    /// Use interrupt pipes instead of bulk pipes.
    pub interrupt: bool,
    /// Size of each IN transfer.
    pub packet_size: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0,
            product_id: 0,
            serial: None,
            interface: 0,
            endpoint_in: 0x81,
            endpoint_out: 0x01,
            interrupt: false,
            packet_size: 64,
        }
    }
}

impl UsbSettings {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Default::default()
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16, serial: Option<&str>) -> bool {
        vendor_id == self.vendor_id
            && product_id == self.product_id
            && self.serial.as_deref().map_or(true, |want| serial == Some(want))
    }
}

pub struct UsbEndpoint {
    interface: nusb::Interface,
    reader: Queue<RequestBuffer>,
    settings: UsbSettings,
    /// Bytes of a completed IN transfer that did not fit the caller's buffer.
    leftover: BytesMut,
    label: String,
}

fn transfer_error(err: nusb::transfer::TransferError) -> io::Error {
    io::Error::other(err)
}

pub fn open(settings: &UsbSettings) -> Result<Box<dyn Endpoint>, TransportError> {
    let label = format!("usb:{:04x}:{:04x}", settings.vendor_id, settings.product_id);
    let device_info = nusb::list_devices()?
        .find(|d| settings.matches(d.vendor_id(), d.product_id(), d.serial_number()))
        .ok_or_else(|| TransportError::NotFound(label.clone()))?;

    debug!(
        device = %label,
        bus = device_info.bus_number(),
        address = device_info.device_address(),
        "Found USB device"
    );

    let device = device_info.open()?;
    let interface = device.detach_and_claim_interface(settings.interface)?;

    let mut reader = if settings.interrupt {
        interface.interrupt_in_queue(settings.endpoint_in)
    } else {
        interface.bulk_in_queue(settings.endpoint_in)
    };
    reader.submit(RequestBuffer::new(settings.packet_size));

    Ok(Box::new(UsbEndpoint {
        interface,
        reader,
        settings: settings.clone(),
        leftover: BytesMut::new(),
        label,
    }))
}

impl UsbEndpoint {
    fn take_leftover(&mut self, buf: &mut [u8]) -> usize {
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        n
    }
}

#[async_trait]
impl Endpoint for UsbEndpoint {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !self.leftover.is_empty() {
            return Ok(self.take_leftover(buf));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.reader.pending() == 0 {
                self.reader.submit(RequestBuffer::new(self.settings.packet_size));
            }
            // The queue keeps the transfer when the wait times out.
            let Ok(completion) = time::timeout_at(deadline, self.reader.next_complete()).await
            else {
                return Ok(0);
            };
            let data = completion.into_result().map_err(transfer_error)?;
            self.reader.submit(RequestBuffer::new(self.settings.packet_size));

            if !data.is_empty() {
                self.leftover.extend_from_slice(&data);
                return Ok(self.take_leftover(buf));
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let completion = if self.settings.interrupt {
            self.interface
                .interrupt_out(self.settings.endpoint_out, data.to_vec())
                .await
        } else {
            self.interface
                .bulk_out(self.settings.endpoint_out, data.to_vec())
                .await
        };
        let sent = completion.into_result().map_err(transfer_error)?;
        if sent.actual_length() != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short USB write: {} of {}", sent.actual_length(), data.len()),
            ));
        }
        Ok(())
    }

    async fn control(&mut self, request: &ControlRequest) -> io::Result<Vec<u8>> {
        let control_type = |kind: UsbRequestType| match kind {
            UsbRequestType::Vendor => ControlType::Vendor,
            UsbRequestType::Class => ControlType::Class,
        };
        let index = self.settings.interface as u16;

        match request {
            ControlRequest::UsbIn {
                kind,
                request,
                value,
                length,
            } => self
                .interface
                .control_in(ControlIn {
                    control_type: control_type(*kind),
                    recipient: Recipient::Interface,
                    request: *request,
                    value: *value,
                    index,
                    length: *length,
                })
                .await
                .into_result()
                .map_err(transfer_error),
            ControlRequest::UsbOut {
                kind,
                request,
                value,
                data,
            } => self
                .interface
                .control_out(ControlOut {
                    control_type: control_type(*kind),
                    recipient: Recipient::Interface,
                    request: *request,
                    value: *value,
                    index,
                    data,
                })
                .await
                .into_result()
                .map(|_| Vec::new())
                .map_err(transfer_error),
            _ => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.reader.cancel_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        let mut settings = UsbSettings::new(0x1209, 0xabcd);
        assert!(settings.matches(0x1209, 0xabcd, None));
        assert!(!settings.matches(0x1209, 0xabce, None));

        settings.serial = Some("B1".into());
        assert!(settings.matches(0x1209, 0xabcd, Some("B1")));
        assert!(!settings.matches(0x1209, 0xabcd, Some("B2")));
        assert!(!settings.matches(0x1209, 0xabcd, None));
    }

    #[test]
    fn test_settings_defaults() {
        let settings: UsbSettings = toml::from_str("vendor_id = 4617\nproduct_id = 1").unwrap();
        assert_eq!(settings.endpoint_in, 0x81);
        assert_eq!(settings.endpoint_out, 0x01);
        assert!(!settings.interrupt);
    }
}
