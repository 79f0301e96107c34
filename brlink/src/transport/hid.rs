//! HID report channels through hidapi.
//!
//! Reports carry a byte stream: after the optional report id, the first
//! byte is the count of valid bytes that follow, the rest is padding.
//! hidapi is blocking, so every call runs on the blocking pool with the
//! device behind a mutex.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

use super::{ControlRequest, Endpoint};
use crate::error::TransportError;
use crate::tracing::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HidSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    /// Report id of input reports; zero when the device does not number them.
    pub input_report: u8,
    pub output_report: u8,
    /// Size of a report, excluding the report id.
    pub report_size: usize,
}

impl Default for HidSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0,
            product_id: 0,
            serial: None,
            input_report: 0,
            output_report: 0,
            report_size: 64,
        }
    }
}

impl HidSettings {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Default::default()
        }
    }
}

pub struct HidEndpoint {
    device: Arc<Mutex<HidDevice>>,
    settings: HidSettings,
    leftover: BytesMut,
    label: String,
}

fn hid_error(err: hidapi::HidError) -> io::Error {
    io::Error::other(err.to_string())
}

pub fn open(settings: &HidSettings) -> Result<Box<dyn Endpoint>, TransportError> {
    let label = format!("hid:{:04x}:{:04x}", settings.vendor_id, settings.product_id);
    let api = HidApi::new().map_err(|e| TransportError::Io(e.to_string()))?;
    let device = match &settings.serial {
        Some(serial) => api.open_serial(settings.vendor_id, settings.product_id, serial),
        None => api.open(settings.vendor_id, settings.product_id),
    }
    .map_err(|e| TransportError::NotFound(format!("{label}: {e}")))?;

    debug!(device = %label, "Opened HID device");
    Ok(Box::new(HidEndpoint {
        device: Arc::new(Mutex::new(device)),
        settings: settings.clone(),
        leftover: BytesMut::new(),
        label,
    }))
}

/// Split `data` into output reports.
pub fn encode_reports(report_id: u8, report_size: usize, data: &[u8]) -> Vec<Vec<u8>> {
    let room = report_size.saturating_sub(1).max(1);
    data.chunks(room)
        .map(|chunk| {
            let mut report = vec![0u8; 1 + report_size.max(chunk.len() + 1)];
            report[0] = report_id;
            report[1] = chunk.len() as u8;
            report[2..2 + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// Valid bytes of one input report as returned by hidapi.
pub fn decode_report(report_id: u8, report: &[u8]) -> &[u8] {
    let body = match report.split_first() {
        Some((&id, rest)) if report_id != 0 && id == report_id => rest,
        _ => report,
    };
    match body.split_first() {
        Some((&count, rest)) => &rest[..(count as usize).min(rest.len())],
        None => &[],
    }
}

impl HidEndpoint {
    async fn blocking<T, F>(&self, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&HidDevice) -> io::Result<T> + Send + 'static,
    {
        let device = self.device.clone();
        task::spawn_blocking(move || f(&device.lock()))
            .await
            .map_err(io::Error::other)?
    }
}

#[async_trait]
impl Endpoint for HidEndpoint {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.leftover.is_empty() {
            let size = self.settings.report_size + 1;
            let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
            let report = self
                .blocking(move |device| {
                    let mut report = vec![0u8; size];
                    let n = device.read_timeout(&mut report, millis).map_err(hid_error)?;
                    report.truncate(n);
                    Ok(report)
                })
                .await?;
            let data = decode_report(self.settings.input_report, &report);
            self.leftover.extend_from_slice(data);
        }

        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let reports = encode_reports(self.settings.output_report, self.settings.report_size, data);
        self.blocking(move |device| {
            for report in &reports {
                device.write(report).map_err(hid_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn control(&mut self, request: &ControlRequest) -> io::Result<Vec<u8>> {
        match request {
            ControlRequest::GetFeature { report_id, length } => {
                let (report_id, length) = (*report_id, *length);
                self.blocking(move |device| {
                    let mut report = vec![0u8; length + 1];
                    report[0] = report_id;
                    let n = device.get_feature_report(&mut report).map_err(hid_error)?;
                    report.truncate(n);
                    Ok(report)
                })
                .await
            }
            ControlRequest::SetFeature { report_id, data } => {
                let mut report = Vec::with_capacity(data.len() + 1);
                report.push(*report_id);
                report.extend_from_slice(data);
                self.blocking(move |device| {
                    device.send_feature_report(&report).map_err(hid_error)?;
                    Ok(Vec::new())
                })
                .await
            }
            _ => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
