//! Serial ports through tokio-serial.

use serde::{Deserialize, Serialize};
use tokio_serial::SerialPortBuilderExt;

use super::{Endpoint, StreamEndpoint};
use crate::error::TransportError;
use crate::tracing::prelude::*;

pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub path: String,
    pub baud: u32,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub stop_bits: u8,
    pub data_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud: DEFAULT_BAUD,
            parity: Parity::None,
            flow_control: FlowControl::None,
            stop_bits: 1,
            data_bits: 8,
        }
    }
}

impl SerialSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    fn builder(&self) -> Result<tokio_serial::SerialPortBuilder, TransportError> {
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let flow_control = match self.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
            FlowControl::Software => tokio_serial::FlowControl::Software,
        };
        let stop_bits = match self.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            n => return Err(TransportError::Io(format!("unsupported stop bits: {n}"))),
        };
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            n => return Err(TransportError::Io(format!("unsupported data bits: {n}"))),
        };

        Ok(tokio_serial::new(&self.path, self.baud)
            .parity(parity)
            .flow_control(flow_control)
            .stop_bits(stop_bits)
            .data_bits(data_bits))
    }
}

pub fn open(settings: &SerialSettings) -> Result<Box<dyn Endpoint>, TransportError> {
    let port = settings.builder()?.open_native_async()?;
    debug!(path = %settings.path, baud = settings.baud, "Opened serial port");
    Ok(Box::new(StreamEndpoint::new(
        port,
        format!("serial:{}", settings.path),
    )))
}
