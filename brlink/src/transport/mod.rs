//! Physical transport layer for display connections.
//!
//! This module handles the low-level channels a display can be reached
//! over: serial ports, raw USB interfaces, Bluetooth RFCOMM links and HID
//! report channels. Each is an [`Endpoint`]; a [`TransportHandle`] wraps one
//! open endpoint with the read/write semantics the session relies on, with no
//! protocol knowledge.

pub mod bluetooth;
pub mod hid;
pub mod serial;
pub mod stream;
pub mod usb;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, TransportError};
use crate::tracing::prelude::*;

pub use bluetooth::BluetoothSettings;
pub use hid::HidSettings;
pub use serial::SerialSettings;
pub use stream::StreamEndpoint;
pub use usb::UsbSettings;

/// Bound on a single write, so a stalled link cannot hang the session.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbRequestType {
    Vendor,
    Class,
}

/// Out-of-band request on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Control transfer from the device, addressed to the claimed interface.
    UsbIn {
        kind: UsbRequestType,
        request: u8,
        value: u16,
        length: u16,
    },
    /// Control transfer to the device, addressed to the claimed interface.
    UsbOut {
        kind: UsbRequestType,
        request: u8,
        value: u16,
        data: Vec<u8>,
    },
    GetFeature {
        report_id: u8,
        length: usize,
    },
    SetFeature {
        report_id: u8,
        data: Vec<u8>,
    },
}

/// One open channel.
///
/// Implementations only move bytes. Error latching, cancellation and the
/// read timing rules live in [`TransportHandle`].
#[async_trait]
pub trait Endpoint: Send {
    fn describe(&self) -> String;

    /// Read whatever is available, waiting at most `timeout` for something
    /// to arrive. Returns 0 if nothing did.
    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    async fn control(&mut self, _request: &ControlRequest) -> io::Result<Vec<u8>> {
        Err(io::ErrorKind::Unsupported.into())
    }

    async fn close(&mut self) -> io::Result<()>;
}

/// Which channel to open, chosen once at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportDescriptor {
    Serial(SerialSettings),
    Usb(UsbSettings),
    Bluetooth(BluetoothSettings),
    Hid(HidSettings),
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDescriptor::Serial(s) => write!(f, "serial:{}", s.path),
            TransportDescriptor::Usb(u) => write!(f, "usb:{:04x}:{:04x}", u.vendor_id, u.product_id),
            TransportDescriptor::Bluetooth(b) => write!(f, "bluetooth:{}@{}", b.address, b.channel),
            TransportDescriptor::Hid(h) => write!(f, "hid:{:04x}:{:04x}", h.vendor_id, h.product_id),
        }
    }
}

fn parse_ids(rest: &str, identifier: &str) -> Result<(u16, u16, Option<String>), Error> {
    let bad = || Error::Config(format!("expected VID:PID[:SERIAL] in {identifier:?}"));
    let mut parts = rest.splitn(3, ':');
    let vid = parts.next().ok_or_else(bad)?;
    let pid = parts.next().ok_or_else(bad)?;
    let serial = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let vid = u16::from_str_radix(vid, 16).map_err(|_| bad())?;
    let pid = u16::from_str_radix(pid, 16).map_err(|_| bad())?;
    Ok((vid, pid, serial))
}

impl FromStr for TransportDescriptor {
    type Err = Error;

    /// Parse `serial:PATH[@BAUD]`, `usb:VID:PID[:SERIAL]`,
    /// `bluetooth:ADDRESS[@CHANNEL]`, `hid:VID:PID[:SERIAL]`, or a bare
    /// device path.
    fn from_str(identifier: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match identifier.split_once(':') {
            Some((scheme, rest)) if !identifier.starts_with('/') => (scheme, rest),
            _ => ("serial", identifier),
        };

        match scheme {
            "serial" => {
                let (path, baud) = match rest.rsplit_once('@') {
                    Some((path, baud)) => {
                        let baud = baud.parse().map_err(|_| {
                            Error::Config(format!("bad baud rate in {identifier:?}"))
                        })?;
                        (path, baud)
                    }
                    None => (rest, serial::DEFAULT_BAUD),
                };
                if path.is_empty() {
                    return Err(Error::Config(format!("missing path in {identifier:?}")));
                }
                Ok(TransportDescriptor::Serial(SerialSettings {
                    baud,
                    ..SerialSettings::new(path)
                }))
            }
            "usb" => {
                let (vid, pid, serial) = parse_ids(rest, identifier)?;
                Ok(TransportDescriptor::Usb(UsbSettings {
                    serial,
                    ..UsbSettings::new(vid, pid)
                }))
            }
            "hid" => {
                let (vid, pid, serial) = parse_ids(rest, identifier)?;
                Ok(TransportDescriptor::Hid(HidSettings {
                    serial,
                    ..HidSettings::new(vid, pid)
                }))
            }
            "bluetooth" | "bt" => {
                let (address, channel) = match rest.split_once('@') {
                    Some((address, channel)) => {
                        let channel = channel.parse().map_err(|_| {
                            Error::Config(format!("bad RFCOMM channel in {identifier:?}"))
                        })?;
                        (address, channel)
                    }
                    None => (rest, 1),
                };
                if !bluetooth::is_valid_address(address) {
                    return Err(Error::Config(format!("bad Bluetooth address in {identifier:?}")));
                }
                Ok(TransportDescriptor::Bluetooth(BluetoothSettings::new(
                    address, channel,
                )))
            }
            other => Err(Error::Config(format!("unknown transport {other:?}"))),
        }
    }
}

/// Open the channel named by `descriptor`.
pub async fn open(descriptor: &TransportDescriptor) -> Result<TransportHandle, TransportError> {
    let endpoint = match descriptor {
        TransportDescriptor::Serial(settings) => serial::open(settings)?,
        TransportDescriptor::Usb(settings) => usb::open(settings)?,
        TransportDescriptor::Bluetooth(settings) => bluetooth::open(settings)?,
        TransportDescriptor::Hid(settings) => hid::open(settings)?,
    };
    info!(transport = %descriptor, "Transport open");
    Ok(TransportHandle::new(endpoint))
}

/// An open channel, owned by exactly one session.
///
/// The first hard I/O error is latched: every later call returns it without
/// touching the hardware. After [`close`](Self::close), or after the token
/// from [`close_token`](Self::close_token) is cancelled, every call fails with
/// `Io("transport closed")`, including awaits already in progress.
pub struct TransportHandle {
    endpoint: Box<dyn Endpoint>,
    readahead: BytesMut,
    failure: Option<TransportError>,
    closed: CancellationToken,
    released: bool,
    write_timeout: Duration,
}

fn closed_error() -> TransportError {
    TransportError::Io("transport closed".into())
}

impl TransportHandle {
    pub fn new(endpoint: Box<dyn Endpoint>) -> Self {
        Self {
            endpoint,
            readahead: BytesMut::new(),
            failure: None,
            closed: CancellationToken::new(),
            released: false,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn describe(&self) -> String {
        self.endpoint.describe()
    }

    /// Cancelling this token closes the handle from another task.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn check(&mut self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() && self.failure.is_none() {
            self.failure = Some(closed_error());
        }
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        if err.is_fatal() && self.failure.is_none() {
            warn!(transport = %self.endpoint.describe(), error = %err, "Transport failed");
            self.failure = Some(err.clone());
        }
        err
    }

    async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError> {
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            r = self.endpoint.read_chunk(buf, wait) => r.map_err(TransportError::from),
        };
        result.map_err(|e| self.fail(e))
    }

    fn take_readahead(&mut self, buf: &mut [u8]) -> usize {
        let n = self.readahead.len().min(buf.len());
        buf[..n].copy_from_slice(&self.readahead[..n]);
        self.readahead.advance(n);
        n
    }

    /// Read into `buf`.
    ///
    /// Waits up to `initial` for the first byte, then up to `subsequent`
    /// for each following chunk; the wait is re-armed after every partial
    /// read. Stops when `buf` is full or the link goes quiet.
    pub async fn read(
        &mut self,
        buf: &mut [u8],
        initial: Duration,
        subsequent: Duration,
    ) -> Result<usize, TransportError> {
        self.check()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut filled = self.take_readahead(buf);
        let mut wait = if filled == 0 { initial } else { subsequent };
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..], wait).await?;
            if n == 0 {
                break;
            }
            filled += n;
            wait = subsequent;
        }

        if filled == 0 {
            return Err(TransportError::Timeout);
        }
        Ok(filled)
    }

    /// Write all of `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.check()?;
        trace!(tx = %hex::encode(data), "Write");

        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            r = time::timeout(self.write_timeout, self.endpoint.write_all(data)) => match r {
                Ok(r) => r.map_err(TransportError::from),
                Err(_) => Err(TransportError::Io("write timed out".into())),
            },
        };
        result.map_err(|e| self.fail(e))?;
        Ok(data.len())
    }

    /// Wait until input is available, without consuming it.
    pub async fn await_readable(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        self.check()?;
        if !self.readahead.is_empty() {
            return Ok(true);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = self.read_some(&mut chunk, timeout).await?;
        self.readahead.extend_from_slice(&chunk[..n]);
        Ok(n > 0)
    }

    pub async fn control(&mut self, request: &ControlRequest) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            r = self.endpoint.control(request) => r.map_err(TransportError::from),
        };
        result.map_err(|e| self.fail(e))
    }

    /// Close the channel. Idempotent.
    ///
    /// The endpoint is released here even when the token was cancelled
    /// first from another task.
    pub async fn close(&mut self) {
        self.closed.cancel();
        self.failure = Some(closed_error());
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.endpoint.close().await {
            debug!(transport = %self.endpoint.describe(), error = %e, "Error closing transport");
        }
        debug!(transport = %self.endpoint.describe(), "Transport closed");
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("endpoint", &self.endpoint.describe())
            .field("failure", &self.failure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair() -> (TransportHandle, DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        (
            TransportHandle::new(Box::new(StreamEndpoint::new(near, "duplex"))),
            far,
        )
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test_case("serial:/dev/ttyUSB0", "serial:/dev/ttyUSB0" ; "serial")]
    #[test_case("/dev/ttyS0", "serial:/dev/ttyS0" ; "bare path")]
    #[test_case("usb:1209:abcd", "usb:1209:abcd" ; "usb")]
    #[test_case("hid:1209:ABCD:XYZ", "hid:1209:abcd" ; "hid with serial")]
    #[test_case("bluetooth:00:11:22:33:44:55@3", "bluetooth:00:11:22:33:44:55@3" ; "bluetooth")]
    #[test_case("bt:00:11:22:33:44:55", "bluetooth:00:11:22:33:44:55@1" ; "bluetooth default channel")]
    fn test_parse_descriptor(identifier: &str, display: &str) {
        let descriptor: TransportDescriptor = identifier.parse().unwrap();
        assert_eq!(descriptor.to_string(), display);
    }

    #[test]
    fn test_parse_details() {
        let TransportDescriptor::Serial(s) = "serial:/dev/ttyACM0@19200".parse().unwrap() else {
            panic!("expected serial");
        };
        assert_eq!((s.path.as_str(), s.baud), ("/dev/ttyACM0", 19200));

        let TransportDescriptor::Usb(u) = "usb:1209:abcd:SN42".parse().unwrap() else {
            panic!("expected usb");
        };
        assert_eq!(u.serial.as_deref(), Some("SN42"));
    }

    #[test_case("usb:zz:abcd" ; "bad vid")]
    #[test_case("usb:1209" ; "missing pid")]
    #[test_case("bluetooth:00:11@1" ; "bad address")]
    #[test_case("carrier-pigeon:1" ; "unknown scheme")]
    #[test_case("serial:" ; "empty path")]
    fn test_parse_rejects(identifier: &str) {
        assert!(matches!(
            identifier.parse::<TransportDescriptor>(),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_without_data() {
        let (mut handle, _far) = pair();
        let mut buf = [0u8; 8];
        let started = time::Instant::now();
        let err = handle.read(&mut buf, ms(300), ms(20)).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert!(started.elapsed() >= ms(300));

        // A timeout does not kill the handle.
        handle.write(b"ok").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_rearms_between_chunks() {
        let (mut handle, mut far) = pair();
        let writer = tokio::spawn(async move {
            far.write_all(&[1, 2]).await.unwrap();
            time::sleep(ms(15)).await;
            far.write_all(&[3]).await.unwrap();
            time::sleep(ms(15)).await;
            far.write_all(&[4]).await.unwrap();
            time::sleep(ms(50)).await;
            far.write_all(&[5]).await.unwrap();
            far
        });

        let mut buf = [0u8; 8];
        let n = handle.read(&mut buf, ms(100), ms(20)).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);

        let n = handle.read(&mut buf, ms(100), ms(20)).await.unwrap();
        assert_eq!(&buf[..n], &[5]);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_stops_when_full() {
        let (mut handle, mut far) = pair();
        far.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(handle.read(&mut buf, ms(10), ms(10)).await.unwrap(), 3);
        assert_eq!(handle.read(&mut buf, ms(10), ms(10)).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_readable_does_not_consume() {
        let (mut handle, mut far) = pair();
        assert!(!handle.await_readable(ms(10)).await.unwrap());

        far.write_all(&[7, 8]).await.unwrap();
        assert!(handle.await_readable(ms(10)).await.unwrap());
        assert!(handle.await_readable(ms(10)).await.unwrap());

        let mut buf = [0u8; 4];
        let n = handle.read(&mut buf, ms(10), ms(10)).await.unwrap();
        assert_eq!(&buf[..n], &[7, 8]);
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let (mut handle, mut far) = pair();
        assert_eq!(handle.write(&[0x02, 0x49, 0x03]).await.unwrap(), 3);
        let mut buf = [0u8; 3];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x02, 0x49, 0x03]);
    }

    #[tokio::test]
    async fn test_closed_handle_fails_everything() {
        let (mut handle, _far) = pair();
        handle.close().await;
        handle.close().await;

        let closed = closed_error();
        let mut buf = [0u8; 1];
        assert_eq!(handle.read(&mut buf, ms(10), ms(10)).await, Err(closed.clone()));
        assert_eq!(handle.write(&[1]).await, Err(closed.clone()));
        assert_eq!(
            handle
                .control(&ControlRequest::GetFeature { report_id: 1, length: 1 })
                .await,
            Err(closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_token_interrupts_read() {
        let (mut handle, _far) = pair();
        let token = handle.close_token();
        tokio::spawn(async move {
            time::sleep(ms(50)).await;
            token.cancel();
        });

        let mut buf = [0u8; 1];
        let err = handle.read(&mut buf, Duration::from_secs(10), ms(10)).await.unwrap_err();
        assert_eq!(err, closed_error());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_close_after_token_releases_endpoint() {
        let (mut handle, mut far) = pair();
        handle.close_token().cancel();
        let mut buf = [0u8; 1];
        assert_eq!(handle.read(&mut buf, ms(10), ms(10)).await, Err(closed_error()));

        handle.close().await;
        let mut rest = Vec::new();
        assert_eq!(far.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hard_error_is_latched() {
        let (mut handle, far) = pair();
        drop(far);

        let mut buf = [0u8; 1];
        let first = handle.read(&mut buf, ms(10), ms(10)).await.unwrap_err();
        assert!(first.is_fatal());
        assert_eq!(handle.write(&[1]).await, Err(first));
    }

    #[tokio::test]
    async fn test_control_unsupported_on_streams() {
        let (mut handle, _far) = pair();
        let request = ControlRequest::GetFeature { report_id: 1, length: 4 };
        assert_eq!(handle.control(&request).await, Err(TransportError::Unsupported));
        // Not latched.
        handle.write(&[1]).await.unwrap();
    }
}
