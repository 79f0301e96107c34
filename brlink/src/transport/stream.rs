//! Endpoint over any async byte stream.
//!
//! Serial ports and RFCOMM TTYs are both plain byte streams once opened, so
//! they share this implementation. Tests use it over `tokio::io::duplex`.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use super::Endpoint;

pub struct StreamEndpoint<S> {
    stream: S,
    label: String,
}

impl<S> StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream,
            label: label.into(),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Endpoint for StreamEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        match time::timeout(timeout, self.stream.read(buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(0)) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed by peer", self.label),
            )),
            Ok(result) => result,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
