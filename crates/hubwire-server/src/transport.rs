//! Byte transport seam between the dispatch engine and the network.
//!
//! The engine only needs ordered, reliable delivery of byte chunks in both
//! directions plus a close notification. The WebSocket listener implements
//! these traits over an upgraded socket; [`split_stream`] implements them over
//! any `AsyncRead + AsyncWrite` stream (TCP, Unix sockets, in-memory duplex).

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

const READ_CHUNK: usize = 8 * 1024;

/// Inbound half of a transport.
pub trait TransportReader: Send {
    /// Returns the next chunk of bytes, or `None` once the peer has closed.
    ///
    /// Must be cancel safe: dropping the future loses no data.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;
}

/// Outbound half of a transport.
pub trait TransportWriter: Send + 'static {
    /// Writes one encoded frame.
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send;

    /// Shuts the outbound direction.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Message-oriented transports switch to binary messages once a binary
    /// protocol has been negotiated.
    fn set_binary(&mut self, _binary: bool) {}
}

/// [`TransportReader`] over an async byte stream.
pub struct StreamReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; READ_CHUNK],
        }
    }
}

impl<R: AsyncRead + Unpin + Send> TransportReader for StreamReader<R> {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }
}

/// [`TransportWriter`] over an async byte stream.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> TransportWriter for StreamWriter<W> {
    async fn send(&mut self, frame: Vec<u8>) -> io::Result<()> {
        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Splits a bidirectional stream into transport halves.
pub fn split_stream<S>(stream: S) -> (StreamReader<ReadHalf<S>>, StreamWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (StreamReader::new(read), StreamWriter::new(write))
}
