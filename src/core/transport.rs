//! Byte-oriented duplex links to nodes
//!
//! A [`Link`] moves whole encoded frames. How it gets them there is up to the
//! [`Transport`]; [`TcpTransport`] is the production one, tests plug in
//! in-memory streams through [`Link::from_stream`].

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ConnectError;
use crate::protocol::frame::{read_length_prefixed, write_length_prefixed};

/// Receiving half of a link
#[async_trait]
pub trait LinkReader: Send {
    /// Next complete frame; an error means the link is unusable
    async fn read(&mut self) -> io::Result<Bytes>;
}

/// Sending half of a link
#[async_trait]
pub trait LinkWriter: Send {
    async fn write(&mut self, frame: Bytes) -> io::Result<()>;

    async fn shutdown(&mut self) -> io::Result<()>;
}

/// An open link, already split so reads and writes never wait on each other
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

impl Link {
    pub fn new(reader: Box<dyn LinkReader>, writer: Box<dyn LinkWriter>) -> Self {
        Self { reader, writer }
    }

    /// Frame any byte stream with length prefixes
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Box::new(StreamReader {
                inner: read_half,
                buf: BytesMut::with_capacity(8192),
            }),
            writer: Box::new(StreamWriter {
                inner: write_half,
                buf: BytesMut::with_capacity(8192),
            }),
        }
    }
}

/// Opens links to node addresses
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, addr: &str) -> Result<Link, ConnectError>;
}

struct StreamReader<S> {
    inner: ReadHalf<S>,
    buf: BytesMut,
}

#[async_trait]
impl<S> LinkReader for StreamReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(frame) = read_length_prefixed(&mut self.buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            {
                return Ok(frame);
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "link closed by peer",
                ));
            }
        }
    }
}

struct StreamWriter<S> {
    inner: WriteHalf<S>,
    buf: BytesMut,
}

#[async_trait]
impl<S> LinkWriter for StreamWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write(&mut self, frame: Bytes) -> io::Result<()> {
        self.buf.clear();
        write_length_prefixed(&mut self.buf, &frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// TCP transport with a bounded connect time
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Configure stream for low latency request/response traffic
    fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        // Detect half-open links between probes
        socket2::SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, addr: &str) -> Result<Link, ConnectError> {
        debug!("Connecting to node {}", addr);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Network error connecting to node {}: {}", addr, e);
                return Err(ConnectError::Unreachable {
                    addr: addr.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                debug!("Timeout connecting to node {}", addr);
                return Err(ConnectError::Timeout {
                    addr: addr.to_string(),
                });
            }
        };

        if let Err(e) = self.configure_stream(&stream) {
            warn!("Failed to configure stream to {}: {}", addr, e);
        }

        Ok(Link::from_stream(stream))
    }
}
