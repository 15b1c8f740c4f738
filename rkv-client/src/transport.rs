//! # Transport Plumbing
//!
//! Purpose: Describe where connections go (`Endpoint`) and how byte streams
//! are opened (`Connector`), so the pool never depends on TCP directly.
//!
//! ## Design Principles
//! 1. **Factory Seam**: The pool asks a `Connector` for streams; tests plug in
//!    in-process duplex pipes.
//! 2. **Type Erasure**: Streams are boxed once at creation; everything above
//!    works on `BoxedStream`.

use std::fmt;
use std::io;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{ClientError, ClientResult};

/// Byte stream usable as an RPC transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Backend server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`.
    pub fn parse(raw: &str) -> ClientResult<Self> {
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| ClientError::config(format!("server address {raw:?} is missing a port")))?;
        if host.is_empty() {
            return Err(ClientError::config(format!("server address {raw:?} is missing a host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClientError::config(format!("server address {raw:?} has an invalid port")))?;
        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens transport streams to endpoints.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Plain TCP connector with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            // Small request frames; latency matters more than packet count.
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
