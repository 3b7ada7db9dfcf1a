use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::BrokerAddress;

/// A bidirectional byte stream the connection can run STOMP over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the byte stream for each connection attempt.
///
/// The connection manager calls `open` once for the initial connect and
/// again for every reconnect attempt. Implementations own socket and TLS
/// concerns; the core only reads and writes the returned stream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, address: &BrokerAddress) -> io::Result<BoxedStream>;
}

/// Plain TCP transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, address: &BrokerAddress) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
