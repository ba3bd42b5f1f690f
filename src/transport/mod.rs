//! Byte-stream transport seam
//!
//! The protocol engine is written against a boxed async byte stream so the
//! underlying transport (TCP, TLS, an in-memory pipe in tests) stays
//! pluggable. TLS and the physical network join are deliberately outside
//! this crate; a TLS deployment supplies its own [`Connector`].

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

mod session;

pub(crate) use session::{FrameReader, FrameWriter};
pub use session::Session;

/// Anything that can carry MQTT frames: suspending reads and writes that
/// fail explicitly.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Opens a fresh byte stream to the broker. Called once per connection
/// attempt by the reconnection supervisor.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> io::Result<Box<dyn ByteStream>>;
}

/// Plain TCP connector resolved from the broker URL.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> io::Result<Box<dyn ByteStream>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
