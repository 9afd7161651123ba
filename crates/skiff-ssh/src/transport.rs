//! Transport socket abstraction

use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens the duplex byte stream a session runs over
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `host:port`
    ///
    /// Implementations report a refused connection with
    /// [`io::ErrorKind::ConnectionRefused`]; the session treats that kind
    /// differently from every other failure.
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// Create a new TCP connector
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Enable or disable `TCP_NODELAY` on new streams
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        debug!("Opening TCP connection to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

/// Whether a transport error ends the current connect attempt immediately
pub fn is_refused(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionRefused
}
