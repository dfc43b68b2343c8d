//! Data transport seam

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{Result, StreamError};

/// Byte stream carrying DataStream frames.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens data connections to an instrument
///
/// The session calls [`Connector::connect`] for the initial connection and again for
/// every reconnect. Each call must produce a fresh transport.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Transport>;

    /// Human-readable peer description for logs and errors
    fn describe(&self) -> String;
}

/// TCP connector for real instruments.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    type Transport = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        debug!(addr = %self.addr, "Opening DataStream connection");
        let stream = TcpStream::connect(self.addr).await.map_err(|e| {
            StreamError::connect_failed_with_source(self.addr.to_string(), Box::new(e))
        })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connector = TcpConnector::new(listener.local_addr().unwrap());
        assert!(connector.describe().starts_with("tcp://127.0.0.1:"));

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"OXYGEN<<").await.unwrap();
        });

        let mut stream = connector.connect().await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OXYGEN<<");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnector::new(addr).connect().await;
        assert!(matches!(result, Err(StreamError::Connect { .. })));
    }
}
