//! TCP transport implementation.
//!
//! Network-attached radios expose the same framed stream as USB on a TCP
//! port. Reads block until a frame arrives or the caller's deadline passes.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::transport::stream::FramedLink;
use crate::transport::{BoxFuture, Transport};

/// Default device API port.
pub const DEFAULT_PORT: u16 = 4403;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Upper bound on the TCP handshake.
    pub connect_timeout: Duration,
}

impl TcpConfig {
    /// Creates a configuration for `host` on the default port.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// TCP transport for network-attached radios.
pub struct TcpTransport {
    config: TcpConfig,
    lifecycle: Mutex<()>,
    link: FramedLink<OwnedReadHalf, OwnedWriteHalf>,
}

impl TcpTransport {
    /// Creates a new TCP transport.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            lifecycle: Mutex::new(()),
            link: FramedLink::new(None),
        }
    }

    async fn dial(&self) -> Result<()> {
        let target = self.status_target();
        tracing::info!("connecting to {}", target);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        .map_err(|_| Error::timeout(self.config.connect_timeout))??;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        self.link.attach(reader, writer).await;
        tracing::info!("connected to {}", target);
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            if self.link.is_connected() {
                return Ok(());
            }
            cancel.run(self.dial()).await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            if self.link.detach().await {
                tracing::info!("disconnected from {}", self.status_target());
            }
            Ok(())
        })
    }

    fn read_frame<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(self.link.read_frame(cancel))
    }

    fn write_frame<'a>(
        &'a self,
        cancel: &'a CancelToken,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.link.write_frame(cancel, &payload).await })
    }

    fn status_target(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::encode_frame;

    async fn local_pair() -> (TcpTransport, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = TcpTransport::new(TcpConfig::new("127.0.0.1").port(port));
        (transport, listener)
    }

    #[test]
    fn test_tcp_config_defaults() {
        let config = TcpConfig::new("radio.local");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let (transport, listener) = local_pair().await;
        let cancel = CancelToken::new().with_timeout(Duration::from_secs(2));

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 4];
            socket.read_exact(&mut header).await.unwrap();
            let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();
            socket.write_all(&encode_frame(&body).unwrap()).await.unwrap();
            socket
        });

        transport.connect(&cancel).await.unwrap();
        assert!(transport.is_connected());
        transport
            .write_frame(&cancel, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let echoed = transport.read_frame(&cancel).await.unwrap();
        assert_eq!(&echoed[..], b"ping");

        drop(device.await.unwrap());
        let err = transport.read_frame(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (transport, listener) = local_pair().await;
        drop(listener);
        let cancel = CancelToken::new().with_timeout(Duration::from_secs(2));
        assert!(transport.connect(&cancel).await.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, listener) = local_pair().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        transport.connect(&CancelToken::new()).await.unwrap();
        let _socket = accept.await.unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }
}
