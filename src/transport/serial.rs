//! Serial/USB transport implementation.
//!
//! This module provides serial port communication for radios connected via
//! USB. Frames use the length-prefixed stream codec.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::transport::stream::FramedLink;
use crate::transport::{BoxFuture, Transport};

/// Default baud rate for USB-attached radios.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default delay between opening the port and draining it.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(300);

/// Default window for discarding stale bytes after open.
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Default timeout for a single read call.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Delay after opening before the port is drained.
    pub connection_delay: Duration,
    /// How long to discard stale bytes after the delay.
    pub drain_window: Duration,
    /// Timeout for each underlying read.
    pub read_timeout: Duration,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
            drain_window: DEFAULT_DRAIN_WINDOW,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }

    /// Sets the stale-byte drain window.
    #[must_use]
    pub const fn drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Sets the per-read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Serial transport for mesh radios.
///
/// Uses split read/write halves to allow concurrent reading and writing.
pub struct SerialTransport {
    config: SerialConfig,
    lifecycle: Mutex<()>,
    link: FramedLink<ReadHalf<SerialStream>, WriteHalf<SerialStream>>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        let link = FramedLink::new(Some(config.read_timeout));
        Self {
            config,
            lifecycle: Mutex::new(()),
            link,
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    async fn open(&self) -> Result<()> {
        tracing::info!(
            "connecting to serial port: {} @ {}",
            self.config.port,
            self.config.baud_rate
        );

        let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .open_native_async()
            .map_err(Error::Serial)?;

        // Some USB bridges reset the radio while RTS is asserted
        if let Err(e) = tokio_serial::SerialPort::write_request_to_send(&mut stream, false) {
            tracing::warn!("failed to set RTS: {}", e);
        }

        tokio::time::sleep(self.config.connection_delay).await;

        // Discard boot chatter and any half-sent frame from a previous session
        let mut buf = [0u8; 1024];
        let mut total_drained = 0usize;
        let drain_deadline = tokio::time::Instant::now() + self.config.drain_window;
        while tokio::time::Instant::now() < drain_deadline {
            match tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => total_drained += n,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        if total_drained > 0 {
            tracing::debug!("drained {} stale bytes from buffer", total_drained);
        }

        let (reader, writer) = tokio::io::split(stream);
        self.link.attach(reader, writer).await;

        tracing::info!("connected to serial port {}", self.config.port);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn connect<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            if self.link.is_connected() {
                return Ok(());
            }
            let result = cancel.run(self.open()).await;
            if result.is_err() {
                self.link.detach().await;
            }
            result
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            if self.link.detach().await {
                tracing::info!("disconnected from serial port {}", self.config.port);
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
        self.config.port.clone()
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
