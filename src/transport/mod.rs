//! Transport layer for mesh radio communication.
//!
//! This module provides the abstraction over the three physical links:
//! - USB/Serial and TCP carry length-prefixed frames over a byte stream
//! - Bluetooth LE carries one envelope per characteristic read/write
//!
//! All methods take `&self` so a connected transport can be shared as
//! `Arc<dyn Transport>` between one reader and one writer.

pub mod ble;
pub mod serial;
pub mod stream;
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Connects to the device. A no-op if already connected.
    fn connect<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<()>>;

    /// Closes the link and releases the device. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Reads one envelope payload (frame header already stripped).
    fn read_frame<'a>(&'a self, cancel: &'a CancelToken) -> BoxFuture<'a, Result<Bytes>>;

    /// Writes one envelope payload as a single frame.
    fn write_frame<'a>(&'a self, cancel: &'a CancelToken, payload: Bytes)
    -> BoxFuture<'a, Result<()>>;

    /// Human-readable target (port path, `host:port` or MAC address).
    fn status_target(&self) -> String;

    /// Returns true while the link is believed to be up.
    fn is_connected(&self) -> bool;
}

/// A device endpoint, one per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// USB serial port.
    Serial { port: String, baud: u32 },
    /// TCP host and port.
    Ip { host: String, port: u16 },
    /// Bluetooth LE MAC address, optionally on a specific adapter.
    Bluetooth {
        address: String,
        adapter_id: Option<String>,
    },
}

impl Endpoint {
    /// Serial endpoint at the default baud rate.
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::Serial {
            port: port.into(),
            baud: serial::DEFAULT_BAUD_RATE,
        }
    }

    /// TCP endpoint on the default device port.
    #[must_use]
    pub fn ip(host: impl Into<String>) -> Self {
        Self::Ip {
            host: host.into(),
            port: tcp::DEFAULT_PORT,
        }
    }

    /// Bluetooth endpoint on the first adapter.
    #[must_use]
    pub fn bluetooth(address: impl Into<String>) -> Self {
        Self::Bluetooth {
            address: address.into(),
            adapter_id: None,
        }
    }

    /// Checks the endpoint before any I/O is attempted.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Serial { port, baud } => {
                if port.trim().is_empty() {
                    return Err(Error::config("serial port is empty"));
                }
                if *baud == 0 {
                    return Err(Error::config("baud rate must be non-zero"));
                }
            }
            Self::Ip { host, port } => {
                if host.trim().is_empty() {
                    return Err(Error::config("host is empty"));
                }
                if *port == 0 {
                    return Err(Error::config("TCP port must be non-zero"));
                }
            }
            Self::Bluetooth { address, .. } => {
                ble::normalize_address(address)?;
            }
        }
        Ok(())
    }

    /// Builds the transport for this endpoint with default tuning.
    pub fn open(&self) -> Result<Arc<dyn Transport>> {
        self.validate()?;
        Ok(match self {
            Self::Serial { port, baud } => Arc::new(serial::SerialTransport::new(
                serial::SerialConfig::new(port.clone()).baud_rate(*baud),
            )),
            Self::Ip { host, port } => Arc::new(tcp::TcpTransport::new(
                tcp::TcpConfig::new(host.clone()).port(*port),
            )),
            Self::Bluetooth {
                address,
                adapter_id,
            } => {
                let mut config = ble::BleConfig::new(address.clone());
                if let Some(id) = adapter_id {
                    config = config.adapter_id(id.clone());
                }
                Arc::new(ble::BleTransport::new(config)?)
            }
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { port, baud } => write!(f, "serial {port} @ {baud}"),
            Self::Ip { host, port } => write!(f, "tcp {host}:{port}"),
            Self::Bluetooth { address, .. } => write!(f, "ble {address}"),
        }
    }
}

pub use ble::BleTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
