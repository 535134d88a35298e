//! Error types for the meshlink library.

use thiserror::Error;

/// The main error type for meshlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Bluetooth stack error.
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Protobuf envelope could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Invalid endpoint or tuning configuration.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Protocol error (malformed or unexpected content).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Operation timed out.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Connection was torn down; carries the recorded cause.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// The GATT server lacks the mesh service.
    #[error("missing service {uuid}")]
    MissingService { uuid: uuid::Uuid },

    /// The mesh service lacks a required characteristic.
    #[error("missing characteristic {uuid}")]
    MissingCharacteristic { uuid: uuid::Uuid },

    /// A write did not consume the whole payload.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

/// Frame-specific errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame payload exceeds maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Frame declared or carried no payload.
    #[error("zero-length frame")]
    Empty,

    /// Byte source ended before a complete frame was available.
    #[error("incomplete frame: expected {expected} bytes, got {got}")]
    Incomplete { expected: usize, got: usize },
}

/// Error categories used to decide retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad endpoint or settings; never retried.
    Configuration,
    /// Retried within the same attempt.
    Transient,
    /// Ends the attempt and schedules a reconnect.
    ConnectionFatal,
    /// A single frame is skipped; the stream stays open.
    Decode,
    /// Platform noise that is logged and ignored.
    Benign,
    /// Caller-requested stop.
    Cancelled,
}

impl Error {
    /// Builds a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Builds a closed-connection error.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Builds a timeout error from a duration.
    #[must_use]
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Classifies this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Configuration,
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::Interrupted => ErrorKind::Transient,
                _ => ErrorKind::ConnectionFatal,
            },
            Self::Frame(_) | Self::Decode(_) | Self::Protocol { .. } => ErrorKind::Decode,
            Self::Bluetooth(e) => {
                match crate::transport::ble::classify_platform_error(&e.to_string()) {
                    crate::transport::ble::PlatformErrorClass::Benign => ErrorKind::Benign,
                    _ => ErrorKind::ConnectionFatal,
                }
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Serial(_)
            | Self::NotConnected
            | Self::ConnectionClosed { .. }
            | Self::MissingService { .. }
            | Self::MissingCharacteristic { .. }
            | Self::ShortWrite { .. } => ErrorKind::ConnectionFatal,
        }
    }

    /// Returns true if the error should be retried within the same attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result type alias for meshlink operations.
pub type Result<T> = std::result::Result<T, Error>;
