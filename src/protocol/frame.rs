//! Frame encoding and decoding for the serial and TCP links.
//!
//! The wire format uses a two-byte magic followed by a big-endian length:
//! ```text
//! ┌──────────┬──────────────┬─────────────────┐
//! │ 0x94 0xc3│  size (BE)   │    payload      │
//! │  2 bytes │   2 bytes    │   size bytes    │
//! └──────────┴──────────────┴─────────────────┘
//! ```
//!
//! Devices interleave debug console output with frames, so the decoder
//! discards bytes until the magic lines up.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Frame magic bytes.
pub const FRAME_HEADER: [u8; 2] = [0x94, 0xC3];

/// Maximum frame payload size (64KB - 1).
pub const MAX_FRAME_SIZE: usize = 65535;

/// Header size (magic + 2-byte length).
pub const HEADER_SIZE: usize = 4;

/// Encodes a payload into a framed message.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if the payload does not fit the length
/// field and [`FrameError::Empty`] for an empty payload.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        size: payload.len(),
        max: MAX_FRAME_SIZE,
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&FRAME_HEADER);
    buf.put_u16(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decodes the first frame found in a complete byte source.
///
/// Leading noise is skipped.
///
/// # Errors
///
/// Returns [`FrameError::Incomplete`] if the source ends before a full frame
/// and [`FrameError::Empty`] if the first frame declares no payload.
pub fn decode(source: &[u8]) -> Result<Bytes, FrameError> {
    let mut decoder = FrameDecoder::new();
    decoder.feed(source);
    match decoder.decode()? {
        Some(payload) => Ok(payload),
        None => Err(FrameError::Incomplete {
            expected: decoder.expected(),
            got: decoder.buffered(),
        }),
    }
}

/// Frame decoder that handles partial data and resynchronizes on noise.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(Some(payload))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Empty`] for a zero-length header. The header is
    /// consumed so the next call continues scanning after it.
    pub fn decode(&mut self) -> Result<Option<Bytes>, FrameError> {
        self.resync();

        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
        if length == 0 {
            self.buffer.advance(HEADER_SIZE);
            return Err(FrameError::Empty);
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Drops bytes until the buffer starts with the frame magic, or with a
    /// lone first magic byte that may be completed by the next read.
    fn resync(&mut self) {
        let mut skipped = 0usize;
        while !self.buffer.is_empty() {
            if self.buffer[0] == FRAME_HEADER[0]
                && (self.buffer.len() == 1 || self.buffer[1] == FRAME_HEADER[1])
            {
                break;
            }
            self.buffer.advance(1);
            skipped += 1;
        }
        if skipped > 0 {
            tracing::trace!("skipped {} noise bytes", skipped);
        }
    }

    /// Total bytes the pending frame needs, header included.
    fn expected(&self) -> usize {
        if self.buffer.len() < HEADER_SIZE {
            HEADER_SIZE
        } else {
            HEADER_SIZE + usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]))
        }
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
