//! Framed byte-stream link shared by the serial and TCP transports.
//!
//! The read half owns a [`FrameDecoder`] so partial frames survive read
//! timeouts; the write half encodes each payload into one frame. Each half
//! sits behind its own async mutex so one reader and one writer can run
//! concurrently.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::protocol::{FrameDecoder, encode_frame};

/// Bytes requested per read call.
const READ_CHUNK: usize = 1024;

struct FramedReader<R> {
    half: R,
    decoder: FrameDecoder,
}

/// A connected pair of stream halves with frame codec state.
pub struct FramedLink<R, W> {
    reader: Mutex<Option<FramedReader<R>>>,
    writer: Mutex<Option<W>>,
    connected: AtomicBool,
    read_slice: Option<Duration>,
}

impl<R, W> FramedLink<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a detached link.
    ///
    /// With `read_slice` set, each underlying read gives up after that long
    /// and is retried, so a read never blocks past one slice.
    #[must_use]
    pub fn new(read_slice: Option<Duration>) -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            read_slice,
        }
    }

    /// Installs freshly opened halves and resets the decoder.
    pub async fn attach(&self, reader: R, writer: W) {
        *self.reader.lock().await = Some(FramedReader {
            half: reader,
            decoder: FrameDecoder::new(),
        });
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::Release);
    }

    /// Drops both halves. Returns true if the link was attached.
    pub async fn detach(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if let Some(mut writer) = self.writer.lock().await.take() {
            // routinely fails once the peer is gone
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("writer shutdown failed: {}", e);
            }
        }
        self.reader.lock().await.take();
        was_connected
    }

    /// Returns true while attached and no fatal error was seen.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Reads the next complete frame payload.
    pub async fn read_frame(&self, cancel: &CancelToken) -> Result<Bytes> {
        cancel
            .run(async {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    let mut guard = self.reader.lock().await;
                    let reader = guard.as_mut().ok_or(Error::NotConnected)?;

                    if let Some(frame) = next_frame(&mut reader.decoder) {
                        return Ok(frame);
                    }

                    let read = match self.read_slice {
                        Some(slice) => {
                            match tokio::time::timeout(slice, reader.half.read(&mut buf)).await {
                                Ok(read) => read,
                                // Nothing arrived this slice; release the lock and retry
                                Err(_) => continue,
                            }
                        }
                        None => reader.half.read(&mut buf).await,
                    };

                    match read {
                        Ok(0) => {
                            tracing::debug!("stream reached end of file");
                            *guard = None;
                            self.connected.store(false, Ordering::Release);
                            return Err(Error::closed("end of stream"));
                        }
                        Ok(n) => {
                            tracing::trace!("received {} bytes: {}", n, hex::encode(&buf[..n]));
                            reader.decoder.feed(&buf[..n]);
                        }
                        Err(e) if is_retryable(&e) => {}
                        Err(e) => {
                            tracing::error!("stream read error: {}", e);
                            *guard = None;
                            self.connected.store(false, Ordering::Release);
                            return Err(Error::Io(e));
                        }
                    }
                }
            })
            .await
    }

    /// Encodes `payload` into one frame and writes it.
    ///
    /// A failed or interrupted write leaves the stream mid-frame, so the
    /// link is marked down.
    pub async fn write_frame(&self, cancel: &CancelToken, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            return Err(Error::NotConnected);
        }

        let result = cancel
            .run(async {
                let writer = guard.as_mut().ok_or(Error::NotConnected)?;
                tracing::trace!("sending frame: {} bytes", frame.len());
                writer.write_all(&frame).await?;
                writer.flush().await?;
                Ok(())
            })
            .await;

        if let Err(e) = &result {
            tracing::warn!("frame write failed: {}", e);
            *guard = None;
            self.connected.store(false, Ordering::Release);
        }
        result
    }
}

/// Pops the next decodable frame, skipping malformed ones.
fn next_frame(decoder: &mut FrameDecoder) -> Option<Bytes> {
    loop {
        match decoder.decode() {
            Ok(Some(frame)) => {
                tracing::trace!("decoded frame: {} bytes", frame.len());
                return Some(frame);
            }
            Ok(None) => return None,
            Err(e) => {
                // The decoder has already advanced past the bad header
                tracing::warn!("frame decode error: {}", e);
            }
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
