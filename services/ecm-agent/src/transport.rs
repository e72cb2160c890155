//! Frame I/O over byte streams.
//!
//! Every link carries newline-delimited JSON frames (see
//! `ecm_messages::encode_frame`). A frame that fails to decode is reported
//! and the stream stays usable; I/O errors and oversize lines are fatal for
//! the connection.

use std::io;

use ecm_messages::{decode_frame, encode_frame, MessageError, MAX_FRAME_BYTES};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Errors that can occur on a framed connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The frame could not be decoded or encoded.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// A line exceeded the frame limit before its newline arrived.
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    /// The peer broke the session protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the connection can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Message(MessageError::Malformed(_)))
    }
}

/// Reads frames from a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Read the next frame. Returns `Ok(None)` at end of stream.
    ///
    /// Blank lines are skipped.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            self.line.clear();
            let limit = MAX_FRAME_BYTES as u64 + 1;
            let read = (&mut self.inner)
                .take(limit)
                .read_line(&mut self.line)
                .await?;

            if read == 0 {
                return Ok(None);
            }
            if !self.line.ends_with('\n') && read as u64 >= limit {
                return Err(TransportError::FrameTooLarge {
                    max: MAX_FRAME_BYTES,
                });
            }
            if self.line.trim().is_empty() {
                continue;
            }

            return decode_frame(&self.line).map(Some).map_err(Into::into);
        }
    }
}

/// Writes frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write one frame, flushing it.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let line = encode_frame(message)?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
