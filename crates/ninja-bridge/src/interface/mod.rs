//! Link to the NinjaCape hub
//!
//! The hub speaks newline-terminated JSON over a UART. This module provides
//! the line framer used by the serial ingest loop; the real serial port
//! lives in [`serial`] behind the `serial` feature.
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Debian (BeagleBone images)
//!   apt install libudev-dev pkg-config
//!   ```
//!
//! Anything implementing [`tokio::io::AsyncRead`] can stand in for the
//! port, which is how the tests drive the ingest loop with an in-memory
//! duplex stream.

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialLink;

use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

use crate::config::{DEFAULT_READ_TIMEOUT_MS, MAX_LINE_LENGTH};
use crate::error::{BridgeError, Result};

/// Buffer size for one read from the link
const READ_BUFFER_SIZE: usize = 256;

/// Newline framer over an async byte stream
pub struct HubReader<R> {
    /// Underlying stream
    reader: R,

    /// Bytes received but not yet returned as a line
    read_buffer: BytesMut,

    /// Bound on one read
    read_timeout: Duration,

    /// Longest accepted line
    max_line_length: usize,

    /// Name for logging
    name: String,
}

impl<R: AsyncRead + Unpin + Send> HubReader<R> {
    /// Wrap a stream
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE * 2),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            max_line_length: MAX_LINE_LENGTH,
            name: name.into(),
        }
    }

    /// Set the read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the maximum line length
    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Name of the link for logging
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the next line.
    ///
    /// Returns `Ok(None)` when the read timed out or only part of a line
    /// arrived, so callers get a chance to check for shutdown. The returned
    /// line has its terminator stripped and may be empty.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        if let Some(line) = self.try_parse_line()? {
            return Ok(Some(line));
        }

        let mut buf = [0u8; READ_BUFFER_SIZE];
        match tokio::time::timeout(self.read_timeout, self.reader.read(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(BridgeError::Disconnected),
            Ok(Ok(n)) => {
                trace!(link = %self.name, bytes = n, "Read from hub");
                self.read_buffer.extend_from_slice(&buf[..n]);
                self.try_parse_line()
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(None)
            }
            Ok(Err(e)) => Err(BridgeError::ReadError(e.to_string())),
        }
    }

    /// Try to split one complete line off the read buffer
    fn try_parse_line(&mut self) -> Result<Option<Bytes>> {
        match self.read_buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = self.read_buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Ok(Some(line.freeze()))
            }
            None if self.read_buffer.len() > self.max_line_length => {
                let size = self.read_buffer.len();
                warn!(link = %self.name, size, "Discarding overlong line");
                self.read_buffer.advance(size);
                Err(BridgeError::FrameTooLarge {
                    size,
                    max: self.max_line_length,
                })
            }
            None => Ok(None),
        }
    }

    /// Bytes waiting for a terminator
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }
}

impl<R> std::fmt::Debug for HubReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubReader")
            .field("name", &self.name)
            .field("read_timeout", &self.read_timeout)
            .field("buffer_len", &self.read_buffer.len())
            .finish()
    }
}
