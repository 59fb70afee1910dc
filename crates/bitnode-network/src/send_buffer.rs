//! Per-connection outbound byte queue.
//!
//! Bytes are appended by the dispatcher and drained by the connection's
//! tick, one bounded non-blocking write per call, so a peer that reads
//! slowly never stalls its worker.

use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Hard ceiling on buffered bytes; exceeding it indicates a logic error upstream.
pub const MAX_SEND_BUFFER: usize = 1024 * 1024;

/// Largest write attempted per drain.
pub const SEND_CHUNK: usize = 4096;

/// Outbound byte queue.
#[derive(Debug, Default)]
pub struct SendBuffer {
    /// Unsent bytes; the front is advanced as writes complete.
    buf: BytesMut,
    /// Bytes flushed since the buffer was last empty.
    sent: usize,
    /// Ceiling above which enqueue is refused.
    limit: usize,
}

impl SendBuffer {
    /// Create a buffer with the default ceiling.
    pub fn new() -> Self {
        Self::with_limit(MAX_SEND_BUFFER)
    }

    /// Create a buffer with a custom ceiling.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            sent: 0,
            limit,
        }
    }

    /// Append bytes. Refused once the buffer already exceeds its ceiling.
    pub fn enqueue(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        if self.buf.len() > self.limit {
            warn!(
                queued = self.buf.len(),
                refused = bytes.len(),
                "Send buffer over ceiling, dropping message"
            );
            return Err(NetworkError::SendBufferFull {
                queued: self.buf.len(),
                max: self.limit,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Bytes waiting to be written.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Bytes flushed since the buffer was last empty.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Nothing left to write.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Unsent bytes, front first.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.sent = 0;
    }

    /// One non-blocking write of at most [`SEND_CHUNK`] bytes.
    ///
    /// Returns the number of bytes written; a writer that is not ready
    /// yields `Ok(0)`. Any other failure is returned as an error.
    pub fn drain_once<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> NetworkResult<usize> {
        if self.buf.is_empty() {
            return Ok(0);
        }
        let chunk = self.buf.len().min(SEND_CHUNK);
        let written = match writer.write(&self.buf[..chunk]).now_or_never() {
            None => return Ok(0),
            Some(Ok(0)) => return Err(NetworkError::ConnectionClosed),
            Some(Ok(n)) => n,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
            Some(Err(e)) => return Err(NetworkError::Io(e)),
        };
        self.buf.advance(written);
        self.sent += written;
        if self.buf.is_empty() {
            self.clear();
        }
        Ok(written)
    }
}
