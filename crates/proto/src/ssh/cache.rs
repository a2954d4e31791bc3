//! Bounded receive buffer for caching channels.

use bytes::{Buf, BytesMut};
use strand_platform::{StrandError, StrandResult};

/// Buffer holding received channel data until the application reads it.
///
/// Capacity equals the channel's local maximum window, so a peer that
/// respects the window can never overflow it.
#[derive(Debug)]
pub struct CachingBuffer {
    buf: BytesMut,
    capacity: usize,
    closed: bool,
}

impl CachingBuffer {
    /// Creates an empty buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            capacity,
            closed: false,
        }
    }

    /// Appends received data.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] if the buffer is closed or the data
    /// does not fit.
    pub fn put(&mut self, data: &[u8]) -> StrandResult<()> {
        if self.closed {
            return Err(StrandError::Protocol(
                "Data received after the channel buffer was closed".to_string(),
            ));
        }
        if self.buf.len() + data.len() > self.capacity {
            return Err(StrandError::Protocol(format!(
                "Data length of {} bytes exceeded buffer space of {} bytes",
                data.len(),
                self.capacity - self.buf.len()
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Moves up to `dst.len()` bytes into `dst`, returning the count.
    pub fn get(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buf.len());
        self.buf.copy_to_slice(&mut dst[..n]);
        n
    }

    /// Buffered byte count.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// True if any bytes are buffered.
    pub fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Closes the buffer. Buffered bytes stay readable.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether the buffer is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
