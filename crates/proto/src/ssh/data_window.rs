//! Channel flow-control accounting (RFC 4254 Section 5.2).
//!
//! A [`DataWindow`] tracks how many bytes may still cross one direction of
//! one channel. Each channel owns two: the local window (what the peer may
//! send us) and the remote window (what we may send the peer).
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::data_window::DataWindow;
//!
//! let mut window = DataWindow::new(1024, 1024, 256, 512);
//! window.consume(900).unwrap();
//! assert!(window.is_adjust_required());
//!
//! let count = window.adjust_count();
//! window.adjust(count);
//! assert_eq!(window.space(), 1024);
//! ```

use strand_platform::{StrandError, StrandResult};

/// Flow-control window for one direction of a channel.
///
/// # Invariants
///
/// - `space <= maximum` at all times
/// - A failed `consume` leaves `space` unchanged
///
/// Not synchronized; the owning channel guards it with its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataWindow {
    space: u32,
    maximum: u32,
    minimum: u32,
    packet_size: u32,
    closed: bool,
}

impl DataWindow {
    /// Creates a window. `initial` is capped at `maximum`.
    pub fn new(initial: u32, maximum: u32, minimum: u32, packet_size: u32) -> Self {
        Self {
            space: initial.min(maximum),
            maximum,
            minimum,
            packet_size,
            closed: false,
        }
    }

    /// Takes `len` bytes out of the window.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] if `len` exceeds the available space
    /// or the window is closed.
    pub fn consume(&mut self, len: usize) -> StrandResult<()> {
        if self.closed || len > self.space as usize {
            return Err(StrandError::Protocol(format!(
                "Data length of {} bytes exceeded available window space of {} bytes",
                len, self.space
            )));
        }
        self.space -= len as u32;
        Ok(())
    }

    /// Grants `count` more bytes, capped at the maximum.
    pub fn adjust(&mut self, count: u32) {
        if self.closed {
            return;
        }
        self.space = self.space.saturating_add(count).min(self.maximum);
    }

    /// True when space has fallen to the minimum and a WINDOW_ADJUST is due.
    pub fn is_adjust_required(&self) -> bool {
        !self.closed && self.space <= self.minimum
    }

    /// Bytes needed to refill the window to its maximum.
    pub fn adjust_count(&self) -> u32 {
        self.maximum - self.space
    }

    /// Closes the window; space stays zero from now on.
    pub fn close(&mut self) {
        self.closed = true;
        self.space = 0;
    }

    /// Available space in bytes.
    pub fn space(&self) -> u32 {
        self.space
    }

    /// Maximum space in bytes.
    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    /// Threshold at or below which an adjustment is due.
    pub fn minimum(&self) -> u32 {
        self.minimum
    }

    /// Largest single transfer unit.
    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Whether the window has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
