//! Reserve buffer for a large head-of-line piece.
//!
//! Holds the prefix of the piece captured by a single bounded read while the
//! piece was still downloading, and releases it in fixed slices on every
//! flush tick.

use bytes::Bytes;

/// Captured prefix of the piece at the head of the stream.
#[derive(Debug)]
pub struct ReserveBuffer {
    piece: u32,
    data: Bytes,
    /// Offset into `data` already handed to the consumer
    cursor: usize,
    /// Bytes released per tick, a fixed fraction of the piece's range size
    step: usize,
}

impl ReserveBuffer {
    /// Creates a reserve over `data` for a piece of `range_size` bytes.
    ///
    /// Returns `None` when nothing was captured.
    pub fn new(piece: u32, data: Bytes, range_size: u64, divisor: u64) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let step = (range_size / divisor.max(1)).max(1);
        Some(Self {
            piece,
            data,
            cursor: 0,
            step: usize::try_from(step).unwrap_or(usize::MAX),
        })
    }

    pub fn piece(&self) -> u32 {
        self.piece
    }

    pub fn captured(&self) -> usize {
        self.data.len()
    }

    pub fn is_drained(&self) -> bool {
        self.cursor >= self.data.len()
    }

    /// Releases the next tick's slice.
    pub fn next_slice(&mut self) -> Bytes {
        let end = self.cursor.saturating_add(self.step).min(self.data.len());
        let slice = self.data.slice(self.cursor..end);
        self.cursor = end;
        slice
    }

    /// Releases everything still outstanding.
    pub fn take_outstanding(&mut self) -> Bytes {
        let slice = self.data.slice(self.cursor..);
        self.cursor = self.data.len();
        slice
    }
}
