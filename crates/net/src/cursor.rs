//! Buffered byte cursor.
//!
//! An append/consume view over an owned buffer: the reader task appends
//! raw socket bytes at the tail while the parser consumes frames from the
//! head with [`ByteCursor::ltrim`]. Consumed space is reclaimed lazily by
//! compacting once the dead prefix outgrows the live bytes.

use byteorder::{ByteOrder, LittleEndian};

/// Dead-prefix size that triggers compaction.
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Append-at-tail, consume-at-head byte buffer.
#[derive(Debug, Default)]
pub struct ByteCursor {
    buf: Vec<u8>,
    start: usize,
}

impl ByteCursor {
    /// Create an empty cursor.
    pub fn new() -> ByteCursor {
        ByteCursor::default()
    }

    /// Unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    /// True when every appended byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.start == self.buf.len()
    }

    /// View of the unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Append bytes at the tail.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Consume `n` bytes from the head.
    ///
    /// # Panics
    /// If fewer than `n` bytes are buffered.
    pub fn ltrim(&mut self, n: usize) {
        assert!(n <= self.len(), "ltrim past end of buffer");
        self.start += n;
        if self.start >= COMPACT_THRESHOLD && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    /// Peek a little-endian `u32` at an offset into the unconsumed bytes.
    pub fn peek_u32(&self, offset: usize) -> Option<u32> {
        let s = self.as_slice();
        if s.len() < offset + 4 {
            return None;
        }
        Some(LittleEndian::read_u32(&s[offset..offset + 4]))
    }
}
