//! Per-connection output queue
//!
//! Unbounded FIFO of bytes waiting to reach the transport. The only flow
//! control is the chunk size the caller drains with.

use std::io;

use bytes::{Buf, BytesMut};

/// Result of one bounded drain attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    /// Bytes offered to the writer
    pub requested: usize,
    /// Bytes the writer accepted (and that left the queue)
    pub written: usize,
}

impl Drain {
    /// The writer took fewer bytes than it was offered
    pub fn is_short(&self) -> bool {
        self.written < self.requested
    }
}

/// Output queue
#[derive(Debug, Default)]
pub struct OutputQueue {
    buf: BytesMut,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the back of the queue
    pub fn enqueue(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Offer up to `max_chunk` bytes from the front to `write`.
    ///
    /// Exactly the number of bytes `write` reports is removed. A chunk that
    /// would end inside a UTF-8 sequence is shortened to the last complete
    /// character, unless that would leave nothing to send. Writer errors are
    /// passed through untouched and leave the queue as it was.
    pub fn drain_with<F>(&mut self, max_chunk: usize, write: F) -> io::Result<Drain>
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let mut end = self.buf.len().min(max_chunk);
        if end < self.buf.len() {
            end = utf8_boundary(&self.buf[..end]);
        }
        if end == 0 {
            return Ok(Drain { requested: 0, written: 0 });
        }

        let written = write(&self.buf[..end])?.min(end);
        self.buf.advance(written);
        Ok(Drain { requested: end, written })
    }
}

/// Length of the longest prefix of `chunk` that does not end mid-character
fn utf8_boundary(chunk: &[u8]) -> usize {
    // Walk back over at most three continuation bytes to the lead byte
    let len = chunk.len();
    for back in 1..=len.min(4) {
        let b = chunk[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = if b < 0x80 {
            1
        } else if b & 0xE0 == 0xC0 {
            2
        } else if b & 0xF0 == 0xE0 {
            3
        } else if b & 0xF8 == 0xF0 {
            4
        } else {
            1 // Invalid lead, nothing to preserve
        };
        return if width > back && len - back > 0 { len - back } else { len };
    }
    len
}
