//! Bounded output history replayed to late-joining clients.
//!
//! Keeps the most recent `capacity` bytes of session output; older bytes are
//! evicted first.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct OutputBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append output, evicting the oldest bytes beyond capacity.
    pub fn append(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    /// Retained bytes in chronological order.
    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_below_capacity() {
        let mut buf = OutputBuffer::new(10);
        buf.append(b"hello");
        assert_eq!(buf.snapshot(), b"hello");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut buf = OutputBuffer::new(5);
        buf.append(b"abcde");
        buf.append(b"fg");
        assert_eq!(buf.snapshot(), b"cdefg");
        buf.append(b"h");
        assert_eq!(buf.snapshot(), b"defgh");
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut buf = OutputBuffer::new(4);
        buf.append(b"xy");
        buf.append(b"0123456789");
        assert_eq!(buf.snapshot(), b"6789");
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut buf = OutputBuffer::new(0);
        buf.append(b"test");
        assert!(buf.is_empty());
    }
}
