// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// A byte region with a read cursor (`head`) and a write cursor (`tail`).
///
/// The socket reader writes into [`ByteRing::writable`] and commits with
/// `move_by_write`; the frame decoder reads [`ByteRing::readable`] and commits
/// with `move_by_read`.
pub trait ByteRing {
    fn head(&self) -> usize;
    fn tail(&self) -> usize;
    fn capacity(&self) -> usize;

    fn readable_size(&self) -> usize {
        self.tail() - self.head()
    }

    fn writable_size(&self) -> usize {
        self.capacity() - self.tail()
    }

    fn readable(&self) -> &[u8];
    fn writable(&mut self) -> &mut [u8];

    fn move_by_read(&mut self, n: usize);
    fn move_by_write(&mut self, n: usize);

    /// The readable region should be moved to the front before the next read.
    fn is_overloaded(&self) -> bool;
    fn arrange(&mut self);
}

#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }
}

impl ByteRing for RingBuffer {
    fn head(&self) -> usize {
        self.head
    }

    fn tail(&self) -> usize {
        self.tail
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn readable(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    fn writable(&mut self) -> &mut [u8] {
        &mut self.buf[self.tail..]
    }

    fn move_by_read(&mut self, n: usize) {
        self.head = (self.head + n).min(self.tail);
        if self.head == self.tail {
            // empty, rewind for free
            self.head = 0;
            self.tail = 0;
        }
    }

    fn move_by_write(&mut self, n: usize) {
        self.tail = (self.tail + n).min(self.buf.len());
    }

    fn is_overloaded(&self) -> bool {
        let writable = self.writable_size();
        writable == 0 || (self.head > 0 && writable < self.buf.len() / 4)
    }

    fn arrange(&mut self) {
        if self.head == 0 {
            return;
        }
        self.buf.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ring: &mut RingBuffer, data: &[u8]) {
        ring.writable()[..data.len()].copy_from_slice(data);
        ring.move_by_write(data.len());
    }

    #[test]
    fn test_cursors_follow_reads_and_writes() {
        let mut ring = RingBuffer::new(8);
        fill(&mut ring, b"abcde");
        assert_eq!(ring.readable(), b"abcde");
        assert_eq!(ring.writable_size(), 3);

        ring.move_by_read(2);
        assert_eq!(ring.head(), 2);
        assert_eq!(ring.readable(), b"cde");

        // reading everything rewinds both cursors
        ring.move_by_read(3);
        assert_eq!((ring.head(), ring.tail()), (0, 0));
    }

    #[test]
    fn test_moves_are_clamped() {
        let mut ring = RingBuffer::new(4);
        fill(&mut ring, b"ab");
        ring.move_by_write(100);
        assert_eq!(ring.tail(), 4);
        ring.move_by_read(100);
        assert_eq!(ring.readable_size(), 0);
    }

    #[test]
    fn test_arrange_compacts_when_overloaded() {
        let mut ring = RingBuffer::new(16);
        fill(&mut ring, b"0123456789abcd");
        ring.move_by_read(10);
        assert!(ring.is_overloaded());

        ring.arrange();
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.readable(), b"abcd");
        assert_eq!(ring.writable_size(), 12);
        assert!(!ring.is_overloaded());
    }

    #[test]
    fn test_full_buffer_is_overloaded() {
        let mut ring = RingBuffer::new(4);
        fill(&mut ring, b"wxyz");
        assert!(ring.is_overloaded());
    }
}
