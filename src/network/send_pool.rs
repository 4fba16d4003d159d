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

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Write buffers shared by every connection's writer task.
///
/// Bounded: a buffer given back while the pool is full is dropped.
#[derive(Debug)]
pub struct SendPool {
    buffers: ArrayQueue<BytesMut>,
    buffer_size: usize,
}

impl SendPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        SendPool {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
        }
    }

    pub fn take(&self) -> BytesMut {
        self.buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    pub fn give(&self, mut buffer: BytesMut) {
        buffer.clear();
        // full, let it go
        let _ = self.buffers.push(buffer);
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused_up_to_capacity() {
        let pool = SendPool::new(2, 64);
        let mut first = pool.take();
        first.extend_from_slice(b"stale");
        let capacity = first.capacity();

        pool.give(first);
        let reused = pool.take();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);

        pool.give(reused);
        pool.give(BytesMut::new());
        pool.give(BytesMut::new());
        assert_eq!(pool.available(), 2);
    }
}
