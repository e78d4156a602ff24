use core::cmp::min;

use managed::ManagedSlice;

/// A byte ring buffer.
///
/// Backs the TCP send and receive queues. Queued bytes occupy at most two
/// contiguous storage runs; [RingBuffer::peek] exposes one run at a time so
/// callers can gather without copying. The *unallocated* write entry points
/// allow placing out-of-order data beyond the queued region before
/// committing it.
#[derive(Debug)]
pub struct RingBuffer<'a> {
    storage: ManagedSlice<'a, u8>,
    read_at: usize,
    length: usize,
}

impl<'a> RingBuffer<'a> {
    pub fn new<S>(storage: S) -> RingBuffer<'a>
    where
        S: Into<ManagedSlice<'a, u8>>,
    {
        RingBuffer {
            storage: storage.into(),
            read_at: 0,
            length: 0,
        }
    }

    pub fn clear(&mut self) {
        self.read_at = 0;
        self.length = 0;
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The number of queued bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// The number of bytes that can still be enqueued.
    pub fn window(&self) -> usize {
        self.capacity() - self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_full(&self) -> bool {
        self.window() == 0
    }

    fn wrap(&self, idx: usize) -> usize {
        debug_assert!(idx < 2 * self.capacity());
        if idx >= self.capacity() {
            idx - self.capacity()
        } else {
            idx
        }
    }

    /// The contiguous run of queued bytes starting `offset` bytes into the
    /// queue, capped at `max_len`. Returns an empty slice past the end;
    /// call again past the run's length for the wrapped remainder.
    pub fn peek(&self, offset: usize, max_len: usize) -> &[u8] {
        if offset >= self.length {
            return &[];
        }
        let start = self.wrap(self.read_at + offset);
        let run = min(self.capacity() - start, self.length - offset);
        &self.storage[start..start + min(run, max_len)]
    }

    /// Copy `data` into free storage `offset` bytes past the queued region
    /// without committing it. Returns how much fit.
    pub fn write_unallocated(&mut self, offset: usize, data: &[u8]) -> usize {
        let avail = self.window().saturating_sub(offset);
        let len = min(avail, data.len());
        let mut idx = self.wrap(self.wrap(self.read_at + self.length) + offset);
        let mut written = 0;
        while written < len {
            let run = min(self.capacity() - idx, len - written);
            self.storage[idx..idx + run].copy_from_slice(&data[written..written + run]);
            written += run;
            idx = self.wrap(idx + run);
        }
        written
    }

    /// Commit `count` bytes previously placed with `write_unallocated`.
    pub fn enqueue_unallocated(&mut self, count: usize) {
        debug_assert!(count <= self.window());
        self.length += count;
    }

    /// Enqueue as much of `data` as fits; returns how much was enqueued.
    pub fn enqueue_slice(&mut self, data: &[u8]) -> usize {
        let written = self.write_unallocated(0, data);
        self.enqueue_unallocated(written);
        written
    }

    /// Dequeue up to `data.len()` bytes into `data`; returns the count.
    pub fn dequeue_slice(&mut self, data: &mut [u8]) -> usize {
        let len = min(self.length, data.len());
        let mut read = 0;
        while read < len {
            let run = {
                let chunk = self.peek(0, len - read);
                data[read..read + chunk.len()].copy_from_slice(chunk);
                chunk.len()
            };
            self.dequeue_advance(run);
            read += run;
        }
        len
    }

    /// Drop `n` bytes from the front of the queue without reading them.
    pub fn dequeue_advance(&mut self, n: usize) {
        debug_assert!(n <= self.length);
        self.read_at = self.wrap(self.read_at + n);
        self.length -= n;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ring(cap: usize) -> RingBuffer<'static> {
        RingBuffer::new(vec![0; cap])
    }

    #[test]
    fn test_enqueue_dequeue_wrap() {
        let mut r = ring(8);
        assert_eq!(r.enqueue_slice(&[1, 2, 3, 4, 5, 6]), 6);
        let mut out = [0; 4];
        assert_eq!(r.dequeue_slice(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        // Wraps around the end of storage.
        assert_eq!(r.enqueue_slice(&[7, 8, 9, 10, 11, 12, 13]), 6);
        assert_eq!(r.len(), 8);
        let mut out = [0; 8];
        assert_eq!(r.dequeue_slice(&mut out), 8);
        assert_eq!(out, [5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_peek_runs() {
        let mut r = ring(6);
        r.enqueue_slice(&[1, 2, 3, 4]);
        r.dequeue_advance(3);
        r.enqueue_slice(&[5, 6, 7, 8]);
        // Queue is [4,5,6,7,8] with read_at = 3: two storage runs.
        assert_eq!(r.peek(0, usize::MAX), &[4, 5, 6]);
        assert_eq!(r.peek(3, usize::MAX), &[7, 8]);
        assert_eq!(r.peek(5, usize::MAX), &[]);
        assert_eq!(r.peek(1, 2), &[5, 6]);
    }

    #[test]
    fn test_unallocated_out_of_order() {
        let mut r = ring(8);
        r.enqueue_slice(&[1, 2]);
        // Place bytes 2..5 of the window before bytes 0..2 arrive.
        assert_eq!(r.write_unallocated(2, &[30, 31, 32]), 3);
        assert_eq!(r.write_unallocated(0, &[10, 11]), 2);
        r.enqueue_unallocated(5);
        let mut out = [0; 7];
        assert_eq!(r.dequeue_slice(&mut out), 7);
        assert_eq!(out, [1, 2, 10, 11, 30, 31, 32]);
    }

    #[test]
    fn test_write_unallocated_bounded() {
        let mut r = ring(4);
        r.enqueue_slice(&[1, 2, 3]);
        assert_eq!(r.write_unallocated(0, &[9, 9]), 1);
        assert_eq!(r.write_unallocated(1, &[9]), 0);
    }
}
