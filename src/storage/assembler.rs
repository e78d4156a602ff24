use core::fmt;

use heapless::Vec;

use crate::config::ASSEMBLER_MAX_RANGES;

/// Too many byte ranges are being tracked at once; the caller should drop
/// the offending data and wait for holes to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyHoles;

impl fmt::Display for TooManyHoles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "too many holes")
    }
}

/// A set of received byte ranges within a window.
///
/// Ranges are kept sorted, non-overlapping and non-adjacent; adding a range
/// merges it with its neighbors. Offsets are relative to the window start:
/// the fragment-reassembly table uses absolute datagram offsets, the TCP
/// receive path uses offsets from `rcv_nxt` and shifts the set down as the
/// window advances.
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    ranges: Vec<(u32, u32), ASSEMBLER_MAX_RANGES>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler { ranges: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record that `[start, end)` has been received.
    pub fn add(&mut self, start: u32, end: u32) -> Result<(), TooManyHoles> {
        debug_assert!(start <= end);
        if start == end {
            return Ok(());
        }
        let mut merged = (start, end);
        let mut at = 0;
        while at < self.ranges.len() && self.ranges[at].1 < merged.0 {
            at += 1;
        }
        while at < self.ranges.len() && self.ranges[at].0 <= merged.1 {
            let (s, e) = self.ranges[at];
            merged.0 = merged.0.min(s);
            merged.1 = merged.1.max(e);
            self.ranges.remove(at);
        }
        self.ranges.insert(at, merged).map_err(|_| TooManyHoles)
    }

    /// The length of the contiguous prefix received at offset 0.
    pub fn peek_front(&self) -> u32 {
        match self.ranges.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }

    /// Whether the whole window `[0, total)` has been received.
    pub fn is_complete(&self, total: u32) -> bool {
        self.peek_front() >= total
    }

    /// Shift every range down by `n`; the prefix `[0, n)` must be covered.
    pub fn advance_front(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        debug_assert!(self.peek_front() >= n);
        let drop_first = {
            let first = &mut self.ranges[0];
            first.1 -= n;
            first.1 == 0
        };
        if drop_first {
            self.ranges.remove(0);
        }
        for range in self.ranges.iter_mut().skip(if drop_first { 0 } else { 1 }) {
            range.0 -= n;
            range.1 -= n;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_merge_adjacent_and_overlapping() {
        let mut a = Assembler::new();
        a.add(10, 20).unwrap();
        a.add(30, 40).unwrap();
        assert_eq!(a.peek_front(), 0);
        a.add(18, 30).unwrap();
        a.add(0, 10).unwrap();
        assert_eq!(a.peek_front(), 40);
        assert!(a.is_complete(40));
        assert!(!a.is_complete(41));
    }

    #[test]
    fn test_advance_front() {
        let mut a = Assembler::new();
        a.add(0, 10).unwrap();
        a.add(15, 20).unwrap();
        a.advance_front(10);
        assert_eq!(a.peek_front(), 0);
        a.add(0, 5).unwrap();
        assert_eq!(a.peek_front(), 10);
        a.advance_front(10);
        assert!(a.is_empty());
    }

    #[test]
    fn test_too_many_holes() {
        let mut a = Assembler::new();
        for i in 0..ASSEMBLER_MAX_RANGES as u32 {
            a.add(i * 10, i * 10 + 5).unwrap();
        }
        assert_eq!(a.add(1000, 1005), Err(TooManyHoles));
        // Filling a hole still works.
        a.add(5, 10).unwrap();
    }
}
