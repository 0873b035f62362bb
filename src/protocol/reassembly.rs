//! Out-of-order receive buffer.
//!
//! Ranges are keyed by their absolute offset in the byte stream (a 64-bit
//! counter that never wraps), so ordering is plain integer ordering even when
//! the 32-bit sequence space wraps. Stored ranges never overlap or abut; an
//! insertion merges with every range it touches.

use std::collections::BTreeMap;

use crate::protocol::headers::{SackBlock, SackBlocks};

/// Result of inserting a range into the [Reassembly] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    /// Bytes not previously held.
    pub new_bytes: usize,
    /// Bytes that were already held (a duplicate to report via DSACK).
    pub duplicate: usize,
}

/// Received-but-not-contiguous byte ranges beyond `RCV.NXT`.
#[derive(Debug, Default)]
pub struct Reassembly {
    /// Absolute stream offset corresponding to `RCV.NXT`.
    nxt: u64,
    ranges: BTreeMap<u64, Vec<u8>>,
    /// Total bytes held.
    len: usize,
    /// Start of the range most recently touched, reported first in SACK.
    last: Option<u64>,
}

impl Reassembly {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no out-of-order data is held.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the number of bytes held.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of disjoint ranges held.
    pub fn ranges(&self) -> usize {
        self.ranges.len()
    }

    /// Inserts `data` starting `offset` bytes beyond `RCV.NXT`.
    pub fn insert(&mut self, offset: u32, data: &[u8]) -> Inserted {
        if data.is_empty() {
            return Inserted {
                new_bytes: 0,
                duplicate: 0,
            };
        }

        let start = self.nxt + offset as u64;
        let end = start + data.len() as u64;

        let touching: Vec<u64> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(key, buf)| *key + buf.len() as u64 >= start)
            .map(|(key, _)| *key)
            .collect();

        let mut held = 0usize;
        let mut parts = Vec::with_capacity(touching.len());

        for key in touching {
            if let Some(buf) = self.ranges.remove(&key) {
                let buf_end = key + buf.len() as u64;

                // Bytes of the new range already present in this one.
                let overlap_start = key.max(start);
                let overlap_end = buf_end.min(end);
                held += overlap_end.saturating_sub(overlap_start) as usize;

                parts.push((key, buf));
            }
        }

        let new_start = parts.iter().map(|(key, _)| *key).fold(start, u64::min);
        let new_end = parts
            .iter()
            .map(|(key, buf)| key + buf.len() as u64)
            .fold(end, u64::max);

        let mut merged = vec![0u8; (new_end - new_start) as usize];
        let at = (start - new_start) as usize;
        merged[at..at + data.len()].copy_from_slice(data);

        for (key, buf) in &parts {
            let at = (key - new_start) as usize;
            merged[at..at + buf.len()].copy_from_slice(buf);
            self.len -= buf.len();
        }

        self.len += merged.len();
        self.ranges.insert(new_start, merged);
        self.last = Some(new_start);

        Inserted {
            new_bytes: data.len() - held,
            duplicate: held,
        }
    }

    /// Records that `n` in-order bytes were consumed at `RCV.NXT`.
    pub fn advance(&mut self, n: usize) {
        self.nxt += n as u64;
    }

    /// Removes and returns the bytes that became contiguous with `RCV.NXT`,
    /// advancing past them. Data below `RCV.NXT` is discarded.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        loop {
            let (&key, buf) = self.ranges.first_key_value()?;
            if key > self.nxt {
                return None;
            }

            let end = key + buf.len() as u64;
            let buf = self.ranges.remove(&key)?;
            self.len -= buf.len();

            if self.last == Some(key) {
                self.last = None;
            }

            if end <= self.nxt {
                continue;
            }

            let skip = (self.nxt - key) as usize;
            let tail = buf[skip..].to_vec();
            self.nxt = end;

            return Some(tail);
        }
    }

    /// Returns up to four SACK blocks describing the held ranges, the most
    /// recently updated first (RFC 2018 4).
    pub fn sack_blocks(&self, rcv_nxt: u32) -> SackBlocks {
        let mut blocks = SackBlocks::new();

        let to_block = |key: u64, len: usize| {
            let left = rcv_nxt.wrapping_add(key.saturating_sub(self.nxt) as u32);
            SackBlock {
                left,
                right: left.wrapping_add(len as u32),
            }
        };

        if let Some(last) = self.last {
            if let Some(buf) = self.ranges.get(&last) {
                let _ = blocks.push(to_block(last, buf.len()));
            }
        }

        for (&key, buf) in &self.ranges {
            if Some(key) == self.last {
                continue;
            }

            if blocks.push(to_block(key, buf.len())).is_err() {
                break;
            }
        }

        blocks
    }

    /// Discards all held data.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.len = 0;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembly_fills_gap_in_order() {
        let mut buf = Reassembly::new();

        // [100, 200) arrives first.
        let ins = buf.insert(100, &[2u8; 100]);
        assert_eq!(ins.new_bytes, 100);
        assert!(buf.pop().is_none());

        // In-order [0, 100) is consumed directly by the caller.
        buf.advance(100);

        let tail = buf.pop().unwrap();
        assert_eq!(tail, vec![2u8; 100]);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn reassembly_merges_overlapping_and_abutting() {
        let mut buf = Reassembly::new();

        buf.insert(10, b"bcd");
        buf.insert(20, b"xyz");
        assert_eq!(buf.ranges(), 2);

        // Abuts the first, overlaps nothing.
        buf.insert(13, b"ef");
        assert_eq!(buf.ranges(), 2);

        // Bridges both ranges.
        let ins = buf.insert(14, b"FGHIJKL");
        assert_eq!(ins.duplicate, 2);
        assert_eq!(ins.new_bytes, 5);
        assert_eq!(buf.ranges(), 1);

        // Bytes already held win over the retransmitted copy.
        buf.advance(10);
        assert_eq!(buf.pop().unwrap(), b"bcdefGHIJKxyz".to_vec());
    }

    #[test]
    fn reassembly_reports_full_duplicate() {
        let mut buf = Reassembly::new();

        buf.insert(50, &[1u8; 20]);
        let ins = buf.insert(55, &[1u8; 5]);

        assert_eq!(ins.new_bytes, 0);
        assert_eq!(ins.duplicate, 5);
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn reassembly_partial_overlap_with_nxt() {
        let mut buf = Reassembly::new();

        buf.insert(5, b"0123456789");
        // Caller consumed 8 bytes in order, overlapping the held range.
        buf.advance(8);

        assert_eq!(buf.pop().unwrap(), b"3456789".to_vec());
    }

    #[test]
    fn sack_blocks_most_recent_first() {
        let mut buf = Reassembly::new();
        let rcv_nxt = u32::MAX - 50;

        buf.insert(100, &[0u8; 10]);
        buf.insert(300, &[0u8; 10]);
        buf.insert(200, &[0u8; 10]);

        let blocks = buf.sack_blocks(rcv_nxt);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].left, rcv_nxt.wrapping_add(200));
        assert_eq!(blocks[1].left, rcv_nxt.wrapping_add(100));
        assert_eq!(blocks[2].right, rcv_nxt.wrapping_add(310));
    }

    #[test]
    fn sack_blocks_capped_at_four() {
        let mut buf = Reassembly::new();

        for i in 1..=6u32 {
            buf.insert(i * 100, &[0u8; 10]);
        }

        assert_eq!(buf.sack_blocks(0).len(), 4);
    }
}
