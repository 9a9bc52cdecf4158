//! Closed-inclusive block ranges and their partitioning.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A closed-inclusive span of block numbers (`start..=end`).
///
/// `BlockRange::new(4, 6)` covers blocks 4, 5 and 6. Construction requires
/// `start <= end`; empty spans are represented by not constructing a range at
/// all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    start: u64,
    end: u64,
}

impl BlockRange {
    /// Creates the range `start..=end`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "invalid block range: {start} > {end}");
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of blocks covered. Never zero.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block <= self.end
    }

    /// Partitions the range into consecutive disjoint sub-ranges of at most
    /// `max` blocks each. Together the pieces cover exactly `self`, in order.
    #[must_use]
    pub fn split(&self, max: u64) -> Vec<BlockRange> {
        assert!(max > 0, "split size must be greater than 0");
        let mut out = Vec::with_capacity((self.len().div_ceil(max)) as usize);
        let mut start = self.start;
        while start <= self.end {
            let end = self.end.min(start + max - 1);
            out.push(BlockRange { start, end });
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        out
    }

    /// Iterates the block numbers in the range.
    pub fn blocks(&self) -> impl Iterator<Item = u64> + use<> {
        self.start..=self.end
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_inclusive() {
        let range = BlockRange::new(4, 6);
        assert_eq!(range.len(), 3);
        assert!(range.contains(4));
        assert!(range.contains(6));
        assert!(!range.contains(7));
    }

    #[test]
    fn split_is_disjoint_exhaustive_and_ordered() {
        let range = BlockRange::new(100, 109);
        let parts = range.split(4);
        assert_eq!(
            parts,
            vec![
                BlockRange::new(100, 103),
                BlockRange::new(104, 107),
                BlockRange::new(108, 109),
            ]
        );
        let covered: u64 = parts.iter().map(BlockRange::len).sum();
        assert_eq!(covered, range.len());
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end() + 1, pair[1].start());
        }
    }

    #[test]
    fn split_larger_than_range_yields_single_piece() {
        assert_eq!(BlockRange::new(5, 7).split(100), vec![BlockRange::new(5, 7)]);
    }

    #[test]
    fn split_of_single_block() {
        assert_eq!(BlockRange::new(9, 9).split(1), vec![BlockRange::new(9, 9)]);
    }

    #[test]
    #[should_panic(expected = "invalid block range")]
    fn inverted_range_panics() {
        let _ = BlockRange::new(10, 9);
    }
}
