//! Byte-range coverage for partial heaps.

use std::ops::Range;

/// Sorted, disjoint, non-adjacent half-open ranges.
///
/// # Invariants
/// - `ranges[i].end < ranges[i + 1].start`
/// - no range is empty
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `range`, merging with neighbours. Returns how many bytes were
    /// not covered before.
    pub fn insert(&mut self, range: Range<u64>) -> u64 {
        if range.is_empty() {
            return 0;
        }
        // first range that could touch `range`
        let first = self.ranges.partition_point(|r| r.end < range.start);
        // one past the last range that could touch it
        let last = self.ranges.partition_point(|r| r.start <= range.end);

        let overlap: u64 = self.ranges[first..last]
            .iter()
            .map(|r| r.end.min(range.end).saturating_sub(r.start.max(range.start)))
            .sum();

        let merged = match self.ranges.get(first..last) {
            Some(touching) if !touching.is_empty() => {
                touching[0].start.min(range.start)..touching[touching.len() - 1].end.max(range.end)
            }
            _ => range.clone(),
        };
        self.ranges.splice(first..last, std::iter::once(merged));
        (range.end - range.start) - overlap
    }

    /// True if every byte of `range` is covered.
    pub fn covers(&self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        let i = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(i)
            .is_some_and(|r| r.start <= range.start && range.end <= r.end)
    }

    /// True if `[0, len)` is covered.
    pub fn is_complete(&self, len: u64) -> bool {
        self.covers(0..len)
    }

    /// Number of covered bytes.
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> {
        self.ranges.iter()
    }
}
