#![forbid(unsafe_code)]
//! Interval index over touched page ranges.
//!
//! During tracing every filemap event contributes an inclusive page interval
//! for some (device, inode). This index maintains, per inode, the minimal set
//! of non-touching half-open ranges whose union equals the union of all added
//! intervals. The block reducer later intersects these ranges with the
//! scanner's candidate blocks to drop readahead residue no process read.
//!
//! Ranges are kept in a sorted `Vec`; an insert binary-searches for any
//! touching-or-overlapping range and walks outward to find the full merge
//! span. The add stream clusters (sequential readahead inserts adjacent
//! ranges), so the expected span is one or two ranges and the walk stays
//! short.

use pw_types::{Dev, InodeNumber};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashMap;
use tracing::warn;

/// A half-open range `[start, end)` of page indices. Invariant: `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u64,
    pub end: u64,
}

impl PageRange {
    /// Whether two ranges overlap or touch end-to-start.
    ///
    /// `[0, 2)` and `[2, 4)` touch: their union is the single range `[0, 4)`.
    #[must_use]
    pub fn touches(&self, other: &PageRange) -> bool {
        !(self.end < other.start || other.end < self.start)
    }
}

/// Touched page ranges of one inode.
#[derive(Debug, Clone)]
pub struct InodeIndex {
    pub inode: InodeNumber,
    /// Sorted by `start`; consecutive ranges satisfy `a.end < b.start`.
    ranges: Vec<PageRange>,
    /// Optional debug label (path name, when known).
    pub display_name: Option<String>,
}

impl InodeIndex {
    #[must_use]
    pub fn new(inode: InodeNumber) -> Self {
        Self {
            inode,
            ranges: Vec::new(),
            display_name: None,
        }
    }

    #[must_use]
    pub fn ranges(&self) -> &[PageRange] {
        &self.ranges
    }

    /// Merge a new range into the set, preserving the sorted non-touching
    /// invariant.
    pub fn add(&mut self, range: PageRange) {
        debug_assert!(range.start < range.end);

        let hit = self.ranges.binary_search_by(|probe| {
            if probe.end < range.start {
                Ordering::Less
            } else if range.end < probe.start {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        });

        match hit {
            Err(pos) => self.ranges.insert(pos, range),
            Ok(pos) => {
                // Walk outward to the lowest and highest touching ranges;
                // the expected span is at most two.
                let mut lo = pos;
                while lo > 0 && self.ranges[lo - 1].touches(&range) {
                    lo -= 1;
                }
                let mut hi = pos;
                while hi + 1 < self.ranges.len() && self.ranges[hi + 1].touches(&range) {
                    hi += 1;
                }

                let merged = PageRange {
                    start: self.ranges[lo].start.min(range.start),
                    end: self.ranges[hi].end.max(range.end),
                };
                self.ranges[lo] = merged;
                self.ranges.drain(lo + 1..=hi);
            }
        }
    }
}

/// Touched inodes of one device, ordered by inode number.
#[derive(Debug, Default)]
pub struct DeviceIndex {
    inodes: BTreeMap<InodeNumber, InodeIndex>,
}

impl DeviceIndex {
    #[must_use]
    pub fn find(&self, inode: InodeNumber) -> Option<&InodeIndex> {
        self.inodes.get(&inode)
    }

    pub fn entry(&mut self, inode: InodeNumber) -> &mut InodeIndex {
        self.inodes
            .entry(inode)
            .or_insert_with(|| InodeIndex::new(inode))
    }

    pub fn iter(&self) -> impl Iterator<Item = &InodeIndex> {
        self.inodes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

/// All touched (device, inode) page ranges observed during one trace.
///
/// Owned exclusively by the ingester while tracing; the block reducer reads
/// it afterwards.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: HashMap<Dev, DeviceIndex>,
}

impl DeviceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the inclusive page interval `[first_page, last_page]` for
    /// (`dev`, `inode`).
    ///
    /// The interval is converted to half-open internally. An interval whose
    /// half-open end would overflow the page address space is rejected with
    /// a warning and no mutation.
    pub fn add(&mut self, dev: Dev, inode: InodeNumber, first_page: u64, last_page: u64) {
        let Some(end) = last_page.checked_add(1) else {
            warn!(%dev, %inode, last_page, "page interval exceeds address space, dropped");
            return;
        };
        if end <= first_page {
            warn!(%dev, %inode, first_page, last_page, "inverted page interval, dropped");
            return;
        }

        self.devices
            .entry(dev)
            .or_default()
            .entry(inode)
            .add(PageRange {
                start: first_page,
                end,
            });
    }

    #[must_use]
    pub fn find(&self, dev: Dev, inode: InodeNumber) -> Option<&InodeIndex> {
        self.devices.get(&dev)?.find(inode)
    }

    #[must_use]
    pub fn device(&self, dev: Dev) -> Option<&DeviceIndex> {
        self.devices.get(&dev)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> Dev {
        Dev::new(8, 0)
    }

    fn ranges_of(table: &DeviceTable, ino: u64) -> Vec<(u64, u64)> {
        table
            .find(dev(), InodeNumber(ino))
            .map(|idx| idx.ranges().iter().map(|r| (r.start, r.end)).collect())
            .unwrap_or_default()
    }

    #[test]
    fn merge_fill_gap() {
        let mut table = DeviceTable::new();
        table.add(dev(), InodeNumber(12345), 0, 0);
        assert_eq!(ranges_of(&table, 12345), vec![(0, 1)]);

        table.add(dev(), InodeNumber(12345), 2, 3);
        assert_eq!(ranges_of(&table, 12345), vec![(0, 1), (2, 4)]);

        table.add(dev(), InodeNumber(12345), 1, 1);
        assert_eq!(ranges_of(&table, 12345), vec![(0, 4)]);
    }

    #[test]
    fn merge_touching_at_end() {
        let mut table = DeviceTable::new();
        table.add(dev(), InodeNumber(12345), 0, 0);
        table.add(dev(), InodeNumber(12345), 2, 3);
        table.add(dev(), InodeNumber(12345), 1, 1);

        table.add(dev(), InodeNumber(12345), 4, 5);
        assert_eq!(ranges_of(&table, 12345), vec![(0, 6)]);

        table.add(dev(), InodeNumber(12345), 8, 10);
        assert_eq!(ranges_of(&table, 12345), vec![(0, 6), (8, 11)]);

        table.add(dev(), InodeNumber(12345), 7, 7);
        assert_eq!(ranges_of(&table, 12345), vec![(0, 6), (7, 11)]);
    }

    /// A long insertion sequence covering gap fills, covered inserts, exact
    /// duplicates, and a multi-range swallow.
    #[test]
    fn merge_sequence_exhaustive() {
        let cases: &[(u64, u64, &[(u64, u64)])] = &[
            (0, 0, &[(0, 1)]),
            (2, 3, &[(0, 1), (2, 4)]),
            (1, 1, &[(0, 4)]),
            (4, 5, &[(0, 6)]),
            (8, 10, &[(0, 6), (8, 11)]),
            (7, 7, &[(0, 6), (7, 11)]),
            // already covered, no change
            (1, 3, &[(0, 6), (7, 11)]),
            // exact duplicate of an existing range
            (7, 10, &[(0, 6), (7, 11)]),
            // overlap in the middle, merge
            (2, 8, &[(0, 11)]),
            (20, 30, &[(0, 11), (20, 31)]),
            (50, 60, &[(0, 11), (20, 31), (50, 61)]),
            (70, 80, &[(0, 11), (20, 31), (50, 61), (70, 81)]),
            (90, 100, &[(0, 11), (20, 31), (50, 61), (70, 81), (90, 101)]),
            // swallow multiple ranges at once
            (25, 69, &[(0, 11), (20, 81), (90, 101)]),
        ];

        let mut table = DeviceTable::new();
        for (i, (first, last, expect)) in cases.iter().enumerate() {
            table.add(dev(), InodeNumber(12345), *first, *last);
            assert_eq!(ranges_of(&table, 12345), expect.to_vec(), "step {i}");
        }
    }

    #[test]
    fn devices_and_inodes_are_independent() {
        let mut table = DeviceTable::new();
        table.add(Dev::new(8, 0), InodeNumber(1), 0, 0);
        table.add(Dev::new(8, 1), InodeNumber(1), 5, 5);
        table.add(Dev::new(8, 0), InodeNumber(2), 9, 9);

        assert_eq!(ranges_of(&table, 1), vec![(0, 1)]);
        assert_eq!(
            table
                .find(Dev::new(8, 1), InodeNumber(1))
                .unwrap()
                .ranges()
                .len(),
            1
        );
        assert_eq!(ranges_of(&table, 2), vec![(9, 10)]);
        assert!(table.find(Dev::new(9, 0), InodeNumber(1)).is_none());
    }

    #[test]
    fn overflow_interval_is_rejected() {
        let mut table = DeviceTable::new();
        table.add(dev(), InodeNumber(1), 0, u64::MAX);
        assert!(table.find(dev(), InodeNumber(1)).is_none());

        // A valid add afterwards still works.
        table.add(dev(), InodeNumber(1), 3, 4);
        assert_eq!(ranges_of(&table, 1), vec![(3, 5)]);
    }

    #[test]
    fn inverted_interval_is_rejected() {
        let mut table = DeviceTable::new();
        table.add(dev(), InodeNumber(1), 10, 2);
        assert!(table.find(dev(), InodeNumber(1)).is_none());
    }

    // ── Property-style checks ───────────────────────────────────────────

    fn assert_invariants(idx: &InodeIndex) {
        let ranges = idx.ranges();
        for r in ranges {
            assert!(r.start < r.end, "empty range {r:?}");
        }
        for pair in ranges.windows(2) {
            assert!(
                pair[0].end < pair[1].start,
                "ranges touch or overlap: {pair:?}"
            );
        }
    }

    fn union_pages(ranges: &[PageRange]) -> Vec<u64> {
        let mut pages = Vec::new();
        for r in ranges {
            pages.extend(r.start..r.end);
        }
        pages
    }

    /// Deterministic pseudo-random interval stream (fixed LCG seed).
    fn pseudo_random_intervals(n: usize, seed: u64) -> Vec<(u64, u64)> {
        let mut state = seed;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let first = (state >> 33) % 200;
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let len = (state >> 33) % 8;
            out.push((first, first + len));
        }
        out
    }

    #[test]
    fn invariants_hold_for_random_streams() {
        for seed in [1, 99, 0xDEAD_BEEF] {
            let mut idx = InodeIndex::new(InodeNumber(1));
            let mut expected: Vec<u64> = Vec::new();

            for (first, last) in pseudo_random_intervals(300, seed) {
                idx.add(PageRange {
                    start: first,
                    end: last + 1,
                });
                expected.extend(first..=last);
                assert_invariants(&idx);
            }

            expected.sort_unstable();
            expected.dedup();
            assert_eq!(union_pages(idx.ranges()), expected, "seed {seed}");
        }
    }

    #[test]
    fn insertion_is_commutative() {
        let intervals = pseudo_random_intervals(40, 7);

        let build = |order: &[usize]| {
            let mut idx = InodeIndex::new(InodeNumber(1));
            for &i in order {
                let (first, last) = intervals[i];
                idx.add(PageRange {
                    start: first,
                    end: last + 1,
                });
            }
            idx.ranges().to_vec()
        };

        let forward: Vec<usize> = (0..intervals.len()).collect();
        let reverse: Vec<usize> = (0..intervals.len()).rev().collect();
        // Interleave evens then odds for a third ordering.
        let mut interleaved: Vec<usize> = (0..intervals.len()).step_by(2).collect();
        interleaved.extend((1..intervals.len()).step_by(2));

        let reference = build(&forward);
        assert_eq!(build(&reverse), reference);
        assert_eq!(build(&interleaved), reference);
    }
}
