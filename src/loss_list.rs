//! Loss bookkeeping for both sides of a flow: the sender's pending-retransmit
//!  list and the receiver's missing-sequence list are the same data structure
//!  with different access patterns.
//!
//! Ranges are stored disjoint and non-wrapping in a `BTreeMap` keyed by range
//!  start; a range crossing the sequence wrap point is split on insertion.
//!  Raw key order is meaningless across the wrap, so every ordered access
//!  takes a `base` sequence (the oldest sequence the caller still cares
//!  about) and iterates modularly from there.

use std::collections::BTreeMap;

use crate::seq::SeqNo;

#[derive(Debug, Default)]
pub struct LossList {
    /// range start -> inclusive range end, disjoint, non-wrapping
    ranges: BTreeMap<u32, u32>,
    /// total number of sequences across all ranges
    len: usize,
}

impl LossList {
    pub fn new() -> LossList {
        LossList::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, first: SeqNo, last: SeqNo) {
        if first.to_raw() > last.to_raw() {
            // crosses the wrap point
            self.insert_plain(first.to_raw(), SeqNo::MAX);
            self.insert_plain(0, last.to_raw());
        }
        else {
            self.insert_plain(first.to_raw(), last.to_raw());
        }
    }

    fn insert_plain(&mut self, mut first: u32, mut last: u32) {
        // swallow all ranges overlapping or adjacent to [first, last]
        loop {
            let existing = self.ranges
                .range(..=last.saturating_add(1))
                .next_back()
                .map(|(&s, &e)| (s, e));

            match existing {
                Some((s, e)) if e.saturating_add(1) >= first => {
                    self.ranges.remove(&s);
                    self.len -= (e - s + 1) as usize;
                    first = first.min(s);
                    last = last.max(e);
                }
                _ => break,
            }
        }

        self.ranges.insert(first, last);
        self.len += (last - first + 1) as usize;
    }

    /// smallest sequence in modular order starting at `base`
    pub fn first(&self, base: SeqNo) -> Option<SeqNo> {
        self.ranges.range(base.to_raw()..).next()
            .or_else(|| self.ranges.iter().next())
            .map(|(&s, _)| SeqNo::from_raw(s))
    }

    /// extract the smallest sequence (in modular order from `base`) and
    ///  shrink its range
    pub fn pop_first(&mut self, base: SeqNo) -> Option<SeqNo> {
        let (start, end) = match self.ranges.range(base.to_raw()..).next()
            .or_else(|| self.ranges.iter().next())
        {
            Some((&s, &e)) => (s, e),
            None => return None,
        };

        self.ranges.remove(&start);
        if start < end {
            self.ranges.insert(start + 1, end);
        }
        self.len -= 1;
        Some(SeqNo::from_raw(start))
    }

    /// remove a single sequence, splitting its range if necessary; returns
    ///  whether it was present
    pub fn remove(&mut self, seq: SeqNo) -> bool {
        let raw = seq.to_raw();
        let (start, end) = match self.ranges.range(..=raw).next_back() {
            Some((&s, &e)) if e >= raw => (s, e),
            _ => return false,
        };

        self.ranges.remove(&start);
        if start < raw {
            self.ranges.insert(start, raw - 1);
        }
        if raw < end {
            self.ranges.insert(raw + 1, end);
        }
        self.len -= 1;
        true
    }

    /// remove every sequence older than `threshold` (exclusive), in modular
    ///  order from `base`. Called when a fresh ACK supersedes queued
    ///  retransmits.
    pub fn remove_before(&mut self, base: SeqNo, threshold: SeqNo) {
        while let Some(first) = self.first(base) {
            if first.cmp_to(threshold) >= 0 {
                break;
            }

            let start = first.to_raw();
            let end = self.ranges.remove(&start).expect("first() returned a range start");
            if SeqNo::from_raw(end).cmp_to(threshold) < 0 {
                self.len -= (end - start + 1) as usize;
            }
            else {
                // threshold splits this range
                let keep_from = threshold.to_raw();
                self.ranges.insert(keep_from, end);
                self.len -= (keep_from - start) as usize;
            }
        }
    }

    /// remove every sequence in the inclusive range - e.g. when a message
    ///  drop supersedes its gaps
    pub fn remove_range(&mut self, first: SeqNo, last: SeqNo) {
        if first.to_raw() > last.to_raw() {
            self.remove_range_plain(first.to_raw(), SeqNo::MAX);
            self.remove_range_plain(0, last.to_raw());
        }
        else {
            self.remove_range_plain(first.to_raw(), last.to_raw());
        }
    }

    fn remove_range_plain(&mut self, first: u32, last: u32) {
        loop {
            let existing = self.ranges
                .range(..=last)
                .next_back()
                .map(|(&s, &e)| (s, e));

            match existing {
                Some((s, e)) if e >= first => {
                    self.ranges.remove(&s);
                    self.len -= (e - s + 1) as usize;
                    if s < first {
                        self.ranges.insert(s, first - 1);
                        self.len += (first - s) as usize;
                    }
                    if e > last {
                        self.ranges.insert(last + 1, e);
                        self.len += (e - last) as usize;
                    }
                }
                _ => break,
            }
        }
    }

    /// ranges in modular order from `base`, oldest first, at most
    ///  `max_ranges` of them - the shape NAK payloads are built from
    pub fn snapshot(&self, base: SeqNo, max_ranges: usize) -> Vec<(SeqNo, SeqNo)> {
        self.ranges.range(base.to_raw()..)
            .chain(self.ranges.range(..base.to_raw()))
            .take(max_ranges)
            .map(|(&s, &e)| (SeqNo::from_raw(s), SeqNo::from_raw(e)))
            .collect()
    }

    #[cfg(test)]
    fn assert_disjoint(&self) {
        let mut prev_end: Option<u32> = None;
        let mut total = 0usize;
        for (&s, &e) in &self.ranges {
            assert!(s <= e);
            if let Some(prev) = prev_end {
                assert!(s > prev + 1, "ranges must be disjoint and non-adjacent");
            }
            prev_end = Some(e);
            total += (e - s + 1) as usize;
        }
        assert_eq!(total, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn list_of(ranges: &[(u32, u32)]) -> LossList {
        let mut list = LossList::new();
        for &(a, b) in ranges {
            list.insert(SeqNo::from_raw(a), SeqNo::from_raw(b));
        }
        list
    }

    #[rstest]
    #[case::single(vec![(5, 5)], 1, vec![(5, 5)])]
    #[case::range(vec![(5, 9)], 5, vec![(5, 9)])]
    #[case::disjoint(vec![(5, 9), (20, 22)], 8, vec![(5, 9), (20, 22)])]
    #[case::overlap_merge(vec![(5, 9), (8, 12)], 8, vec![(5, 12)])]
    #[case::adjacent_merge(vec![(5, 9), (10, 12)], 8, vec![(5, 12)])]
    #[case::contained(vec![(5, 12), (7, 9)], 8, vec![(5, 12)])]
    #[case::bridge(vec![(5, 7), (11, 13), (8, 10)], 9, vec![(5, 13)])]
    #[case::duplicate(vec![(5, 7), (5, 7)], 3, vec![(5, 7)])]
    fn test_insert_merges(
        #[case] inserts: Vec<(u32, u32)>,
        #[case] expected_len: usize,
        #[case] expected: Vec<(u32, u32)>,
    ) {
        let list = list_of(&inserts);
        list.assert_disjoint();
        assert_eq!(list.len(), expected_len);
        let snapshot = list.snapshot(SeqNo::from_raw(0), usize::MAX)
            .iter()
            .map(|&(a, b)| (a.to_raw(), b.to_raw()))
            .collect::<Vec<_>>();
        assert_eq!(snapshot, expected);
    }

    #[test]
    fn test_insert_wrapping_range_is_split() {
        let list = list_of(&[(SeqNo::MAX - 1, 2)]);
        list.assert_disjoint();
        assert_eq!(list.len(), 5);

        let snapshot = list.snapshot(SeqNo::from_raw(SeqNo::MAX - 1), usize::MAX);
        assert_eq!(snapshot, vec![
            (SeqNo::from_raw(SeqNo::MAX - 1), SeqNo::from_raw(SeqNo::MAX)),
            (SeqNo::from_raw(0), SeqNo::from_raw(2)),
        ]);
    }

    #[test]
    fn test_pop_first_drains_in_order() {
        let mut list = list_of(&[(7, 9), (3, 3)]);

        let base = SeqNo::from_raw(2);
        let mut popped = Vec::new();
        while let Some(seq) = list.pop_first(base) {
            popped.push(seq.to_raw());
        }
        assert_eq!(popped, vec![3, 7, 8, 9]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_pop_first_modular_order_across_wrap() {
        let mut list = list_of(&[(1, 2), (SeqNo::MAX, SeqNo::MAX)]);

        let base = SeqNo::from_raw(SeqNo::MAX - 5);
        assert_eq!(list.pop_first(base), Some(SeqNo::from_raw(SeqNo::MAX)));
        assert_eq!(list.pop_first(base), Some(SeqNo::from_raw(1)));
        assert_eq!(list.pop_first(base), Some(SeqNo::from_raw(2)));
        assert_eq!(list.pop_first(base), None);
    }

    #[rstest]
    #[case::absent(vec![(5, 9)], 12, false, vec![(5, 9)])]
    #[case::whole_single(vec![(5, 5)], 5, true, vec![])]
    #[case::range_start(vec![(5, 9)], 5, true, vec![(6, 9)])]
    #[case::range_end(vec![(5, 9)], 9, true, vec![(5, 8)])]
    #[case::range_middle(vec![(5, 9)], 7, true, vec![(5, 6), (8, 9)])]
    fn test_remove(
        #[case] inserts: Vec<(u32, u32)>,
        #[case] remove: u32,
        #[case] expected_removed: bool,
        #[case] expected: Vec<(u32, u32)>,
    ) {
        let mut list = list_of(&inserts);
        assert_eq!(list.remove(SeqNo::from_raw(remove)), expected_removed);
        list.assert_disjoint();

        let snapshot = list.snapshot(SeqNo::from_raw(0), usize::MAX)
            .iter()
            .map(|&(a, b)| (a.to_raw(), b.to_raw()))
            .collect::<Vec<_>>();
        assert_eq!(snapshot, expected);
    }

    #[rstest]
    #[case::all_below(vec![(5, 9)], 15, vec![])]
    #[case::none_below(vec![(5, 9)], 5, vec![(5, 9)])]
    #[case::splits(vec![(5, 9)], 7, vec![(7, 9)])]
    #[case::multiple(vec![(2, 3), (5, 9), (20, 21)], 8, vec![(8, 9), (20, 21)])]
    fn test_remove_before(
        #[case] inserts: Vec<(u32, u32)>,
        #[case] threshold: u32,
        #[case] expected: Vec<(u32, u32)>,
    ) {
        let mut list = list_of(&inserts);
        list.remove_before(SeqNo::from_raw(0), SeqNo::from_raw(threshold));
        list.assert_disjoint();

        let snapshot = list.snapshot(SeqNo::from_raw(0), usize::MAX)
            .iter()
            .map(|&(a, b)| (a.to_raw(), b.to_raw()))
            .collect::<Vec<_>>();
        assert_eq!(snapshot, expected);
    }

    #[rstest]
    #[case::exact(vec![(5, 9)], (5, 9), vec![])]
    #[case::subset(vec![(5, 9)], (6, 8), vec![(5, 5), (9, 9)])]
    #[case::left_overlap(vec![(5, 9)], (3, 6), vec![(7, 9)])]
    #[case::right_overlap(vec![(5, 9)], (8, 12), vec![(5, 7)])]
    #[case::spanning_multiple(vec![(2, 3), (5, 9), (20, 21)], (3, 20), vec![(2, 2), (21, 21)])]
    #[case::disjoint(vec![(5, 9)], (11, 14), vec![(5, 9)])]
    fn test_remove_range(
        #[case] inserts: Vec<(u32, u32)>,
        #[case] remove: (u32, u32),
        #[case] expected: Vec<(u32, u32)>,
    ) {
        let mut list = list_of(&inserts);
        list.remove_range(SeqNo::from_raw(remove.0), SeqNo::from_raw(remove.1));
        list.assert_disjoint();

        let snapshot = list.snapshot(SeqNo::from_raw(0), usize::MAX)
            .iter()
            .map(|&(a, b)| (a.to_raw(), b.to_raw()))
            .collect::<Vec<_>>();
        assert_eq!(snapshot, expected);
    }

    #[test]
    fn test_snapshot_limits_ranges() {
        let list = list_of(&[(5, 9), (20, 22), (30, 30)]);
        assert_eq!(list.snapshot(SeqNo::from_raw(0), 2).len(), 2);
    }

    #[test]
    fn test_snapshot_oldest_first_across_wrap() {
        let list = list_of(&[(3, 4), (SeqNo::MAX - 2, SeqNo::MAX - 1)]);

        let snapshot = list.snapshot(SeqNo::from_raw(SeqNo::MAX - 10), usize::MAX);
        assert_eq!(snapshot[0].0.to_raw(), SeqNo::MAX - 2);
        assert_eq!(snapshot[1].0.to_raw(), 3);
    }
}
