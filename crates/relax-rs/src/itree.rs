//! Interval tree over bytecode indices.
//!
//! Stores which span terms cross which bytecode index ranges, so that when a
//! bytecode changes length the affected terms are found in O(log n + k).
//! All insertions happen before the first query (the optimizer builds the
//! tree in one phase and only queries it afterwards), so the tree is laid
//! out as an implicit balanced BST over a sorted entry vector, with a
//! max-high augmentation per subtree.  An insert after a query marks the
//! tree dirty and the next query rebuilds.

#[allow(unused_imports)]
use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug)]
struct Entry<T> {
    low: u64,
    high: u64,
    data: T,
}

/// An augmented interval tree with closed intervals `[low, high]`.
#[derive(Debug)]
pub(crate) struct IntervalTree<T> {
    entries: Vec<Entry<T>>,
    submax: Vec<u64>,
    dirty: bool,
}

impl<T> IntervalTree<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            submax: Vec::new(),
            dirty: false,
        }
    }

    /// Insert `[low, high]` (inclusive, `low <= high`).
    pub(crate) fn insert(&mut self, low: u64, high: u64, data: T) {
        debug_assert!(low <= high);
        self.entries.push(Entry { low, high, data });
        self.dirty = true;
    }

    /// Call `visit` once per stored interval intersecting `[low, high]`.
    /// Visit order is unspecified.
    pub(crate) fn enumerate(&mut self, low: u64, high: u64, visit: &mut dyn FnMut(&T)) {
        if self.dirty {
            self.build();
        }
        self.query(0, self.entries.len(), low, high, visit);
    }

    fn build(&mut self) {
        self.entries
            .sort_by(|a, b| (a.low, a.high).cmp(&(b.low, b.high)));
        self.submax = vec![0; self.entries.len()];
        Self::build_max(&self.entries, &mut self.submax, 0, self.entries.len());
        self.dirty = false;
    }

    fn build_max(entries: &[Entry<T>], submax: &mut [u64], lo: usize, hi: usize) -> u64 {
        if lo >= hi {
            return 0;
        }
        let mid = lo + (hi - lo) / 2;
        let mut m = entries[mid].high;
        m = m.max(Self::build_max(entries, submax, lo, mid));
        m = m.max(Self::build_max(entries, submax, mid + 1, hi));
        submax[mid] = m;
        m
    }

    fn query(&self, lo: usize, hi: usize, ql: u64, qh: u64, visit: &mut dyn FnMut(&T)) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        // No interval below this subtree reaches the query window.
        if self.submax[mid] < ql {
            return;
        }
        self.query(lo, mid, ql, qh, visit);
        let e = &self.entries[mid];
        if e.low <= qh {
            if e.high >= ql {
                visit(&e.data);
            }
            self.query(mid + 1, hi, ql, qh, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(tree: &mut IntervalTree<u32>, low: u64, high: u64) -> Vec<u32> {
        let mut out = Vec::new();
        tree.enumerate(low, high, &mut |&d| out.push(d));
        out.sort_unstable();
        out
    }

    #[test]
    fn point_queries() {
        let mut tree = IntervalTree::new();
        tree.insert(2, 5, 0);
        tree.insert(4, 9, 1);
        tree.insert(7, 7, 2);
        tree.insert(10, 12, 3);

        assert_eq!(collect(&mut tree, 1, 1), Vec::<u32>::new());
        assert_eq!(collect(&mut tree, 2, 2), vec![0]);
        assert_eq!(collect(&mut tree, 4, 4), vec![0, 1]);
        assert_eq!(collect(&mut tree, 7, 7), vec![1, 2]);
        assert_eq!(collect(&mut tree, 9, 9), vec![1]);
        assert_eq!(collect(&mut tree, 11, 11), vec![3]);
        assert_eq!(collect(&mut tree, 13, 13), Vec::<u32>::new());
    }

    #[test]
    fn range_query_spans_everything() {
        let mut tree = IntervalTree::new();
        for i in 0..50u64 {
            tree.insert(i, i + 2, i as u32);
        }
        assert_eq!(collect(&mut tree, 0, 100).len(), 50);
    }

    #[test]
    fn matches_brute_force() {
        let intervals: &[(u64, u64)] = &[
            (1, 4),
            (3, 3),
            (2, 9),
            (8, 11),
            (5, 6),
            (11, 15),
            (1, 1),
            (14, 14),
        ];
        let mut tree = IntervalTree::new();
        for (i, &(lo, hi)) in intervals.iter().enumerate() {
            tree.insert(lo, hi, i as u32);
        }
        for q in 0..18u64 {
            let expect: Vec<u32> = intervals
                .iter()
                .enumerate()
                .filter(|(_, &(lo, hi))| lo <= q && q <= hi)
                .map(|(i, _)| i as u32)
                .collect();
            let mut got = collect(&mut tree, q, q);
            got.sort_unstable();
            assert_eq!(got, expect, "query point {q}");
        }
    }

    #[test]
    fn insert_after_query_rebuilds() {
        let mut tree = IntervalTree::new();
        tree.insert(1, 3, 0);
        assert_eq!(collect(&mut tree, 2, 2), vec![0]);
        tree.insert(2, 4, 1);
        assert_eq!(collect(&mut tree, 2, 2), vec![0, 1]);
        assert_eq!(collect(&mut tree, 4, 4), vec![1]);
    }
}
