//! Canonical sets of byte ranges.
//!
//! Every set is kept sorted, non-overlapping and free of empty or adjacent
//! ranges, so all binary operations are a single linear merge.

use std::fmt;
use std::ops::Range;

#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct IntervalSet {
    ranges: Vec<Range<u64>>,
}

fn normalize(range: Range<u64>) -> Range<u64> {
    if range.start > range.end {
        range.end..range.start
    } else {
        range
    }
}

impl IntervalSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// A set holding exactly `range`.
    pub fn from_range(range: Range<u64>) -> Self {
        let mut set = Self::new();
        set.add(range);
        set
    }

    /// Adds the inclusive span `[lo, hi]`.
    pub fn add_inclusive(&mut self, lo: u64, hi: u64) {
        let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };
        self.add(lo..hi.saturating_add(1));
    }

    pub fn add(&mut self, range: Range<u64>) {
        let range = normalize(range);
        if range.is_empty() {
            return;
        }

        // first range that could touch `range` (end >= start means overlap or adjacency)
        let first = self.ranges.partition_point(|r| r.end < range.start);
        let mut last = first;
        let mut merged = range;
        while last < self.ranges.len() && self.ranges[last].start <= merged.end {
            merged.start = merged.start.min(self.ranges[last].start);
            merged.end = merged.end.max(self.ranges[last].end);
            last += 1;
        }
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    pub fn remove(&mut self, range: Range<u64>) {
        let range = normalize(range);
        if range.is_empty() || self.ranges.is_empty() {
            return;
        }

        let first = self.ranges.partition_point(|r| r.end <= range.start);
        let mut last = first;
        let mut keep = Vec::with_capacity(2);
        while last < self.ranges.len() && self.ranges[last].start < range.end {
            let r = &self.ranges[last];
            if r.start < range.start {
                keep.push(r.start..range.start);
            }
            if r.end > range.end {
                keep.push(range.end..r.end);
            }
            last += 1;
        }
        self.ranges.splice(first..last, keep);
    }

    /// In-place union.
    pub fn union(&mut self, other: &IntervalSet) {
        if other.ranges.is_empty() {
            return;
        }
        if self.ranges.is_empty() {
            self.ranges = other.ranges.clone();
            return;
        }

        let mut out: Vec<Range<u64>> = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() || j < other.ranges.len() {
            let next = if j >= other.ranges.len()
                || (i < self.ranges.len() && self.ranges[i].start <= other.ranges[j].start)
            {
                i += 1;
                self.ranges[i - 1].clone()
            } else {
                j += 1;
                other.ranges[j - 1].clone()
            };
            match out.last_mut() {
                Some(tail) if next.start <= tail.end => tail.end = tail.end.max(next.end),
                _ => out.push(next),
            }
        }
        self.ranges = out;
    }

    pub fn difference(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::with_capacity(self.ranges.len());
        let mut j = 0;
        for r in &self.ranges {
            let mut start = r.start;
            while j < other.ranges.len() && other.ranges[j].end <= start {
                j += 1;
            }
            let mut k = j;
            while k < other.ranges.len() && other.ranges[k].start < r.end {
                let o = &other.ranges[k];
                if o.start > start {
                    out.push(start..o.start);
                }
                start = start.max(o.end);
                if start >= r.end {
                    break;
                }
                k += 1;
            }
            if start < r.end {
                out.push(start..r.end);
            }
        }
        IntervalSet { ranges: out }
    }

    pub fn intersection(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = &self.ranges[i];
            let b = &other.ranges[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                out.push(start..end);
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        IntervalSet { ranges: out }
    }

    /// Whether any byte of `range` is in the set.
    pub fn intersects(&self, range: Range<u64>) -> bool {
        let range = normalize(range);
        if range.is_empty() {
            return false;
        }
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .map(|r| r.start < range.end)
            .unwrap_or(false)
    }

    /// Whether every byte of `range` is in the set.
    pub fn contains(&self, range: Range<u64>) -> bool {
        let range = normalize(range);
        if range.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .map(|r| r.start <= range.start && r.end >= range.end)
            .unwrap_or(false)
    }

    pub fn overlaps(&self, other: &IntervalSet) -> bool {
        !self.intersection(other).is_empty()
    }

    pub fn covered_size(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> {
        self.ranges.iter()
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    /// Checks the canonical-form invariant.
    pub fn is_canonical(&self) -> bool {
        self.ranges.iter().all(|r| r.start < r.end)
            && self.ranges.windows(2).all(|w| w[0].end < w[1].start)
    }
}

impl FromIterator<Range<u64>> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Range<u64>>>(iter: T) -> Self {
        let mut set = IntervalSet::new();
        for r in iter {
            set.add(r);
        }
        set
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.ranges.iter().map(|r| format!("[{}, {})", r.start, r.end)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> IntervalSet {
        ranges.iter().map(|&(a, b)| a..b).collect()
    }

    #[test]
    fn test_add_merges_overlapping_and_adjacent() {
        let mut s = IntervalSet::new();
        s.add(10..20);
        s.add(30..40);
        s.add(20..25);
        assert_eq!(s.ranges(), &[10..25, 30..40]);
        s.add(24..31);
        assert_eq!(s.ranges(), &[10..40]);
        assert!(s.is_canonical());
    }

    #[test]
    fn test_add_normalizes_input() {
        let mut s = IntervalSet::new();
        s.add(20..10);
        s.add(5..5);
        assert_eq!(s.ranges(), &[10..20]);
        s.add_inclusive(30, 25);
        assert_eq!(s.ranges(), &[10..20, 25..31]);
    }

    #[test]
    fn test_remove_splits() {
        let mut s = set(&[(0, 100)]);
        s.remove(40..60);
        assert_eq!(s.ranges(), &[0..40, 60..100]);
        s.remove(0..10);
        s.remove(95..200);
        assert_eq!(s.ranges(), &[10..40, 60..95]);
        s.remove(30..70);
        assert_eq!(s.ranges(), &[10..30, 70..95]);
        assert_eq!(s.covered_size(), 45);
    }

    #[test]
    fn test_union() {
        let mut a = set(&[(0, 10), (20, 30), (50, 60)]);
        let b = set(&[(5, 22), (30, 35), (70, 80)]);
        a.union(&b);
        assert_eq!(a.ranges(), &[0..35, 50..60, 70..80]);
    }

    #[test]
    fn test_difference() {
        let a = set(&[(0, 100), (200, 300)]);
        let b = set(&[(10, 20), (90, 210), (250, 260)]);
        let d = a.difference(&b);
        assert_eq!(d.ranges(), &[0..10, 20..90, 210..250, 260..300]);
        assert!(a.difference(&a).is_empty());
        assert_eq!(a.difference(&IntervalSet::new()), a);
    }

    #[test]
    fn test_intersection_and_queries() {
        let a = set(&[(0, 10), (20, 30)]);
        let b = set(&[(5, 25)]);
        assert_eq!(a.intersection(&b).ranges(), &[5..10, 20..25]);
        assert!(a.intersects(9..12));
        assert!(!a.intersects(10..20));
        assert!(a.contains(21..30));
        assert!(!a.contains(5..21));
        assert!(a.overlaps(&b));
    }
}
