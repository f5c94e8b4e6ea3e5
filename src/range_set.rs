use std::{
    cmp,
    cmp::Ordering,
    collections::{
        btree_map, BTreeMap,
        Bound::{Excluded, Included},
    },
    ops::Range,
};

use tinyvec::TinyVec;

/// A set of u64 values optimized for long runs and random insert/delete/contains
#[derive(Debug, Default, Clone)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, end)| end > x)
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        if let Some((start, end)) = self.pred(x) {
            match end.cmp(&x) {
                // Wholly contained
                Ordering::Greater => {
                    return false;
                }
                Ordering::Equal => {
                    // Extend the existing range
                    self.0.remove(&start);
                    let mut new_end = x + 1;
                    if let Some((next_start, next_end)) = self.succ(x) {
                        if next_start == new_end {
                            self.0.remove(&next_start);
                            new_end = next_end;
                        }
                    }
                    self.0.insert(start, new_end);
                    return true;
                }
                _ => {}
            }
        }
        let mut new_end = x + 1;
        if let Some((next_start, next_end)) = self.succ(x) {
            if next_start == new_end {
                self.0.remove(&next_start);
                new_end = next_end;
            }
        }
        self.0.insert(x, new_end);
        true
    }

    pub fn insert(&mut self, mut x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end >= x.end {
                // Wholly contained
                return false;
            } else if end >= x.start {
                // Extend overlapping predecessor
                self.0.remove(&start);
                x.start = start;
            }
        }
        while let Some((next_start, next_end)) = self.succ(x.start) {
            if next_start > x.end {
                break;
            }
            self.0.remove(&next_start);
            x.end = cmp::max(next_end, x.end);
        }
        self.0.insert(x.start, x.end);
        true
    }

    /// Remove all values in `other` from `self`
    pub fn subtract(&mut self, other: &Self) {
        for range in other.iter() {
            self.remove(range);
        }
    }

    pub fn remove(&mut self, x: Range<u64>) {
        if x.is_empty() {
            return;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end > x.start {
                self.0.remove(&start);
                if start < x.start {
                    self.0.insert(start, x.start);
                }
                if end > x.end {
                    self.0.insert(x.end, end);
                }
            }
        }
        while let Some((next_start, next_end)) = self.succ(x.start) {
            if next_start >= x.end {
                break;
            }
            self.0.remove(&next_start);
            if next_end > x.end {
                self.0.insert(x.end, next_end);
            }
        }
    }

    /// Find the closed range containing or preceding `x`, if any
    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Included(0), Included(x)))
            .next_back()
            .map(|(&s, &e)| (s, e))
    }

    /// Find the closed range following `x`, if any
    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Excluded(x), Included(u64::MAX)))
            .next()
            .map(|(&s, &e)| (s, e))
    }

    pub fn min(&self) -> Option<u64> {
        self.0.keys().next().copied()
    }

    pub fn max(&self) -> Option<u64> {
        self.0.values().next_back().map(|&e| e - 1)
    }

    /// Number of distinct ranges in the set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remove and return the lowest range in the set
    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.iter().next()?;
        self.0.remove(&start);
        Some(start..end)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.0.iter())
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl Iterator for Iter<'_> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(&start, &end)| start..end)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.0.next_back().map(|(&start, &end)| start..end)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl FromIterator<Range<u64>> for RangeSet {
    fn from_iter<T: IntoIterator<Item = Range<u64>>>(iter: T) -> Self {
        let mut set = Self::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

/// A sorted, non-overlapping collection of u64 ranges backed by inline storage
///
/// Used where range sets are typically tiny and short-lived, e.g. the set of
/// ranges carried by a single ACK frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArrayRangeSet(TinyVec<[Range<u64>; 4]>);

impl ArrayRangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut out: TinyVec<[Range<u64>; 4]> = TinyVec::new();
        for existing in self.0.drain(..) {
            if existing.end < merged.start || merged.end < existing.start {
                out.push(existing);
            } else {
                merged.start = cmp::min(merged.start, existing.start);
                merged.end = cmp::max(merged.end, existing.end);
            }
        }
        let pos = out
            .iter()
            .position(|r| r.start > merged.start)
            .unwrap_or(out.len());
        out.insert(pos, merged);
        self.0 = out;
    }

    pub fn contains(&self, x: u64) -> bool {
        self.0.iter().any(|r| r.contains(&x))
    }

    pub fn max(&self) -> Option<u64> {
        self.0.last().map(|r| r.end - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.0.iter().cloned()
    }
}

impl FromIterator<Range<u64>> for ArrayRangeSet {
    fn from_iter<T: IntoIterator<Item = Range<u64>>>(iter: T) -> Self {
        let mut set = Self::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_contains() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert_eq!(set.len(), 2);
        assert!(set.contains(1));
        assert!(!set.contains(2));
        assert!(set.insert(2..4));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().collect::<Vec<_>>(), &[0..6]);
        assert!(!set.insert(1..3));
    }

    #[test]
    fn insert_one_extends() {
        let mut set = RangeSet::new();
        assert!(set.insert_one(5));
        assert!(set.insert_one(6));
        assert!(!set.insert_one(5));
        assert!(set.insert_one(4));
        assert_eq!(set.iter().collect::<Vec<_>>(), &[4..7]);
    }

    #[test]
    fn subtract_splits() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        let mut other = RangeSet::new();
        other.insert(3..5);
        set.subtract(&other);
        assert_eq!(set.iter().collect::<Vec<_>>(), &[0..3, 5..10]);
    }

    #[test]
    fn min_max_pop() {
        let mut set = RangeSet::new();
        set.insert(7..9);
        set.insert(1..3);
        assert_eq!(set.min(), Some(1));
        assert_eq!(set.max(), Some(8));
        assert_eq!(set.pop_min(), Some(1..3));
        assert_eq!(set.min(), Some(7));
    }

    #[test]
    fn array_set_merges_adjacent() {
        let mut set = ArrayRangeSet::new();
        set.insert(5..7);
        set.insert(0..2);
        set.insert(2..5);
        assert_eq!(set.iter().collect::<Vec<_>>(), &[0..7]);
        assert_eq!(set.max(), Some(6));
        assert!(set.contains(3));
        assert!(!set.contains(7));
    }
}
