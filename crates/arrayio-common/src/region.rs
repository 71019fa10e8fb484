//! Dirty-region interval set
//!
//! Half-open `[start, end)` block ranges, kept coalesced so adjacent and
//! overlapping inserts collapse into one entry.

use crate::types::Lba;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coalesced set of half-open block ranges
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSet {
    /// start -> end (exclusive)
    ranges: BTreeMap<Lba, Lba>,
}

impl RegionSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Total blocks covered
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Lowest dirty block, if any
    #[must_use]
    pub fn first_block(&self) -> Option<Lba> {
        self.ranges.keys().next().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Lba, Lba)> + '_ {
        self.ranges.iter().map(|(s, e)| (*s, *e))
    }

    /// Add `[start, end)`, merging with any overlapping or adjacent range
    pub fn insert(&mut self, start: Lba, end: Lba) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;

        // A range starting at or before `start` may reach into the new one
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back()
            && e >= start
        {
            new_start = s;
            new_end = new_end.max(e);
            self.ranges.remove(&s);
        }

        let absorbed: Vec<Lba> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(s, _)| *s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                new_end = new_end.max(e);
            }
        }

        self.ranges.insert(new_start, new_end);
    }

    /// Drop everything below `lba`, trimming a range that straddles it
    pub fn clear_below(&mut self, lba: Lba) {
        let below: Vec<(Lba, Lba)> = self.ranges.range(..lba).map(|(s, e)| (*s, *e)).collect();
        for (s, e) in below {
            self.ranges.remove(&s);
            if e > lba {
                self.ranges.insert(lba, e);
            }
        }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// First range intersecting `[from, until)`, clipped to that window
    #[must_use]
    pub fn first_within(&self, from: Lba, until: Lba) -> Option<(Lba, Lba)> {
        if from >= until {
            return None;
        }
        let straddling = self
            .ranges
            .range(..=from)
            .next_back()
            .filter(|(_, e)| **e > from)
            .map(|(s, e)| (*s, *e));
        let candidate = straddling.or_else(|| {
            self.ranges
                .range(from..until)
                .next()
                .map(|(s, e)| (*s, *e))
        })?;
        let start = candidate.0.max(from);
        let end = candidate.1.min(until);
        (start < end).then_some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(set: &RegionSet) -> Vec<(Lba, Lba)> {
        set.iter().collect()
    }

    #[test]
    fn test_insert_coalesces() {
        let mut set = RegionSet::new();
        set.insert(100, 200);
        set.insert(300, 400);
        assert_eq!(set.len(), 2);

        // Adjacent on the left
        set.insert(200, 250);
        assert_eq!(ranges(&set), vec![(100, 250), (300, 400)]);

        // Bridge both
        set.insert(240, 310);
        assert_eq!(ranges(&set), vec![(100, 400)]);
        assert_eq!(set.total_blocks(), 300);
    }

    #[test]
    fn test_insert_swallows_contained() {
        let mut set = RegionSet::new();
        set.insert(10, 20);
        set.insert(30, 40);
        set.insert(0, 100);
        assert_eq!(ranges(&set), vec![(0, 100)]);

        set.insert(50, 60);
        assert_eq!(ranges(&set), vec![(0, 100)]);
        set.insert(5, 5);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_clear_below_trims() {
        let mut set = RegionSet::new();
        set.insert(0, 10);
        set.insert(20, 40);
        set.insert(50, 60);
        set.clear_below(30);
        assert_eq!(ranges(&set), vec![(30, 40), (50, 60)]);
        assert_eq!(set.first_block(), Some(30));
    }

    #[test]
    fn test_first_within() {
        let mut set = RegionSet::new();
        set.insert(100, 200);
        set.insert(500, 600);

        assert_eq!(set.first_within(0, 1000), Some((100, 200)));
        assert_eq!(set.first_within(150, 1000), Some((150, 200)));
        assert_eq!(set.first_within(200, 1000), Some((500, 600)));
        assert_eq!(set.first_within(200, 550), Some((500, 550)));
        assert_eq!(set.first_within(200, 500), None);
        assert_eq!(set.first_within(700, 800), None);
    }

    #[test]
    fn test_serde_survives_bincode() {
        let mut set = RegionSet::new();
        set.insert(8, 16);
        let bytes = bincode::serialize(&set).unwrap();
        let back: RegionSet = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, set);
    }
}
