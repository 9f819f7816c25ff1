//! Ordered collection of the segments forming one logical log.

use std::collections::BTreeMap;

use crate::segment::Segment;

/// Segments keyed by base offset. The highest-base segment is the active
/// one; the set is never empty while a log is open.
#[derive(Debug, Default)]
pub(crate) struct SegmentSet {
    segments: BTreeMap<u64, Segment>,
}

impl SegmentSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, segment: Segment) {
        self.segments.insert(segment.base_offset(), segment);
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub(crate) fn first(&self) -> Option<&Segment> {
        self.segments.values().next()
    }

    /// The tail segment, the only one accepting appends.
    pub(crate) fn active(&self) -> &Segment {
        self.segments
            .values()
            .next_back()
            .expect("log always has at least one segment")
    }

    pub(crate) fn active_mut(&mut self) -> &mut Segment {
        self.segments
            .values_mut()
            .next_back()
            .expect("log always has at least one segment")
    }

    /// The segment whose offset range contains `offset`, i.e. the one with
    /// the greatest base offset ≤ `offset`.
    pub(crate) fn find(&self, offset: u64) -> Option<&Segment> {
        self.segments.range(..=offset).next_back().map(|(_, s)| s)
    }

    /// Removes and returns the oldest-first run of segments satisfying
    /// `predicate`, stopping at the first non-match. The active segment is
    /// never removed, so at least one segment always remains.
    pub(crate) fn remove_prefix_while(
        &mut self,
        mut predicate: impl FnMut(&Segment) -> bool,
    ) -> Vec<Segment> {
        let mut victims = Vec::new();
        for (&base, segment) in self.segments.iter() {
            if self.segments.len() - victims.len() <= 1 {
                break;
            }
            if !predicate(segment) {
                break;
            }
            victims.push(base);
        }
        victims
            .into_iter()
            .filter_map(|base| self.segments.remove(&base))
            .collect()
    }

    /// Removes and returns every segment with base offset ≥ `offset`,
    /// newest-first order is not guaranteed. Used by truncation.
    pub(crate) fn split_off(&mut self, offset: u64) -> Vec<Segment> {
        let tail = self.segments.split_off(&offset);
        tail.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn segment(dir: &TempDir, base: u64) -> Segment {
        Segment::open(dir.path(), base, 1024 * 1024, 4096, 1024 * 1024, 0).unwrap()
    }

    fn set_with_bases(dir: &TempDir, bases: &[u64]) -> SegmentSet {
        let mut set = SegmentSet::new();
        for &base in bases {
            set.insert(segment(dir, base));
        }
        set
    }

    #[test]
    fn find_maps_offsets_to_containing_segment() {
        let dir = TempDir::new().unwrap();
        let set = set_with_bases(&dir, &[0, 10, 20]);

        assert_eq!(set.find(0).unwrap().base_offset(), 0);
        assert_eq!(set.find(9).unwrap().base_offset(), 0);
        assert_eq!(set.find(10).unwrap().base_offset(), 10);
        assert_eq!(set.find(25).unwrap().base_offset(), 20);
        assert_eq!(set.active().base_offset(), 20);
        assert_eq!(set.first().unwrap().base_offset(), 0);
    }

    #[test]
    fn find_misses_below_first_base() {
        let dir = TempDir::new().unwrap();
        let set = set_with_bases(&dir, &[10, 20]);
        assert!(set.find(9).is_none());
    }

    #[test]
    fn remove_prefix_stops_at_first_non_match() {
        let dir = TempDir::new().unwrap();
        let mut set = set_with_bases(&dir, &[0, 10, 20, 30]);

        let removed = set.remove_prefix_while(|s| s.base_offset() < 10 || s.base_offset() == 20);
        // stops at base 10 even though 20 would match
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].base_offset(), 0);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn remove_prefix_never_empties_the_set() {
        let dir = TempDir::new().unwrap();
        let mut set = set_with_bases(&dir, &[0, 10, 20]);

        let removed = set.remove_prefix_while(|_| true);
        assert_eq!(removed.len(), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(set.active().base_offset(), 20);
    }

    #[test]
    fn split_off_removes_tail_segments() {
        let dir = TempDir::new().unwrap();
        let mut set = set_with_bases(&dir, &[0, 10, 20, 30]);

        let tail = set.split_off(20);
        assert_eq!(tail.len(), 2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.active().base_offset(), 10);
    }
}
