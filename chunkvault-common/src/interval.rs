use std::collections::BTreeMap;

/// Ordered map from disjoint, inclusive `u64` intervals to values.
///
/// Inserting over existing intervals carves the overlapped part out of them; the remainders keep
/// their old value. Adjacent intervals with equal values are merged on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalMap<V> {
    // start -> (inclusive end, value)
    map: BTreeMap<u64, (u64, V)>,
}

impl<V> Default for IntervalMap<V> {
    fn default() -> Self {
        Self { map: BTreeMap::new() }
    }
}

impl<V: Clone + PartialEq> IntervalMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored intervals
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        self.get_interval(key).map(|(_, _, v)| v)
    }

    /// The interval containing `key`, as `(start, end, value)`
    pub fn get_interval(&self, key: u64) -> Option<(u64, u64, &V)> {
        let (&start, (end, value)) = self.map.range(..=key).next_back()?;
        if *end >= key {
            Some((start, *end, value))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &V)> + '_ {
        self.map.iter().map(|(&start, (end, value))| (start, *end, value))
    }

    /// Intervals overlapping `[start, end]`, clipped to the bounds, in ascending order
    pub fn overlapping(&self, start: u64, end: u64) -> Vec<(u64, u64, &V)> {
        if start > end {
            return Vec::new();
        }
        let mut pieces: Vec<(u64, u64, &V)> = self
            .map
            .range(..=end)
            .rev()
            .take_while(|(_, (e, _))| *e >= start)
            .map(|(&s, (e, value))| (s.max(start), (*e).min(end), value))
            .collect();
        pieces.reverse();
        pieces
    }

    /// Map `[start, end]` to `value`, replacing whatever covered it before
    pub fn insert(&mut self, start: u64, end: u64, value: V) {
        if start > end {
            return;
        }
        self.carve(start, end);
        self.insert_merged(start, end, value);
    }

    /// Drop every mapping inside `[start, end]`. Returns the number of pieces removed.
    pub fn remove(&mut self, start: u64, end: u64) -> usize {
        if start > end {
            return 0;
        }
        self.carve(start, end).len()
    }

    /// Apply `f` to the values covering `[start, end]`, splitting intervals at the bounds.
    /// Returns the number of pieces touched.
    pub fn update_range<F>(&mut self, start: u64, end: u64, mut f: F) -> usize
    where
        F: FnMut(&mut V),
    {
        if start > end {
            return 0;
        }
        let pieces = self.carve(start, end);
        let touched = pieces.len();
        for (piece_start, piece_end, mut value) in pieces {
            f(&mut value);
            self.insert_merged(piece_start, piece_end, value);
        }
        touched
    }

    /// Keep only the intervals for which `keep` returns true. Returns the number dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(u64, u64, &V) -> bool,
    {
        let before = self.map.len();
        self.map.retain(|&start, (end, value)| keep(start, *end, value));
        before - self.map.len()
    }

    /// Remove everything overlapping `[start, end]` and return the overlapped pieces, clipped to the
    /// bounds. Remainders outside the bounds are put back unchanged.
    fn carve(&mut self, start: u64, end: u64) -> Vec<(u64, u64, V)> {
        let overlapping: Vec<u64> = self
            .map
            .range(..=end)
            .rev()
            .take_while(|(_, (e, _))| *e >= start)
            .map(|(&k, _)| k)
            .collect();

        let mut pieces = Vec::with_capacity(overlapping.len());
        for key in overlapping {
            let Some((e, value)) = self.map.remove(&key) else {
                continue;
            };
            if key < start {
                self.map.insert(key, (start - 1, value.clone()));
            }
            if e > end {
                self.map.insert(end + 1, (e, value.clone()));
            }
            pieces.push((key.max(start), e.min(end), value));
        }
        pieces
    }

    fn insert_merged(&mut self, mut start: u64, mut end: u64, value: V) {
        if start > 0 {
            let left = self
                .map
                .range(..start)
                .next_back()
                .filter(|(_, (e, v))| *e == start - 1 && *v == value)
                .map(|(&k, _)| k);
            if let Some(k) = left {
                self.map.remove(&k);
                start = k;
            }
        }
        if end < u64::MAX {
            let right = self
                .map
                .get(&(end + 1))
                .filter(|(_, v)| *v == value)
                .map(|(e, _)| *e);
            if let Some(e) = right {
                self.map.remove(&(end + 1));
                end = e;
            }
        }
        self.map.insert(start, (end, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn test_insert_and_merge() {
        let mut map = IntervalMap::new();
        map.insert(0, 9, 'a');
        map.insert(10, 19, 'a');
        assert_eq!(map.len(), 1);
        assert_eq!(map.get_interval(15), Some((0, 19, &'a')));

        map.insert(20, 29, 'b');
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(30), None);
    }

    #[test]
    fn test_insert_carves_overlaps() {
        let mut map = IntervalMap::new();
        map.insert(0, 99, 1);
        map.insert(40, 59, 2);

        let intervals: Vec<_> = map.iter().map(|(s, e, v)| (s, e, *v)).collect();
        assert_eq!(intervals, vec![(0, 39, 1), (40, 59, 2), (60, 99, 1)]);

        // Overwrite spanning several intervals
        map.insert(30, 70, 3);
        let intervals: Vec<_> = map.iter().map(|(s, e, v)| (s, e, *v)).collect();
        assert_eq!(intervals, vec![(0, 29, 1), (30, 70, 3), (71, 99, 1)]);
    }

    #[test]
    fn test_remove_and_update() {
        let mut map = IntervalMap::new();
        map.insert(0, 99, 1);
        assert_eq!(map.remove(10, 19), 1);
        assert_eq!(map.get(15), None);
        assert_eq!(map.get(9), Some(&1));
        assert_eq!(map.get(20), Some(&1));

        assert_eq!(map.update_range(5, 25, |v| *v = 7), 2);
        let intervals: Vec<_> = map.iter().map(|(s, e, v)| (s, e, *v)).collect();
        assert_eq!(intervals, vec![(0, 4, 1), (5, 9, 7), (20, 25, 7), (26, 99, 1)]);

        assert_eq!(map.retain(|_, _, v| *v != 7), 2);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_overlapping_is_clipped() {
        let mut map = IntervalMap::new();
        map.insert(0, 9, 'a');
        map.insert(20, 29, 'b');
        map.insert(40, 49, 'c');

        assert_eq!(map.overlapping(5, 24), vec![(5, 9, &'a'), (20, 24, &'b')]);
        assert_eq!(map.overlapping(10, 19), vec![]);
        assert_eq!(map.overlapping(45, 45), vec![(45, 45, &'c')]);
        assert!(map.overlapping(9, 5).is_empty());
    }

    #[test]
    fn test_extreme_bounds() {
        let mut map = IntervalMap::new();
        map.insert(0, u64::MAX, 'x');
        map.insert(u64::MAX, u64::MAX, 'y');
        map.insert(0, 0, 'y');
        assert_eq!(map.get(u64::MAX), Some(&'y'));
        assert_eq!(map.get(0), Some(&'y'));
        assert_eq!(map.get(1), Some(&'x'));
    }

    proptest! {
        #[test]
        fn prop_matches_point_model(ops in prop::collection::vec((0u64..64, 0u64..16, 0u8..3, any::<bool>()), 1..40)) {
            let mut map = IntervalMap::new();
            let mut model: HashMap<u64, u8> = HashMap::new();

            for (start, len, value, is_insert) in ops {
                let end = start + len;
                if is_insert {
                    map.insert(start, end, value);
                    for k in start..=end {
                        model.insert(k, value);
                    }
                } else {
                    map.remove(start, end);
                    for k in start..=end {
                        model.remove(&k);
                    }
                }
            }

            for k in 0..96 {
                prop_assert_eq!(map.get(k), model.get(&k));
            }

            // Disjoint, sorted and fully merged
            let intervals: Vec<_> = map.iter().map(|(s, e, v)| (s, e, *v)).collect();
            for pair in intervals.windows(2) {
                prop_assert!(pair[0].1 < pair[1].0);
                prop_assert!(!(pair[0].1 + 1 == pair[1].0 && pair[0].2 == pair[1].2));
            }
        }
    }
}
