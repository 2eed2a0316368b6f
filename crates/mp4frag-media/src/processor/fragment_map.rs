//! Old-to-new `moof` offset map.

use crate::{Error, Result};

/// Sorted `(before, after)` offset pairs recorded while fragments are
/// rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentMap {
    entries: Vec<(u64, u64)>,
}

impl FragmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the `moof` at `before` now lives at `after`. `before`
    /// values must be inserted in increasing order.
    pub fn insert(&mut self, before: u64, after: u64) -> Result<()> {
        if let Some(&(last, _)) = self.entries.last() {
            if before <= last {
                return Err(Error::invalid_parameters(format!(
                    "fragment offset {before} inserted after {last}"
                )));
            }
        }
        self.entries.push((before, after));
        Ok(())
    }

    /// New offset of the `moof` that was at `before`. Only exact matches
    /// are found.
    pub fn get(&self, before: u64) -> Option<u64> {
        self.entries
            .binary_search_by_key(&before, |&(b, _)| b)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> FragmentMap {
        let mut map = FragmentMap::new();
        for (before, after) in [(100, 90), (2000, 1800), (2001, 5), (70_000, 69_000)] {
            map.insert(before, after).unwrap();
        }
        map
    }

    #[test]
    fn test_exact_lookups() {
        let map = map();
        assert_eq!(map.get(100), Some(90));
        assert_eq!(map.get(2000), Some(1800));
        assert_eq!(map.get(2001), Some(5));
        assert_eq!(map.get(70_000), Some(69_000));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_misses_never_return_a_neighbour() {
        let map = map();
        for missing in [0, 99, 101, 1999, 2002, 69_999, u64::MAX] {
            assert_eq!(map.get(missing), None, "{missing}");
        }
        assert_eq!(FragmentMap::new().get(100), None);
    }

    #[test]
    fn test_out_of_order_insert() {
        let mut map = map();
        let err = map.insert(2000, 1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidParameters);
        assert_eq!(map.len(), 4);
    }
}
