//! Set of USB addresses and the added/removed diff between two enumerations

use common::UsbAddr;
use std::collections::HashSet;

/// Unordered set of device addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbAddrSet {
    addrs: HashSet<UsbAddr>,
}

/// Result of [`UsbAddrSet::diff`]
///
/// Element order within `added` and `removed` is unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrDiff {
    /// Present in the new set only
    pub added: Vec<UsbAddr>,
    /// Present in the old set only
    pub removed: Vec<UsbAddr>,
}

impl AddrDiff {
    /// True if the two sets were equal
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl UsbAddrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address, returns false if it was already present
    pub fn insert(&mut self, addr: UsbAddr) -> bool {
        self.addrs.insert(addr)
    }

    /// Remove an address, returns false if it was not present
    pub fn remove(&mut self, addr: &UsbAddr) -> bool {
        self.addrs.remove(addr)
    }

    pub fn contains(&self, addr: &UsbAddr) -> bool {
        self.addrs.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsbAddr> {
        self.addrs.iter()
    }

    /// Compute what changed going from `self` to `new`
    ///
    /// Runs in O(|self| + |new|).
    pub fn diff(&self, new: &UsbAddrSet) -> AddrDiff {
        AddrDiff {
            added: new.addrs.difference(&self.addrs).copied().collect(),
            removed: self.addrs.difference(&new.addrs).copied().collect(),
        }
    }
}

impl FromIterator<UsbAddr> for UsbAddrSet {
    fn from_iter<I: IntoIterator<Item = UsbAddr>>(iter: I) -> Self {
        Self {
            addrs: iter.into_iter().collect(),
        }
    }
}

impl Extend<UsbAddr> for UsbAddrSet {
    fn extend<I: IntoIterator<Item = UsbAddr>>(&mut self, iter: I) {
        self.addrs.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(addrs: &[(u8, u8)]) -> UsbAddrSet {
        addrs.iter().map(|&(b, a)| UsbAddr::new(b, a)).collect()
    }

    fn sorted(mut addrs: Vec<UsbAddr>) -> Vec<UsbAddr> {
        addrs.sort();
        addrs
    }

    #[test]
    fn test_diff_from_empty() {
        let new = set(&[(1, 2), (1, 3)]);
        let diff = UsbAddrSet::new().diff(&new);

        assert_eq!(
            sorted(diff.added),
            vec![UsbAddr::new(1, 2), UsbAddr::new(1, 3)]
        );
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_diff_to_empty() {
        let old = set(&[(1, 2), (2, 9)]);
        let diff = old.diff(&UsbAddrSet::new());

        assert!(diff.added.is_empty());
        assert_eq!(
            sorted(diff.removed),
            vec![UsbAddr::new(1, 2), UsbAddr::new(2, 9)]
        );
    }

    #[test]
    fn test_diff_equal_sets() {
        let old = set(&[(1, 2), (2, 9)]);
        let diff = old.diff(&old.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_replug_changes_address() {
        // Same port, new device address after re-plug
        let old = set(&[(1, 4)]);
        let new = set(&[(1, 5)]);
        let diff = old.diff(&new);

        assert_eq!(diff.added, vec![UsbAddr::new(1, 5)]);
        assert_eq!(diff.removed, vec![UsbAddr::new(1, 4)]);
    }

    #[test]
    fn test_duplicates_are_meaningless() {
        let new: UsbAddrSet = [UsbAddr::new(1, 1), UsbAddr::new(1, 1)].into_iter().collect();
        assert_eq!(new.len(), 1);
        assert_eq!(UsbAddrSet::new().diff(&new).added.len(), 1);
    }

    fn addr_set_strategy() -> impl Strategy<Value = UsbAddrSet> {
        // Small domain so that generated sets overlap often
        prop::collection::vec((0u8..3, 0u8..8), 0..24)
            .prop_map(|pairs| pairs.into_iter().map(|(b, a)| UsbAddr::new(b, a)).collect())
    }

    proptest! {
        #[test]
        fn prop_diff_matches_set_difference(
            old in addr_set_strategy(),
            new in addr_set_strategy()
        ) {
            let diff = old.diff(&new);

            for addr in &diff.added {
                prop_assert!(new.contains(addr) && !old.contains(addr));
            }
            for addr in &diff.removed {
                prop_assert!(old.contains(addr) && !new.contains(addr));
            }

            let expected_added = new.iter().filter(|a| !old.contains(a)).count();
            let expected_removed = old.iter().filter(|a| !new.contains(a)).count();
            prop_assert_eq!(diff.added.len(), expected_added);
            prop_assert_eq!(diff.removed.len(), expected_removed);

            prop_assert!(diff.added.iter().all(|a| !diff.removed.contains(a)));
        }

        #[test]
        fn prop_diff_with_self_is_empty(set in addr_set_strategy()) {
            prop_assert!(set.diff(&set).is_empty());
        }

        #[test]
        fn prop_applying_diff_yields_new(old in addr_set_strategy(), new in addr_set_strategy()) {
            let diff = old.diff(&new);
            let mut applied = old.clone();
            for addr in &diff.removed {
                applied.remove(addr);
            }
            applied.extend(diff.added.iter().copied());
            prop_assert_eq!(applied, new);
        }
    }
}
