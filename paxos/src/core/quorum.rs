//! Pure quorum tracking - counts identical reports and detects quorum
//!
//! Used by the query learner: a value accepted by a majority under the same
//! proposal is chosen.

use std::collections::BTreeMap;

use super::types::quorum;

/// Pure quorum tracker keyed by proposal
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct QuorumCore<K, M>
where
    K: Ord,
{
    /// Map from proposal key to (count, message)
    counts: BTreeMap<K, (usize, M)>,
    /// Quorum threshold
    quorum: usize,
}

impl<K, M> QuorumCore<K, M>
where
    K: Ord + Clone,
    M: Clone,
{
    /// Create a new quorum tracker over a cluster of `cluster_size` nodes
    #[must_use]
    pub(crate) fn new(cluster_size: usize) -> Self {
        Self {
            counts: BTreeMap::new(),
            quorum: quorum(cluster_size),
        }
    }

    #[must_use]
    pub(crate) fn quorum(&self) -> usize {
        self.quorum
    }

    /// Track one report of `message` accepted under `key`.
    ///
    /// Returns `Some(&message)` if quorum was JUST reached (exactly),
    /// `None` otherwise. Callers must track each reporting node only once.
    pub(crate) fn track(&mut self, key: K, message: M) -> Option<&M> {
        let entry = self.counts.entry(key).or_insert_with(|| (0, message));
        entry.0 += 1;
        if entry.0 == self.quorum {
            Some(&entry.1)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_reached_exactly_once() {
        let mut core: QuorumCore<u64, &str> = QuorumCore::new(3);
        assert_eq!(core.quorum(), 2);
        assert_eq!(core.track(1, "x"), None);
        assert_eq!(core.track(1, "x"), Some(&"x"));
        assert_eq!(core.track(1, "x"), None);
    }

    #[test]
    fn test_different_keys_counted_apart() {
        let mut core: QuorumCore<u64, &str> = QuorumCore::new(3);
        assert_eq!(core.track(1, "x"), None);
        assert_eq!(core.track(2, "y"), None);
        assert_eq!(core.track(2, "y"), Some(&"y"));
    }
}
