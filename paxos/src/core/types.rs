//! Core type definitions for the Paxos protocol
//!
//! These types are shared between the async runtime and the model checker.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// =============================================================================
// PROPOSAL ID
// =============================================================================

/// Ordering key for proposals - compares by (`round`, `node`).
///
/// Lexicographic ordering on the two fields gives every proposer a disjoint
/// set of identifiers: two proposers using the same round number are ordered
/// by their node id, so `(1, "node-b")` beats `(1, "node-a")`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProposalId<N> {
    /// Round number, strictly increasing per proposer and instance
    pub round: u64,
    /// Node that issued the proposal
    pub node: N,
}

impl<N> ProposalId<N> {
    #[must_use]
    pub fn new(round: u64, node: N) -> Self {
        Self { round, node }
    }
}

impl<N: fmt::Display> fmt::Display for ProposalId<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.round, self.node)
    }
}

/// Number of matching responses needed out of `cluster_size` nodes.
#[must_use]
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_dominates_node() {
        let low = ProposalId::new(1, "node-z");
        let high = ProposalId::new(2, "node-a");
        assert!(high > low);
    }

    #[test]
    fn test_node_breaks_ties() {
        let a = ProposalId::new(1, "node-a");
        let b = ProposalId::new(1, "node-b");
        assert!(b > a);
        assert_eq!([a, b].into_iter().max(), Some(b));
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }
}
