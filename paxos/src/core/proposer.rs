//! Pure proposer state machine - no I/O, no async
//!
//! Tracks the phase and the responses of a single proposal round.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{ProposalId, quorum};

/// Pure proposer state for one round of one instance.
///
/// Quorum is computed over the full static cluster, while `targets` is the
/// number of nodes the round was actually sent to. Once too many targets have
/// rejected or gone silent for a quorum to be reachable, the round fails.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProposerCore<N, V> {
    /// Current proposal id
    proposal: ProposalId<N>,
    /// Value being proposed (or adopted from a prior accepted value)
    value: V,
    phase: ProposerPhase<N, V>,
    quorum: usize,
    targets: usize,
    /// Highest competing proposal reported by a rejection
    superseded_by: Option<ProposalId<N>>,
}

/// Proposer phase
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ProposerPhase<N, V> {
    /// Collecting promises (Phase 1)
    Preparing {
        /// Map from acceptor to the value it had accepted, if any
        promises: BTreeMap<N, Option<(ProposalId<N>, V)>>,
        /// Acceptors that rejected or could not be reached
        refused: BTreeSet<N>,
    },
    /// Collecting accepts (Phase 2)
    Accepting {
        accepts: BTreeSet<N>,
        refused: BTreeSet<N>,
    },
    /// Reached quorum of accepts
    Decided,
    /// Quorum can no longer be reached in this round
    Failed,
}

/// Result of processing a response during the Prepare phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreparePhaseResult<N, V> {
    /// Need more promises
    Pending,
    /// Response referred to a different proposal and was ignored
    Stale,
    /// Got quorum - ready to accept with this value
    Quorum { value: V },
    /// Too many refusals, round failed
    Rejected { superseded_by: Option<ProposalId<N>> },
}

/// Result of processing a response during the Accept phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptPhaseResult<N, V> {
    Pending,
    Stale,
    /// Got quorum - value is decided
    Decided { proposal: ProposalId<N>, value: V },
    Rejected { superseded_by: Option<ProposalId<N>> },
}

impl<N, V> ProposerCore<N, V>
where
    N: Ord + Clone,
    V: Clone,
{
    /// Create a new proposer core in the Preparing phase
    #[must_use]
    pub fn new(proposal: ProposalId<N>, value: V, cluster_size: usize, targets: usize) -> Self {
        Self {
            proposal,
            value,
            phase: ProposerPhase::Preparing {
                promises: BTreeMap::new(),
                refused: BTreeSet::new(),
            },
            quorum: quorum(cluster_size),
            targets,
            superseded_by: None,
        }
    }

    #[must_use]
    pub fn proposal(&self) -> &ProposalId<N> {
        &self.proposal
    }

    /// The value that will be (or was) sent with Accept
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    #[must_use]
    pub fn superseded_by(&self) -> Option<&ProposalId<N>> {
        self.superseded_by.as_ref()
    }

    #[must_use]
    pub fn is_preparing(&self) -> bool {
        matches!(self.phase, ProposerPhase::Preparing { .. })
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        matches!(self.phase, ProposerPhase::Accepting { .. })
    }

    #[must_use]
    pub fn is_decided(&self) -> bool {
        matches!(self.phase, ProposerPhase::Decided)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.phase, ProposerPhase::Failed)
    }

    /// Whether enough targets remain for this round to reach quorum.
    #[must_use]
    pub fn quorum_reachable(&self) -> bool {
        let refused = match &self.phase {
            ProposerPhase::Preparing { refused, .. } | ProposerPhase::Accepting { refused, .. } => {
                refused.len()
            }
            ProposerPhase::Decided => return true,
            ProposerPhase::Failed => return false,
        };
        self.targets.saturating_sub(refused) >= self.quorum
    }

    /// Process a Promise during the Prepare phase.
    ///
    /// On quorum, adopts the prior value with the highest proposal id among
    /// the promises, falling back to our own value.
    pub fn handle_promise(
        &mut self,
        from: N,
        for_proposal: &ProposalId<N>,
        prior: Option<(ProposalId<N>, V)>,
    ) -> PreparePhaseResult<N, V> {
        if *for_proposal != self.proposal {
            return PreparePhaseResult::Stale;
        }
        let ProposerPhase::Preparing { promises, refused } = &mut self.phase else {
            return PreparePhaseResult::Pending; // Wrong phase
        };

        refused.remove(&from);
        promises.insert(from, prior);

        if promises.len() < self.quorum {
            return PreparePhaseResult::Pending;
        }

        let highest_prior = promises
            .values()
            .filter_map(Option::as_ref)
            .max_by(|(p1, _), (p2, _)| p1.cmp(p2))
            .map(|(_, value)| value.clone());
        if let Some(value) = highest_prior {
            self.value = value;
        }

        self.phase = ProposerPhase::Accepting {
            accepts: BTreeSet::new(),
            refused: BTreeSet::new(),
        };
        PreparePhaseResult::Quorum {
            value: self.value.clone(),
        }
    }

    /// Process a Reject during the Prepare phase.
    pub fn handle_prepare_reject(
        &mut self,
        from: N,
        for_proposal: &ProposalId<N>,
        promised: ProposalId<N>,
    ) -> PreparePhaseResult<N, V> {
        if *for_proposal != self.proposal {
            return PreparePhaseResult::Stale;
        }
        self.observe(promised);
        self.refuse_prepare(from)
    }

    /// Record a target that could not be reached during the Prepare phase.
    pub fn handle_prepare_silence(&mut self, from: N) -> PreparePhaseResult<N, V> {
        self.refuse_prepare(from)
    }

    fn refuse_prepare(&mut self, from: N) -> PreparePhaseResult<N, V> {
        let ProposerPhase::Preparing { promises, refused } = &mut self.phase else {
            return PreparePhaseResult::Pending;
        };
        if !promises.contains_key(&from) {
            refused.insert(from);
        }
        if self.quorum_reachable() {
            PreparePhaseResult::Pending
        } else {
            self.phase = ProposerPhase::Failed;
            PreparePhaseResult::Rejected {
                superseded_by: self.superseded_by.clone(),
            }
        }
    }

    /// Process an Accepted during the Accept phase.
    pub fn handle_accepted(
        &mut self,
        from: N,
        for_proposal: &ProposalId<N>,
    ) -> AcceptPhaseResult<N, V> {
        if *for_proposal != self.proposal {
            return AcceptPhaseResult::Stale;
        }
        let ProposerPhase::Accepting { accepts, refused } = &mut self.phase else {
            return AcceptPhaseResult::Pending;
        };

        refused.remove(&from);
        accepts.insert(from);

        if accepts.len() >= self.quorum {
            self.phase = ProposerPhase::Decided;
            AcceptPhaseResult::Decided {
                proposal: self.proposal.clone(),
                value: self.value.clone(),
            }
        } else {
            AcceptPhaseResult::Pending
        }
    }

    /// Process a Reject during the Accept phase.
    pub fn handle_accept_reject(
        &mut self,
        from: N,
        for_proposal: &ProposalId<N>,
        promised: ProposalId<N>,
    ) -> AcceptPhaseResult<N, V> {
        if *for_proposal != self.proposal {
            return AcceptPhaseResult::Stale;
        }
        self.observe(promised);
        self.refuse_accept(from)
    }

    /// Record a target that could not be reached during the Accept phase.
    pub fn handle_accept_silence(&mut self, from: N) -> AcceptPhaseResult<N, V> {
        self.refuse_accept(from)
    }

    fn refuse_accept(&mut self, from: N) -> AcceptPhaseResult<N, V> {
        let ProposerPhase::Accepting { accepts, refused } = &mut self.phase else {
            return AcceptPhaseResult::Pending;
        };
        if !accepts.contains(&from) {
            refused.insert(from);
        }
        if self.quorum_reachable() {
            AcceptPhaseResult::Pending
        } else {
            self.phase = ProposerPhase::Failed;
            AcceptPhaseResult::Rejected {
                superseded_by: self.superseded_by.clone(),
            }
        }
    }

    fn observe(&mut self, promised: ProposalId<N>) {
        if promised > self.proposal && self.superseded_by.as_ref().is_none_or(|s| promised > *s) {
            self.superseded_by = Some(promised);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Core = ProposerCore<&'static str, &'static str>;

    fn id(round: u64, node: &'static str) -> ProposalId<&'static str> {
        ProposalId::new(round, node)
    }

    #[test]
    fn test_quorum_with_own_value() {
        let mut core = Core::new(id(1, "a"), "mine", 3, 3);
        assert_eq!(
            core.handle_promise("a", &id(1, "a"), None),
            PreparePhaseResult::Pending
        );
        assert_eq!(
            core.handle_promise("b", &id(1, "a"), None),
            PreparePhaseResult::Quorum { value: "mine" }
        );
        assert!(core.is_accepting());
    }

    #[test]
    fn test_adopts_highest_prior() {
        let mut core = Core::new(id(5, "a"), "mine", 5, 5);
        core.handle_promise("a", &id(5, "a"), Some((id(2, "b"), "older")));
        core.handle_promise("b", &id(5, "a"), Some((id(3, "c"), "newer")));
        let result = core.handle_promise("c", &id(5, "a"), None);
        assert_eq!(result, PreparePhaseResult::Quorum { value: "newer" });
        assert_eq!(*core.value(), "newer");
    }

    #[test]
    fn test_duplicate_promises_count_once() {
        let mut core = Core::new(id(1, "a"), "mine", 3, 3);
        core.handle_promise("b", &id(1, "a"), None);
        assert_eq!(
            core.handle_promise("b", &id(1, "a"), None),
            PreparePhaseResult::Pending
        );
    }

    #[test]
    fn test_stale_promise_ignored() {
        let mut core = Core::new(id(2, "a"), "mine", 3, 3);
        assert_eq!(
            core.handle_promise("b", &id(1, "a"), None),
            PreparePhaseResult::Stale
        );
        assert!(core.is_preparing());
    }

    #[test]
    fn test_majority_reject_fails_round() {
        let mut core = Core::new(id(1, "a"), "mine", 3, 3);
        assert_eq!(
            core.handle_prepare_reject("b", &id(1, "a"), id(4, "b")),
            PreparePhaseResult::Pending
        );
        assert_eq!(
            core.handle_prepare_reject("c", &id(1, "a"), id(2, "c")),
            PreparePhaseResult::Rejected {
                superseded_by: Some(id(4, "b"))
            }
        );
        assert!(core.is_failed());
    }

    #[test]
    fn test_quorum_counts_full_cluster() {
        // Only two of five nodes targeted: quorum of three can never be reached
        let core = Core::new(id(1, "a"), "mine", 5, 2);
        assert!(!core.quorum_reachable());
    }

    #[test]
    fn test_silence_counts_against_quorum() {
        let mut core = Core::new(id(1, "a"), "mine", 3, 3);
        core.handle_promise("a", &id(1, "a"), None);
        assert_eq!(core.handle_prepare_silence("b"), PreparePhaseResult::Pending);
        assert_eq!(
            core.handle_prepare_silence("c"),
            PreparePhaseResult::Rejected {
                superseded_by: None
            }
        );
    }

    #[test]
    fn test_accept_quorum_decides() {
        let mut core = Core::new(id(1, "a"), "mine", 3, 3);
        core.handle_promise("a", &id(1, "a"), None);
        core.handle_promise("b", &id(1, "a"), None);
        assert_eq!(core.handle_accepted("a", &id(1, "a")), AcceptPhaseResult::Pending);
        assert_eq!(
            core.handle_accepted("c", &id(1, "a")),
            AcceptPhaseResult::Decided {
                proposal: id(1, "a"),
                value: "mine"
            }
        );
        assert!(core.is_decided());
    }

    #[test]
    fn test_accept_reject_fails_round() {
        let mut core = Core::new(id(1, "a"), "mine", 3, 3);
        core.handle_promise("a", &id(1, "a"), None);
        core.handle_promise("b", &id(1, "a"), None);
        core.handle_accepted("a", &id(1, "a"));
        assert_eq!(
            core.handle_accept_reject("b", &id(1, "a"), id(2, "c")),
            AcceptPhaseResult::Pending
        );
        assert_eq!(
            core.handle_accept_reject("c", &id(1, "a"), id(2, "c")),
            AcceptPhaseResult::Rejected {
                superseded_by: Some(id(2, "c"))
            }
        );
    }
}
