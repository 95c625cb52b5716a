//! Pure acceptor state machine - no I/O, no async, no synchronization
//!
//! This module contains the core state transition logic for one Paxos
//! instance on one acceptor.

use super::types::ProposalId;

/// Pure acceptor state for a single instance.
///
/// Tracks:
/// - The highest promised proposal
/// - The accepted (proposal, value) pair
/// - The decided (proposal, value) pair, once learned
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AcceptorCore<N, V> {
    pub(crate) promised: Option<ProposalId<N>>,
    pub(crate) accepted: Option<(ProposalId<N>, V)>,
    pub(crate) decided: Option<(ProposalId<N>, V)>,
}

impl<N, V> Default for AcceptorCore<N, V> {
    fn default() -> Self {
        Self {
            promised: None,
            accepted: None,
            decided: None,
        }
    }
}

/// Result of handling a Prepare request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareResult<N, V> {
    /// Promised - carries the previously accepted value (if any)
    Promised { prior: Option<(ProposalId<N>, V)> },
    /// Rejected - an equal or higher proposal was already promised
    Rejected { promised: ProposalId<N> },
}

/// Result of handling an Accept request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptResult<N> {
    Accepted,
    /// Rejected - a higher proposal was already promised
    Rejected { promised: ProposalId<N> },
}

impl<N, V> AcceptorCore<N, V>
where
    N: Ord + Clone,
    V: Clone,
{
    /// Create a new empty acceptor state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the state of an instance whose decision is already known.
    #[must_use]
    pub fn decided_with(proposal: ProposalId<N>, value: V) -> Self {
        Self {
            promised: Some(proposal.clone()),
            accepted: Some((proposal.clone(), value.clone())),
            decided: Some((proposal, value)),
        }
    }

    #[must_use]
    pub fn promised(&self) -> Option<&ProposalId<N>> {
        self.promised.as_ref()
    }

    #[must_use]
    pub fn accepted(&self) -> Option<&(ProposalId<N>, V)> {
        self.accepted.as_ref()
    }

    #[must_use]
    pub fn decided(&self) -> Option<&(ProposalId<N>, V)> {
        self.decided.as_ref()
    }

    /// Handle a Prepare request - pure state transition
    ///
    /// Promises only proposals strictly higher than anything promised so far.
    /// On success returns the currently accepted value so the proposer can
    /// adopt it.
    pub fn prepare(&mut self, proposal: ProposalId<N>) -> PrepareResult<N, V> {
        if let Some(promised) = &self.promised
            && proposal <= *promised
        {
            return PrepareResult::Rejected {
                promised: promised.clone(),
            };
        }

        self.promised = Some(proposal);
        PrepareResult::Promised {
            prior: self.accepted.clone(),
        }
    }

    /// Handle an Accept request - pure state transition
    ///
    /// Accepts any proposal at least as high as the highest promise. The
    /// promise is raised to the accepted proposal so that lower Prepares
    /// issued afterwards are rejected.
    pub fn accept(&mut self, proposal: ProposalId<N>, value: V) -> AcceptResult<N> {
        if let Some(promised) = &self.promised
            && proposal < *promised
        {
            return AcceptResult::Rejected {
                promised: promised.clone(),
            };
        }

        self.promised = Some(proposal.clone());
        self.accepted = Some((proposal, value));
        AcceptResult::Accepted
    }

    /// Record a decided value. Returns `false` if a decision was already known.
    ///
    /// The accepted slot is raised to the decision so later Promises carry it
    /// as their prior value.
    pub fn learn(&mut self, proposal: ProposalId<N>, value: V) -> bool {
        if self.decided.is_some() {
            return false;
        }

        let raise = self
            .accepted
            .as_ref()
            .is_none_or(|(accepted, _)| *accepted < proposal);
        if raise {
            self.accepted = Some((proposal.clone(), value.clone()));
        }
        self.decided = Some((proposal, value));
        true
    }
}
