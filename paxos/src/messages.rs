//! Paxos protocol messages

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::traits::{DecisionOf, ProposalOf, Protocol};

/// A message body tagged with the id of the node that sent it
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Envelope<N, B> {
    pub from: N,
    pub body: B,
}

impl<N, B> Envelope<N, B> {
    pub fn new(from: N, body: B) -> Self {
        Self { from, body }
    }
}

/// Messages from proposer/learner to acceptor
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "P::Key: Serialize, P::NodeId: Serialize, P::Value: Serialize",
        deserialize = "P::Key: Deserialize<'de>, P::NodeId: Deserialize<'de>, P::Value: Deserialize<'de>"
    ))
)]
pub enum Request<P: Protocol> {
    /// Phase 1a
    Prepare {
        key: P::Key,
        proposal: ProposalOf<P>,
    },
    /// Phase 2a
    Accept {
        key: P::Key,
        proposal: ProposalOf<P>,
        value: P::Value,
    },
    /// Best-effort announcement of a decided value
    Learn {
        key: P::Key,
        proposal: ProposalOf<P>,
        value: P::Value,
    },
    /// Read-only query of the acceptor state of one instance
    Query { key: P::Key },
}

impl<P: Protocol> Request<P> {
    #[must_use]
    pub fn key(&self) -> &P::Key {
        match self {
            Self::Prepare { key, .. }
            | Self::Accept { key, .. }
            | Self::Learn { key, .. }
            | Self::Query { key } => key,
        }
    }
}

impl<P: Protocol> Clone for Request<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Prepare { key, proposal } => Self::Prepare {
                key: key.clone(),
                proposal: proposal.clone(),
            },
            Self::Accept {
                key,
                proposal,
                value,
            } => Self::Accept {
                key: key.clone(),
                proposal: proposal.clone(),
                value: value.clone(),
            },
            Self::Learn {
                key,
                proposal,
                value,
            } => Self::Learn {
                key: key.clone(),
                proposal: proposal.clone(),
                value: value.clone(),
            },
            Self::Query { key } => Self::Query { key: key.clone() },
        }
    }
}

impl<P: Protocol> fmt::Debug for Request<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare { key, proposal } => f
                .debug_struct("Prepare")
                .field("key", key)
                .field("proposal", proposal)
                .finish(),
            Self::Accept {
                key,
                proposal,
                value,
            } => f
                .debug_struct("Accept")
                .field("key", key)
                .field("proposal", proposal)
                .field("value", value)
                .finish(),
            Self::Learn {
                key,
                proposal,
                value,
            } => f
                .debug_struct("Learn")
                .field("key", key)
                .field("proposal", proposal)
                .field("value", value)
                .finish(),
            Self::Query { key } => f.debug_struct("Query").field("key", key).finish(),
        }
    }
}

impl<P: Protocol> PartialEq for Request<P> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Prepare { key, proposal },
                Self::Prepare {
                    key: k2,
                    proposal: p2,
                },
            ) => key == k2 && proposal == p2,
            (
                Self::Accept {
                    key,
                    proposal,
                    value,
                },
                Self::Accept {
                    key: k2,
                    proposal: p2,
                    value: v2,
                },
            )
            | (
                Self::Learn {
                    key,
                    proposal,
                    value,
                },
                Self::Learn {
                    key: k2,
                    proposal: p2,
                    value: v2,
                },
            ) => key == k2 && proposal == p2 && value == v2,
            (Self::Query { key }, Self::Query { key: k2 }) => key == k2,
            _ => false,
        }
    }
}

/// Messages from acceptor to proposer/learner
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "P::NodeId: Serialize, P::Value: Serialize",
        deserialize = "P::NodeId: Deserialize<'de>, P::Value: Deserialize<'de>"
    ))
)]
pub enum Response<P: Protocol> {
    /// Phase 1b - carries the previously accepted value, if any
    Promise {
        proposal: ProposalOf<P>,
        prior: Option<DecisionOf<P>>,
    },
    /// The acceptor has promised a higher proposal
    Reject {
        proposal: ProposalOf<P>,
        promised: ProposalOf<P>,
    },
    /// Phase 2b
    Accepted {
        proposal: ProposalOf<P>,
        value: P::Value,
    },
    /// Acknowledges a `Learn`
    Learned,
    /// Answer to a `Query`
    Report {
        accepted: Option<DecisionOf<P>>,
        decided: Option<DecisionOf<P>>,
    },
}

impl<P: Protocol> Clone for Response<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Promise { proposal, prior } => Self::Promise {
                proposal: proposal.clone(),
                prior: prior.clone(),
            },
            Self::Reject { proposal, promised } => Self::Reject {
                proposal: proposal.clone(),
                promised: promised.clone(),
            },
            Self::Accepted { proposal, value } => Self::Accepted {
                proposal: proposal.clone(),
                value: value.clone(),
            },
            Self::Learned => Self::Learned,
            Self::Report { accepted, decided } => Self::Report {
                accepted: accepted.clone(),
                decided: decided.clone(),
            },
        }
    }
}

impl<P: Protocol> fmt::Debug for Response<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promise { proposal, prior } => f
                .debug_struct("Promise")
                .field("proposal", proposal)
                .field("prior", prior)
                .finish(),
            Self::Reject { proposal, promised } => f
                .debug_struct("Reject")
                .field("proposal", proposal)
                .field("promised", promised)
                .finish(),
            Self::Accepted { proposal, value } => f
                .debug_struct("Accepted")
                .field("proposal", proposal)
                .field("value", value)
                .finish(),
            Self::Learned => f.write_str("Learned"),
            Self::Report { accepted, decided } => f
                .debug_struct("Report")
                .field("accepted", accepted)
                .field("decided", decided)
                .finish(),
        }
    }
}

impl<P: Protocol> PartialEq for Response<P> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Promise { proposal, prior },
                Self::Promise {
                    proposal: p2,
                    prior: r2,
                },
            ) => proposal == p2 && prior == r2,
            (
                Self::Reject { proposal, promised },
                Self::Reject {
                    proposal: p2,
                    promised: r2,
                },
            ) => proposal == p2 && promised == r2,
            (
                Self::Accepted { proposal, value },
                Self::Accepted {
                    proposal: p2,
                    value: v2,
                },
            ) => proposal == p2 && value == v2,
            (Self::Learned, Self::Learned) => true,
            (
                Self::Report { accepted, decided },
                Self::Report {
                    accepted: a2,
                    decided: d2,
                },
            ) => accepted == a2 && decided == d2,
            _ => false,
        }
    }
}
