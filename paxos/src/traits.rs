//! Core Paxos traits.

use core::fmt;
use core::future::Future;
use core::hash::Hash;
use std::sync::Arc;

use error_stack::Report;

use crate::core::ProposalId;
use crate::messages::{Envelope, Request, Response};

/// Failure to deliver a request or receive its response.
#[derive(Debug)]
pub struct TransportError;

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transport failed")
    }
}

impl core::error::Error for TransportError {}

/// The types a family of consensus instances agrees over.
///
/// Every `Key` is an independent single-decree instance.
pub trait Protocol: Send + Sync + 'static {
    type Key: Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static;
    type NodeId: Clone + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Value: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
}

/// Proposal id of a protocol.
pub type ProposalOf<P> = ProposalId<<P as Protocol>::NodeId>;

/// Decided `(proposal, value)` pair of a protocol.
pub type DecisionOf<P> = (ProposalOf<P>, <P as Protocol>::Value);

/// Local projection of decided values.
///
/// Decisions are final: once `learn` succeeded for a key, `decided` must keep
/// returning that pair, even after the acceptor state for the key has been
/// garbage collected.
pub trait Learner<P: Protocol>: Send + Sync + 'static {
    /// Record a decided value. Returns `true` if the decision was not known before.
    fn learn(&self, key: &P::Key, proposal: &ProposalOf<P>, value: &P::Value) -> bool;

    fn decided(&self, key: &P::Key) -> Option<DecisionOf<P>>;

    /// Called before every round this node proposes.
    fn proposing(&self, key: &P::Key, proposal: &ProposalOf<P>, value: &P::Value) {
        let _ = (key, proposal, value);
    }
}

impl<P: Protocol, L: Learner<P>> Learner<P> for Arc<L> {
    fn learn(&self, key: &P::Key, proposal: &ProposalOf<P>, value: &P::Value) -> bool {
        (**self).learn(key, proposal, value)
    }

    fn decided(&self, key: &P::Key) -> Option<DecisionOf<P>> {
        (**self).decided(key)
    }

    fn proposing(&self, key: &P::Key, proposal: &ProposalOf<P>, value: &P::Value) {
        (**self).proposing(key, proposal, value);
    }
}

/// Request/response channel to the acceptors of other nodes.
pub trait Transport<P: Protocol>: Send + Sync + 'static {
    fn call(
        &self,
        to: P::NodeId,
        request: Envelope<P::NodeId, Request<P>>,
    ) -> impl Future<Output = Result<Response<P>, Report<TransportError>>> + Send;
}
