//! Acceptor handler for processing Paxos protocol messages.

use std::time::Duration;

use tracing::{debug, trace};

use super::SharedAcceptorState;
use crate::core::{AcceptResult, PrepareResult};
use crate::messages::{Envelope, Request, Response};
use crate::traits::{DecisionOf, Learner, ProposalOf, Protocol};

/// Answers protocol requests for every instance on one node.
///
/// Decisions flow into the [`Learner`], which outlives the per-instance
/// acceptor state and is consulted whenever a collected instance comes back.
pub struct AcceptorHandler<P: Protocol, L> {
    node_id: P::NodeId,
    state: SharedAcceptorState<P>,
    learner: L,
}

impl<P, L> AcceptorHandler<P, L>
where
    P: Protocol,
    L: Learner<P>,
{
    pub fn new(node_id: P::NodeId, learner: L) -> Self {
        Self {
            node_id,
            state: SharedAcceptorState::new(),
            learner,
        }
    }

    pub fn node_id(&self) -> &P::NodeId {
        &self.node_id
    }

    pub fn state(&self) -> &SharedAcceptorState<P> {
        &self.state
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    /// Dispatch one inbound request.
    pub fn handle(&self, envelope: Envelope<P::NodeId, Request<P>>) -> Response<P> {
        let Envelope { from, body } = envelope;
        trace!(node = %self.node_id, %from, request = ?body, "handling request");
        match body {
            Request::Prepare { key, proposal } => self.handle_prepare(&key, proposal),
            Request::Accept {
                key,
                proposal,
                value,
            } => self.handle_accept(&key, proposal, value),
            Request::Learn {
                key,
                proposal,
                value,
            } => {
                self.commit(&key, &proposal, &value);
                Response::Learned
            }
            Request::Query { key } => self.handle_query(&key),
        }
    }

    fn handle_prepare(&self, key: &P::Key, proposal: ProposalOf<P>) -> Response<P> {
        let result = self.state.with_slot(
            key,
            || self.learner.decided(key),
            |slot| slot.core.prepare(proposal.clone()),
        );
        match result {
            PrepareResult::Promised { prior } => {
                trace!(?key, %proposal, "promised");
                Response::Promise { proposal, prior }
            }
            PrepareResult::Rejected { promised } => {
                trace!(?key, %proposal, %promised, "prepare rejected - outdated");
                Response::Reject { proposal, promised }
            }
        }
    }

    fn handle_accept(&self, key: &P::Key, proposal: ProposalOf<P>, value: P::Value) -> Response<P> {
        let result = self.state.with_slot(
            key,
            || self.learner.decided(key),
            |slot| slot.core.accept(proposal.clone(), value.clone()),
        );
        match result {
            AcceptResult::Accepted => {
                trace!(?key, %proposal, "accepted");
                Response::Accepted { proposal, value }
            }
            AcceptResult::Rejected { promised } => {
                trace!(?key, %proposal, %promised, "accept rejected - outdated");
                Response::Reject { proposal, promised }
            }
        }
    }

    fn handle_query(&self, key: &P::Key) -> Response<P> {
        let (accepted, decided) = self.state.inspect(key).unwrap_or_default();
        Response::Report {
            accepted,
            decided: decided.or_else(|| self.learner.decided(key)),
        }
    }

    /// Decision known locally for `key`
    pub fn decided(&self, key: &P::Key) -> Option<DecisionOf<P>> {
        self.learner.decided(key)
    }

    /// Record a decided value on this node.
    ///
    /// Returns `true` if the learner did not know the decision before.
    pub fn commit(&self, key: &P::Key, proposal: &ProposalOf<P>, value: &P::Value) -> bool {
        self.state.with_slot(
            key,
            || None,
            |slot| slot.learn((proposal.clone(), value.clone())),
        );
        let learned = self.learner.learn(key, proposal, value);
        if learned {
            debug!(node = %self.node_id, ?key, %proposal, ?value, "learned decision");
        }
        learned
    }

    /// Drop acceptor state of instances decided at least `retention` ago.
    pub fn collect_garbage(&self, retention: Duration) -> Vec<P::Key> {
        let collected = self.state.collect_garbage(retention);
        if !collected.is_empty() {
            debug!(node = %self.node_id, count = collected.len(), "collected decided instances");
        }
        collected
    }
}
