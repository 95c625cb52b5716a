//! Proposer/learner runtime implementation
//!
//! [`Proposer`] drives rounds of single-decree Paxos for any number of
//! independent keys. Requests to remote acceptors go through a
//! [`Transport`]; the local acceptor is called directly.
//!
//! # Example
//!
//! ```ignore
//! use switchboard_paxos::{AcceptorHandler, Proposer, ProposerConfig};
//!
//! let handler = Arc::new(AcceptorHandler::new(node_id, learner));
//! let proposer = Proposer::new(handler, transport, ProposerConfig::default());
//!
//! let decision = proposer.propose(&key, value, &healthy, cluster_size).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use error_stack::Report;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, info, instrument, trace, warn};

use crate::acceptor::AcceptorHandler;
use crate::config::{BackoffConfig, ProposerConfig, RetryState, Sleep, TokioSleep};
use crate::core::{AcceptPhaseResult, PreparePhaseResult, ProposalId, ProposerCore, QuorumCore};
use crate::messages::{Envelope, Request, Response};
use crate::traits::{Learner, ProposalOf, Protocol, Transport, TransportError};

/// No decision could be reached within the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusFailed {
    /// Rounds attempted before giving up
    pub rounds: u32,
}

impl fmt::Display for ConsensusFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no consensus after {} rounds", self.rounds)
    }
}

impl std::error::Error for ConsensusFailed {}

/// Outcome of a successful `propose`.
pub struct Decision<P: Protocol> {
    pub proposal: ProposalOf<P>,
    /// The decided value - may differ from the proposed one
    pub value: P::Value,
    /// Rounds run by this call (zero if the decision was already known)
    pub rounds: u32,
    /// Rounds of this call that failed before the decision
    pub failed_rounds: u32,
    /// Whether this call recorded the decision locally for the first time
    pub newly_learned: bool,
}

impl<P: Protocol> fmt::Debug for Decision<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decision")
            .field("proposal", &self.proposal)
            .field("value", &self.value)
            .field("rounds", &self.rounds)
            .field("failed_rounds", &self.failed_rounds)
            .field("newly_learned", &self.newly_learned)
            .finish()
    }
}

/// Result of a single round
enum RoundOutcome<P: Protocol> {
    Decided {
        proposal: ProposalOf<P>,
        value: P::Value,
    },
    /// Round failed; carries the highest competing proposal seen, if any
    Failed {
        superseded_by: Option<ProposalOf<P>>,
    },
}

type Reply<P> = (
    <P as Protocol>::NodeId,
    Result<Response<P>, Report<TransportError>>,
);

/// A proposer/learner for every instance on one node.
///
/// Round numbers are tracked per key and only ever grow, so a node never
/// reuses a proposal id for the same key.
pub struct Proposer<P, L, T, S = TokioSleep, R = StdRng>
where
    P: Protocol,
{
    handler: Arc<AcceptorHandler<P, L>>,
    transport: T,
    backoff: BackoffConfig,
    sleep: S,
    timeout: Duration,
    max_retries: u32,
    rng: Mutex<R>,
    /// Highest round used or seen per key
    rounds: Mutex<HashMap<P::Key, u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P, L, T, S, R> Proposer<P, L, T, S, R>
where
    P: Protocol,
    L: Learner<P>,
    T: Transport<P>,
    S: Sleep,
    R: Rng + Send,
{
    #[must_use]
    pub fn new(handler: Arc<AcceptorHandler<P, L>>, transport: T, config: ProposerConfig<S, R>) -> Self {
        debug!(node = %handler.node_id(), "creating proposer");
        Self {
            handler,
            transport,
            backoff: config.backoff,
            sleep: config.sleep,
            timeout: config.timeout,
            max_retries: config.max_retries,
            rng: Mutex::new(config.rng),
            rounds: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &P::NodeId {
        self.handler.node_id()
    }

    pub fn handler(&self) -> &Arc<AcceptorHandler<P, L>> {
        &self.handler
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Propose `value` for `key` and drive it to a decision.
    ///
    /// `targets` are the nodes the round is sent to (normally the healthy
    /// set); quorum is always a majority of `cluster_size`. Returns the decided
    /// value, which is the value of an earlier proposal whenever one may
    /// already have been chosen.
    ///
    /// # Errors
    ///
    /// [`ConsensusFailed`] once `max_retries` retries after the first round
    /// have failed.
    #[instrument(skip_all, fields(node = %self.node_id(), key = ?key))]
    pub async fn propose(
        &self,
        key: &P::Key,
        value: P::Value,
        targets: &[P::NodeId],
        cluster_size: usize,
    ) -> Result<Decision<P>, Report<ConsensusFailed>> {
        let mut retry = RetryState::new(self.max_retries.saturating_add(1));
        let mut rounds = 0;
        let mut failed_rounds = 0;

        loop {
            if let Some((proposal, value)) = self.handler.decided(key) {
                debug!(%proposal, "decision already known");
                return Ok(Decision {
                    proposal,
                    value,
                    rounds,
                    failed_rounds,
                    newly_learned: false,
                });
            }

            let proposal = self.next_proposal(key);
            self.handler.learner().proposing(key, &proposal, &value);
            rounds += 1;
            debug!(%proposal, rounds, "attempting proposal");

            match self
                .run_round(key, proposal, value.clone(), targets, cluster_size)
                .await
            {
                RoundOutcome::Decided { proposal, value } => {
                    let newly_learned = self.handler.commit(key, &proposal, &value);
                    info!(%proposal, ?value, rounds, "decided");
                    return Ok(Decision {
                        proposal,
                        value,
                        rounds,
                        failed_rounds,
                        newly_learned,
                    });
                }
                RoundOutcome::Failed { superseded_by } => {
                    failed_rounds += 1;
                    if let Some(superseded_by) = &superseded_by {
                        self.observe_round(key, superseded_by.round);
                    }
                    let delay = retry.record_failure(&self.backoff, &mut *lock(&self.rng));
                    let Some(delay) = delay else {
                        warn!(rounds, "giving up");
                        return Err(Report::new(ConsensusFailed { rounds })
                            .attach_printable(format!("key: {key:?}"))
                            .attach_printable(format!("targets: {}", targets.len())));
                    };
                    debug!(?superseded_by, ?delay, "round failed, backing off");
                    self.sleep.sleep(delay).await;
                }
            }
        }
    }

    /// Next proposal id for `key`, above every round used or seen so far.
    fn next_proposal(&self, key: &P::Key) -> ProposalOf<P> {
        let local = self.handler.state().promised_round(key).unwrap_or(0);
        let mut rounds = lock(&self.rounds);
        let round = rounds.entry(key.clone()).or_insert(0);
        *round = (*round).max(local) + 1;
        ProposalId::new(*round, self.node_id().clone())
    }

    /// Remember a round seen in a rejection so the next proposal outbids it.
    fn observe_round(&self, key: &P::Key, seen: u64) {
        let mut rounds = lock(&self.rounds);
        let round = rounds.entry(key.clone()).or_insert(0);
        *round = (*round).max(seen);
    }

    /// Send `request` to every target, answering for ourselves locally.
    fn broadcast<'a>(
        &'a self,
        targets: &[P::NodeId],
        request: &Request<P>,
    ) -> FuturesUnordered<BoxFuture<'a, Reply<P>>> {
        targets
            .iter()
            .map(|to| {
                let envelope = Envelope::new(self.node_id().clone(), request.clone());
                let to = to.clone();
                if to == *self.node_id() {
                    let response = self.handler.handle(envelope);
                    async move { (to, Ok::<_, Report<TransportError>>(response)) }.boxed()
                } else {
                    let call = self.transport.call(to.clone(), envelope);
                    async move { (to, call.await) }.boxed()
                }
            })
            .collect()
    }

    /// Run a single round through both phases using `ProposerCore`.
    ///
    /// One timeout bounds the whole round. Responses still in flight when
    /// a phase ends are dropped with it.
    async fn run_round(
        &self,
        key: &P::Key,
        proposal: ProposalOf<P>,
        value: P::Value,
        targets: &[P::NodeId],
        cluster_size: usize,
    ) -> RoundOutcome<P> {
        let mut core = ProposerCore::new(proposal.clone(), value, cluster_size, targets.len());
        if !core.quorum_reachable() {
            debug!(targets = targets.len(), quorum = core.quorum(), "quorum unreachable");
            return RoundOutcome::Failed {
                superseded_by: None,
            };
        }
        let mut deadline = pin!(self.sleep.sleep(self.timeout));

        // Prepare phase: collect promises
        let mut pending = self.broadcast(
            targets,
            &Request::Prepare {
                key: key.clone(),
                proposal: proposal.clone(),
            },
        );
        trace!(quorum = core.quorum(), "collecting promises");
        let chosen = loop {
            let (from, reply) = tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some(reply) => reply,
                    None => return RoundOutcome::Failed { superseded_by: core.superseded_by().cloned() },
                },
                () = &mut deadline => {
                    debug!("prepare phase timed out");
                    return RoundOutcome::Failed { superseded_by: core.superseded_by().cloned() };
                }
            };
            let result = match reply {
                Ok(Response::Promise { proposal: p, prior }) => core.handle_promise(from, &p, prior),
                Ok(Response::Reject { proposal: p, promised }) => {
                    core.handle_prepare_reject(from, &p, promised)
                }
                Ok(other) => {
                    trace!(%from, response = ?other, "unexpected response to prepare");
                    core.handle_prepare_silence(from)
                }
                Err(report) => {
                    trace!(%from, ?report, "prepare not delivered");
                    core.handle_prepare_silence(from)
                }
            };
            match result {
                PreparePhaseResult::Quorum { value } => break value,
                PreparePhaseResult::Rejected { superseded_by } => {
                    debug!(?superseded_by, "rejected: higher proposal");
                    return RoundOutcome::Failed { superseded_by };
                }
                PreparePhaseResult::Stale => trace!("ignoring stale response"),
                // Need more promises
                PreparePhaseResult::Pending => {}
            }
        };
        drop(pending);
        debug!(quorum = core.quorum(), value = ?chosen, "prepare phase complete");

        // Accept phase: collect accepts
        let mut pending = self.broadcast(
            targets,
            &Request::Accept {
                key: key.clone(),
                proposal: proposal.clone(),
                value: chosen,
            },
        );
        loop {
            let (from, reply) = tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some(reply) => reply,
                    None => return RoundOutcome::Failed { superseded_by: core.superseded_by().cloned() },
                },
                () = &mut deadline => {
                    debug!("accept phase timed out");
                    return RoundOutcome::Failed { superseded_by: core.superseded_by().cloned() };
                }
            };
            let result = match reply {
                Ok(Response::Accepted { proposal: p, .. }) => core.handle_accepted(from, &p),
                Ok(Response::Reject { proposal: p, promised }) => {
                    core.handle_accept_reject(from, &p, promised)
                }
                Ok(other) => {
                    trace!(%from, response = ?other, "unexpected response to accept");
                    core.handle_accept_silence(from)
                }
                Err(report) => {
                    trace!(%from, ?report, "accept not delivered");
                    core.handle_accept_silence(from)
                }
            };
            match result {
                AcceptPhaseResult::Decided { proposal, value } => {
                    debug!(quorum = core.quorum(), "accept phase complete");
                    return RoundOutcome::Decided { proposal, value };
                }
                AcceptPhaseResult::Rejected { superseded_by } => {
                    debug!(?superseded_by, "rejected: higher proposal accepted");
                    return RoundOutcome::Failed { superseded_by };
                }
                AcceptPhaseResult::Stale => trace!("ignoring stale response"),
                // Need more accepts
                AcceptPhaseResult::Pending => {}
            }
        }
    }

    /// Best-effort `Learn` broadcast. Returns the peers that acknowledged
    /// within the round timeout.
    pub async fn announce(
        &self,
        key: &P::Key,
        proposal: &ProposalOf<P>,
        value: &P::Value,
        peers: &[P::NodeId],
    ) -> Vec<P::NodeId> {
        let request = Request::Learn {
            key: key.clone(),
            proposal: proposal.clone(),
            value: value.clone(),
        };
        let mut pending = self.broadcast(peers, &request);
        let mut deadline = pin!(self.sleep.sleep(self.timeout));
        let mut acked = Vec::new();
        loop {
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some((from, Ok(Response::Learned))) => acked.push(from),
                    Some((from, reply)) => trace!(%from, ?reply, "learn not acknowledged"),
                    None => break,
                },
                () = &mut deadline => break,
            }
        }
        acked
    }

    /// Learn the decided value of `key` without proposing.
    ///
    /// Queries `targets`: a decision reported by any of them, or a value
    /// accepted under one proposal by a majority of `cluster_size`, is decided
    /// and recorded locally. Acceptor state is never changed.
    #[instrument(skip_all, fields(node = %self.node_id(), key = ?key))]
    pub async fn learn(
        &self,
        key: &P::Key,
        targets: &[P::NodeId],
        cluster_size: usize,
    ) -> Option<Decision<P>> {
        if let Some((proposal, value)) = self.handler.decided(key) {
            return Some(Decision {
                proposal,
                value,
                rounds: 0,
                failed_rounds: 0,
                newly_learned: false,
            });
        }

        let mut tracker: QuorumCore<ProposalOf<P>, P::Value> = QuorumCore::new(cluster_size);
        let mut pending = self.broadcast(targets, &Request::Query { key: key.clone() });
        let mut deadline = pin!(self.sleep.sleep(self.timeout));
        trace!(quorum = tracker.quorum(), "querying acceptors");

        let (proposal, value) = loop {
            let (from, reply) = tokio::select! {
                biased;
                next = pending.next() => next?,
                () = &mut deadline => {
                    debug!("query timed out");
                    return None;
                }
            };
            match reply {
                Ok(Response::Report {
                    decided: Some(decided),
                    ..
                }) => break decided,
                Ok(Response::Report {
                    accepted: Some((proposal, value)),
                    decided: None,
                }) => {
                    if let Some(value) = tracker.track(proposal.clone(), value) {
                        break (proposal, value.clone());
                    }
                }
                Ok(Response::Report { .. }) => {}
                Ok(other) => trace!(%from, response = ?other, "unexpected response to query"),
                Err(report) => trace!(%from, ?report, "query not delivered"),
            }
        };

        let newly_learned = self.handler.commit(key, &proposal, &value);
        info!(%proposal, ?value, "learned decided value");
        Some(Decision {
            proposal,
            value,
            rounds: 0,
            failed_rounds: 0,
            newly_learned,
        })
    }

    /// Drop acceptor state and round counters of instances decided at least
    /// `retention` ago. Returns how many were collected.
    pub fn collect_garbage(&self, retention: Duration) -> usize {
        let collected = self.handler.collect_garbage(retention);
        let mut rounds = lock(&self.rounds);
        for key in &collected {
            rounds.remove(key);
        }
        collected.len()
    }
}
