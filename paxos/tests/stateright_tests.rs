//! Stateright model checker tests for single-decree Paxos
//!
//! The actors below delegate every transition to the crate's own
//! [`AcceptorCore`] and [`ProposerCore`], so the checker explores the same
//! state machines the runtime uses.

use std::borrow::Cow;
use std::sync::Arc;

use stateright::actor::{Actor, ActorModel, Id, Network, Out};
use stateright::{Checker, Expectation, Model};
use switchboard_paxos::core::{
    AcceptPhaseResult, AcceptResult, AcceptorCore, PreparePhaseResult, PrepareResult,
    ProposerCore,
};
use switchboard_paxos::ProposalId;

/// An agent, by number
type Value = u64;

type Proposal = ProposalId<usize>;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum PaxosMsg {
    Prepare {
        proposal: Proposal,
    },
    Promise {
        proposal: Proposal,
        prior: Option<(Proposal, Value)>,
    },
    Reject {
        proposal: Proposal,
        promised: Proposal,
    },
    Accept {
        proposal: Proposal,
        value: Value,
    },
    Accepted {
        proposal: Proposal,
    },
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct ProposerState {
    core: ProposerCore<usize, Value>,
    /// Value this proposer saw decided
    decided: Option<Value>,
}

/// Acceptors and proposers share one actor type
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum PaxosActor {
    Acceptor,
    Proposer {
        acceptor_ids: Vec<Id>,
        initial_value: Value,
    },
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum PaxosActorState {
    Acceptor(AcceptorCore<usize, Value>),
    Proposer(ProposerState),
}

impl PaxosActor {
    fn start_round(
        id: Id,
        round: u64,
        value: Value,
        acceptor_ids: &[Id],
        o: &mut Out<Self>,
    ) -> ProposerState {
        let proposal = ProposalId::new(round, usize::from(id));
        for &acc in acceptor_ids {
            o.send(acc, PaxosMsg::Prepare { proposal });
        }
        ProposerState {
            core: ProposerCore::new(proposal, value, acceptor_ids.len(), acceptor_ids.len()),
            decided: None,
        }
    }
}

impl Actor for PaxosActor {
    type Msg = PaxosMsg;
    type State = PaxosActorState;
    type Timer = ();

    fn on_start(&self, id: Id, o: &mut Out<Self>) -> Self::State {
        match self {
            PaxosActor::Acceptor => PaxosActorState::Acceptor(AcceptorCore::new()),
            PaxosActor::Proposer {
                acceptor_ids,
                initial_value,
            } => PaxosActorState::Proposer(Self::start_round(
                id,
                1,
                *initial_value,
                acceptor_ids,
                o,
            )),
        }
    }

    fn on_msg(
        &self,
        id: Id,
        state: &mut Cow<Self::State>,
        src: Id,
        msg: Self::Msg,
        o: &mut Out<Self>,
    ) {
        match self {
            PaxosActor::Acceptor => {
                let PaxosActorState::Acceptor(core) = state.to_mut() else {
                    return;
                };
                match msg {
                    PaxosMsg::Prepare { proposal } => match core.prepare(proposal) {
                        PrepareResult::Promised { prior } => {
                            o.send(src, PaxosMsg::Promise { proposal, prior });
                        }
                        PrepareResult::Rejected { promised } => {
                            o.send(src, PaxosMsg::Reject { proposal, promised });
                        }
                    },
                    PaxosMsg::Accept { proposal, value } => match core.accept(proposal, value) {
                        AcceptResult::Accepted => o.send(src, PaxosMsg::Accepted { proposal }),
                        AcceptResult::Rejected { promised } => {
                            o.send(src, PaxosMsg::Reject { proposal, promised });
                        }
                    },
                    _ => {}
                }
            }
            PaxosActor::Proposer {
                acceptor_ids,
                initial_value,
            } => {
                let PaxosActorState::Proposer(ps) = state.as_ref() else {
                    return;
                };
                if ps.decided.is_some() {
                    return;
                }
                let mut ps = ps.clone();
                let from = usize::from(src);
                let mut superseded = None;

                match msg {
                    PaxosMsg::Promise { proposal, prior } => {
                        match ps.core.handle_promise(from, &proposal, prior) {
                            PreparePhaseResult::Quorum { value } => {
                                for &acc in acceptor_ids {
                                    o.send(acc, PaxosMsg::Accept { proposal, value });
                                }
                            }
                            PreparePhaseResult::Rejected { superseded_by } => {
                                superseded = Some(superseded_by);
                            }
                            PreparePhaseResult::Pending | PreparePhaseResult::Stale => {}
                        }
                    }
                    PaxosMsg::Reject { proposal, promised } => {
                        if ps.core.is_preparing() {
                            if let PreparePhaseResult::Rejected { superseded_by } =
                                ps.core.handle_prepare_reject(from, &proposal, promised)
                            {
                                superseded = Some(superseded_by);
                            }
                        } else if let AcceptPhaseResult::Rejected { superseded_by } =
                            ps.core.handle_accept_reject(from, &proposal, promised)
                        {
                            superseded = Some(superseded_by);
                        }
                    }
                    PaxosMsg::Accepted { proposal } => {
                        if let AcceptPhaseResult::Decided { value, .. } =
                            ps.core.handle_accepted(from, &proposal)
                        {
                            ps.decided = Some(value);
                        }
                    }
                    _ => return,
                }

                if let Some(superseded_by) = superseded {
                    // Retry above everything seen so far
                    let seen = superseded_by.map_or(0, |p| p.round);
                    let round = ps.core.proposal().round.max(seen) + 1;
                    ps = Self::start_round(id, round, *initial_value, acceptor_ids, o);
                }
                *state.to_mut() = PaxosActorState::Proposer(ps);
            }
        }
    }
}

/// Proposers stop exploring past `max_round`
#[derive(Clone)]
struct PaxosConfig {
    max_round: u64,
}

fn decided_values(state: &stateright::actor::ActorModelState<PaxosActor>) -> Vec<Value> {
    state
        .actor_states
        .iter()
        .filter_map(|s: &Arc<PaxosActorState>| match s.as_ref() {
            PaxosActorState::Proposer(ps) => ps.decided,
            PaxosActorState::Acceptor(_) => None,
        })
        .collect()
}

fn paxos_model(
    num_proposers: usize,
    num_acceptors: usize,
    values: &[Value],
    max_round: u64,
) -> ActorModel<PaxosActor, PaxosConfig, ()> {
    let acceptor_ids: Vec<Id> = (0..num_acceptors).map(Id::from).collect();

    // FIFO links keep the state space small
    let mut model = ActorModel::new(PaxosConfig { max_round }, ())
        .init_network(Network::new_ordered([]))
        .within_boundary(|cfg, state| {
            state
                .actor_states
                .iter()
                .all(|s: &Arc<PaxosActorState>| match s.as_ref() {
                    PaxosActorState::Proposer(ps) => ps.core.proposal().round <= cfg.max_round,
                    PaxosActorState::Acceptor(_) => true,
                })
        });

    for _ in 0..num_acceptors {
        model = model.actor(PaxosActor::Acceptor);
    }

    for (_, &value) in (0..num_proposers).zip(values.iter().cycle()) {
        model = model.actor(PaxosActor::Proposer {
            acceptor_ids: acceptor_ids.clone(),
            initial_value: value,
        });
    }

    // Agreement: every proposer that saw a decision saw the same value
    model
        .property(Expectation::Always, "Agreement", |_, state| {
            let decided = decided_values(state);
            decided.windows(2).all(|w| w[0] == w[1])
        })
        .property(Expectation::Sometimes, "Decision reached", |_, state| {
            !decided_values(state).is_empty()
        })
}

#[test]
fn check_paxos_single_proposer() {
    let model = paxos_model(1, 3, &[1], 2);
    let checker = model.checker().threads(num_cpus::get()).spawn_bfs().join();
    checker.assert_properties();
    println!(
        "Single proposer: {} states explored",
        checker.unique_state_count()
    );
}

#[test]
fn check_paxos_two_proposers() {
    // Competing values; proposals of equal rounds are ordered by node id
    let model = paxos_model(2, 3, &[1, 2], 3);
    let checker = model.checker().threads(num_cpus::get()).spawn_bfs().join();
    checker.assert_properties();
    println!(
        "Two proposers: {} states explored",
        checker.unique_state_count()
    );
}
