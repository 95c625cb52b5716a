//! Consensus over conversation assignments
//!
//! Wraps the generic [`Proposer`] for the [`Assignments`] protocol. Decisions
//! land in the [`AssignmentStore`] through [`Projection`], which is also what
//! the acceptor consults for conversations it already knows are decided.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use rand::SeedableRng;
use rand::rngs::StdRng;
use switchboard_paxos::{
    AcceptorHandler, BackoffConfig, Decision, DecisionOf, Envelope, Learner, ProposalOf, Proposer,
    ProposerConfig, TokioSleep,
};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::cluster::{AgentId, ClusterState, ConversationId, NodeId};
use crate::config::CoordinatorConfig;
use crate::error::AssignError;
use crate::heartbeat::HealthSnapshot;
use crate::metrics::Metrics;
use crate::registry::AgentRegistry;
use crate::store::{AssignmentStore, ConversationAssignment, PutOutcome};
use crate::transport::{ConsensusTransport, NodeTransport};
use crate::wire::{Assignments, ConsensusRequest, ConsensusResponse};

/// Learner that materialises decisions in the local store.
///
/// The first time a decision reaches this node the winning agent's load goes
/// up by one, unless a peer already completed the conversation.
pub struct Projection {
    store: Arc<AssignmentStore>,
    registry: Arc<AgentRegistry>,
}

impl Projection {
    pub fn new(store: Arc<AssignmentStore>, registry: Arc<AgentRegistry>) -> Self {
        Self { store, registry }
    }
}

impl Learner<Assignments> for Projection {
    fn learn(&self, key: &ConversationId, proposal: &ProposalOf<Assignments>, value: &AgentId) -> bool {
        let assignment = ConversationAssignment {
            conversation_id: key.clone(),
            agent_id: value.clone(),
            proposal_id: proposal.clone(),
            decided: true,
        };
        match self.store.put_if_absent_or_matching(assignment) {
            PutOutcome::Inserted => {
                let load = self.registry.increment_load(value);
                debug!(conversation = %key, agent = %value, ?load, "assignment committed");
                true
            }
            PutOutcome::InsertedCompleted => {
                debug!(conversation = %key, agent = %value, "assignment committed after completion");
                true
            }
            PutOutcome::Matching => false,
            PutOutcome::Conflict(existing) => {
                error!(
                    conversation = %key,
                    decided = %existing.agent_id,
                    offered = %value,
                    %proposal,
                    "conflicting decision offered"
                );
                false
            }
        }
    }

    fn decided(&self, key: &ConversationId) -> Option<DecisionOf<Assignments>> {
        self.store
            .get(key)
            .map(|assignment| (assignment.proposal_id, assignment.agent_id))
    }

    fn proposing(&self, key: &ConversationId, proposal: &ProposalOf<Assignments>, value: &AgentId) {
        self.store.record_pending(key, value, proposal);
    }
}

type AssignmentProposer<T> = Proposer<Assignments, Projection, ConsensusTransport<T>, TokioSleep, StdRng>;

pub struct ConsensusEngine<T: NodeTransport> {
    cluster: Arc<ClusterState>,
    proposer: Arc<AssignmentProposer<T>>,
    store: Arc<AssignmentStore>,
    metrics: Arc<Metrics>,
}

impl<T: NodeTransport> ConsensusEngine<T> {
    pub fn new(
        config: &CoordinatorConfig,
        cluster: Arc<ClusterState>,
        store: Arc<AssignmentStore>,
        registry: Arc<AgentRegistry>,
        metrics: Arc<Metrics>,
        transport: T,
    ) -> Self {
        let backoff = BackoffConfig {
            initial: config.retry_interval,
            max: config.paxos_timeout.max(config.retry_interval),
            multiplier: 2.0,
        };
        let proposer_config = match config.seed {
            Some(seed) => ProposerConfig::with_seed(backoff, TokioSleep, seed),
            None => ProposerConfig::new(backoff, TokioSleep, StdRng::from_os_rng()),
        }
        .with_timeout(config.paxos_timeout)
        .with_max_retries(config.max_retries);

        let projection = Projection::new(Arc::clone(&store), registry);
        let handler = Arc::new(AcceptorHandler::new(cluster.local().clone(), projection));
        let proposer = Proposer::new(handler, ConsensusTransport(transport), proposer_config);
        Self {
            cluster,
            proposer: Arc::new(proposer),
            store,
            metrics,
        }
    }

    /// Drive `conversation` to a decision, proposing `preferred` unless an
    /// earlier value may already have been chosen.
    ///
    /// Rounds go to the healthy nodes of `snapshot`. When this node's round
    /// decided, the decision is announced to the healthy peers in the
    /// background.
    ///
    /// # Errors
    ///
    /// [`AssignError::ConsensusFailed`] once the retries are exhausted.
    pub async fn decide(
        &self,
        conversation: &ConversationId,
        preferred: AgentId,
        snapshot: &HealthSnapshot,
    ) -> Result<Decision<Assignments>, Report<AssignError>> {
        let targets = snapshot.healthy_nodes();
        let decision = match self
            .proposer
            .propose(conversation, preferred, &targets, self.cluster.size())
            .await
        {
            Ok(decision) => decision,
            Err(report) => {
                let rounds = report.current_context().rounds;
                self.metrics.record_rounds(rounds, 0, rounds);
                self.store.clear_pending(conversation);
                return Err(report.change_context(AssignError::ConsensusFailed));
            }
        };

        let decided_rounds = decision.rounds - decision.failed_rounds;
        self.metrics
            .record_rounds(decision.rounds, decided_rounds, decision.failed_rounds);
        if decided_rounds > 0 {
            let peers = targets
                .into_iter()
                .filter(|node| node != self.cluster.local())
                .collect();
            self.replicate(conversation, &decision, peers, snapshot);
        }
        Ok(decision)
    }

    fn replicate(
        &self,
        conversation: &ConversationId,
        decision: &Decision<Assignments>,
        peers: Vec<NodeId>,
        snapshot: &HealthSnapshot,
    ) {
        let replicas = self.store.replica_targets(conversation, snapshot);
        let proposer = Arc::clone(&self.proposer);
        let metrics = Arc::clone(&self.metrics);
        let conversation = conversation.clone();
        let proposal = decision.proposal.clone();
        let agent = decision.value.clone();
        let span = info_span!("replicate", %conversation, %proposal);

        tokio::spawn(
            async move {
                let acked = proposer.announce(&conversation, &proposal, &agent, &peers).await;
                let missing: Vec<&NodeId> = replicas.iter().filter(|r| !acked.contains(r)).collect();
                if missing.is_empty() {
                    debug!(acked = acked.len(), "decision replicated");
                } else {
                    warn!(?missing, acked = acked.len(), "replication shortfall");
                    metrics.record_replication_shortfall();
                }
            }
            .instrument(span),
        );
    }

    /// Answer a consensus request from another node.
    pub fn handle(&self, envelope: Envelope<NodeId, ConsensusRequest>) -> ConsensusResponse {
        self.proposer.handler().handle(envelope)
    }

    /// Recover the decision for `conversation` from the healthy nodes
    /// without proposing.
    pub async fn learn(
        &self,
        conversation: &ConversationId,
        snapshot: &HealthSnapshot,
    ) -> Option<Decision<Assignments>> {
        let targets = snapshot.healthy_nodes();
        self.proposer
            .learn(conversation, &targets, self.cluster.size())
            .await
    }

    /// Highest round this node has promised for `conversation`, if it holds
    /// acceptor state for it.
    #[must_use]
    pub fn promised_round(&self, conversation: &ConversationId) -> Option<u64> {
        self.proposer.handler().state().promised_round(conversation)
    }

    pub fn collect_garbage(&self, retention: Duration) -> usize {
        self.proposer.collect_garbage(retention)
    }
}
