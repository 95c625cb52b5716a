//! The entry point of one node

use std::sync::Arc;

use error_stack::Report;
use serde::Serialize;
use switchboard_paxos::Envelope;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use futures::future::join_all;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::cluster::{AgentId, ClusterState, ConversationId, NodeId, Specialization};
use crate::config::CoordinatorConfig;
use crate::engine::ConsensusEngine;
use crate::error::{AssignError, ConfigError};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::{AgentRegistry, AgentState, Selection};
use crate::store::{AssignmentStore, CompleteOutcome};
use crate::transport::{Handler, HeartbeatBeacon, NodeTransport};
use crate::wire::{NodeEnvelope, NodeRequest, NodeResponse};

/// Aggregate state for monitoring
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStatus {
    pub node_id: NodeId,
    pub healthy_nodes: Vec<NodeId>,
    pub quorum_available: bool,
    pub active_conversations: usize,
    pub decided_conversations: usize,
    pub metrics: MetricsSnapshot,
    pub agents: Vec<AgentState>,
}

/// Assigns conversations to agents, agreeing with the rest of the cluster.
pub struct Coordinator<T: NodeTransport> {
    config: CoordinatorConfig,
    cluster: Arc<ClusterState>,
    monitor: Arc<HeartbeatMonitor>,
    registry: Arc<AgentRegistry>,
    store: Arc<AssignmentStore>,
    metrics: Arc<Metrics>,
    engine: ConsensusEngine<T>,
    transport: T,
}

impl<T: NodeTransport> Coordinator<T> {
    /// # Errors
    ///
    /// [`ConfigError`] if `config` does not validate.
    pub fn new(config: CoordinatorConfig, transport: T) -> Result<Self, Report<ConfigError>> {
        config.validate()?;

        let cluster = Arc::new(ClusterState::new(
            config.node_id.clone(),
            config.members.iter().cloned(),
        ));
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&cluster),
            config.heartbeat_interval,
            config.suspect_after,
            config.dead_after,
        ));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&cluster)));
        let store = Arc::new(AssignmentStore::new(
            config.node_id.clone(),
            config.replication_factor,
        ));
        let metrics = Arc::new(Metrics::default());
        let engine = ConsensusEngine::new(
            &config,
            Arc::clone(&cluster),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            transport.clone(),
        );

        info!(node = %config.node_id, cluster = cluster.size(), "coordinator created");
        Ok(Self {
            config,
            cluster,
            monitor,
            registry,
            store,
            metrics,
            engine,
            transport,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        self.cluster.local()
    }

    /// The agent that owns `conversation`, deciding it with the cluster if
    /// this node does not know yet.
    ///
    /// # Errors
    ///
    /// - [`AssignError::QuorumUnavailable`] if fewer than a majority of nodes
    ///   are healthy; no round is attempted
    /// - [`AssignError::NoEligibleAgent`] if no healthy agent has
    ///   `specialization`
    /// - [`AssignError::ConsensusFailed`] if every round failed
    #[instrument(skip_all, fields(node = %self.node_id(), %conversation, ?specialization))]
    pub async fn assign(
        &self,
        conversation: &ConversationId,
        specialization: Option<Specialization>,
    ) -> Result<AgentId, Report<AssignError>> {
        if let Some(assignment) = self.store.get(conversation) {
            self.metrics.record_fast_path();
            debug!(agent = %assignment.agent_id, "already decided");
            return Ok(assignment.agent_id);
        }

        let snapshot = self.monitor.snapshot();
        if !snapshot.is_quorum_available(self.cluster.size()) {
            let healthy = snapshot.healthy_nodes().len();
            return Err(Report::new(AssignError::QuorumUnavailable).attach_printable(format!(
                "{healthy} of {} nodes healthy",
                self.cluster.size()
            )));
        }

        let preferred = self
            .registry
            .select(&snapshot, &Selection::new(specialization.clone()))?;
        let decision = self.engine.decide(conversation, preferred, &snapshot).await?;

        self.metrics
            .record_assignment(&specialization.unwrap_or_else(Specialization::general));
        info!(agent = %decision.value, proposal = %decision.proposal, rounds = decision.rounds, "assigned");
        Ok(decision.value)
    }

    /// An inbound event for `conversation`. Redelivered events resolve to the
    /// same agent.
    ///
    /// # Errors
    ///
    /// As [`Coordinator::assign`].
    pub async fn on_event(
        &self,
        conversation: &ConversationId,
        specialization_hint: Option<Specialization>,
    ) -> Result<AgentId, Report<AssignError>> {
        self.assign(conversation, specialization_hint).await
    }

    /// The decided agent of `conversation`, as known to this node. Never
    /// starts a round.
    #[must_use]
    pub fn get_assignment(&self, conversation: &ConversationId) -> Option<AgentId> {
        self.store
            .get(conversation)
            .map(|assignment| assignment.agent_id)
    }

    /// Release the agent of a processed conversation.
    ///
    /// Healthy peers are told in the background so their view of the agent's
    /// load drops as well. Must be called from within a tokio runtime.
    pub fn complete(&self, conversation: &ConversationId) -> CompleteOutcome {
        let outcome = self.store.complete(conversation);
        if let CompleteOutcome::Completed(assignment) = &outcome {
            let load = self.registry.decrement_load(&assignment.agent_id);
            debug!(%conversation, agent = %assignment.agent_id, ?load, "conversation completed");
            self.announce_completion(conversation);
        }
        outcome
    }

    fn announce_completion(&self, conversation: &ConversationId) {
        let peers: Vec<NodeId> = self
            .monitor
            .healthy_nodes()
            .into_iter()
            .filter(|node| node != self.node_id())
            .collect();
        if peers.is_empty() {
            return;
        }

        let from = self.node_id().clone();
        let transport = self.transport.clone();
        let timeout = self.config.paxos_timeout;
        let conversation = conversation.clone();
        let span = info_span!("announce_completion", %conversation);
        tokio::spawn(
            async move {
                let sends = peers.into_iter().map(|peer| {
                    let envelope = Envelope::new(
                        from.clone(),
                        NodeRequest::Complete {
                            conversation: conversation.clone(),
                        },
                    );
                    let transport = transport.clone();
                    async move {
                        let sent = transport.send(peer.clone(), envelope);
                        match tokio::time::timeout(timeout, sent).await {
                            Ok(Ok(NodeResponse::CompleteAck)) => {}
                            Ok(Ok(other)) => warn!(%peer, response = ?other, "unexpected completion response"),
                            Ok(Err(report)) => debug!(%peer, ?report, "completion not delivered"),
                            Err(_) => debug!(%peer, "completion timed out"),
                        }
                    }
                });
                join_all(sends).await;
            }
            .instrument(span),
        );
    }

    fn handle_complete(&self, from: &NodeId, conversation: &ConversationId) -> NodeResponse {
        match self.store.complete_announced(conversation) {
            CompleteOutcome::Completed(assignment) => {
                let load = self.registry.decrement_load(&assignment.agent_id);
                debug!(%from, %conversation, agent = %assignment.agent_id, ?load, "peer completed conversation");
            }
            CompleteOutcome::AlreadyCompleted => {}
            CompleteOutcome::Unknown => {
                debug!(%from, %conversation, "completion arrived before the decision");
            }
        }
        NodeResponse::CompleteAck
    }

    /// Find out whether `conversation` was decided elsewhere, without
    /// proposing.
    pub async fn learn(&self, conversation: &ConversationId) -> Option<AgentId> {
        let snapshot = self.monitor.snapshot();
        self.engine
            .learn(conversation, &snapshot)
            .await
            .map(|decision| decision.value)
    }

    /// Bring a dead node back into the healthy set.
    pub fn reset_node(&self, node: &NodeId) -> bool {
        self.monitor.reset(node)
    }

    #[must_use]
    pub fn status(&self) -> CoordinatorStatus {
        let snapshot = self.monitor.snapshot();
        CoordinatorStatus {
            node_id: self.node_id().clone(),
            healthy_nodes: snapshot.healthy_nodes(),
            quorum_available: snapshot.is_quorum_available(self.cluster.size()),
            active_conversations: self.store.active_count(),
            decided_conversations: self.store.decided_count(),
            metrics: self.metrics.snapshot(),
            agents: self.registry.agents(&snapshot),
        }
    }

    #[must_use]
    pub fn active_conversations_count(&self) -> usize {
        self.store.active_count()
    }

    #[must_use]
    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.monitor.healthy_nodes()
    }

    fn handle_heartbeat(&self, from: &NodeId) -> NodeResponse {
        self.monitor.record_heartbeat(from, Instant::now());
        NodeResponse::HeartbeatAck
    }

    /// Start the heartbeat loop and periodic garbage collection. Both stop
    /// when `token` is cancelled.
    pub fn start(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let beacon = HeartbeatBeacon::new(self.node_id().clone(), self.transport.clone());
        let heartbeat = Arc::clone(&self.monitor).spawn(beacon, token.clone());

        let this = Arc::clone(self);
        let token = token.clone();
        let collector = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.heartbeat_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let collected = this.engine.collect_garbage(this.config.retention);
                if collected > 0 {
                    debug!(collected, "collected decided conversations");
                }
            }
        });
        vec![heartbeat, collector]
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<AssignmentStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn engine(&self) -> &ConsensusEngine<T> {
        &self.engine
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}

impl<T: NodeTransport> Handler for Coordinator<T> {
    fn handle(&self, envelope: NodeEnvelope) -> NodeResponse {
        let Envelope { from, body } = envelope;
        match body {
            NodeRequest::Consensus(request) => {
                NodeResponse::Consensus(self.engine.handle(Envelope::new(from, request)))
            }
            NodeRequest::Heartbeat => self.handle_heartbeat(&from),
            NodeRequest::Complete { conversation } => self.handle_complete(&from, &conversation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Member;
    use crate::transport::MemoryNetwork;

    fn solo() -> Coordinator<crate::transport::MemoryTransport> {
        let network = MemoryNetwork::new();
        let mut config = CoordinatorConfig::new(
            "node-1",
            [Member::new("node-1", "127.0.0.1:0", [Specialization::new("support")])],
        );
        config.seed = Some(1);
        Coordinator::new(config, network.endpoint(NodeId::new("node-1"))).unwrap()
    }

    #[tokio::test]
    async fn test_single_node_assigns_and_completes() {
        let coordinator = solo();
        let conversation = ConversationId::new("c-1");

        let agent = coordinator
            .assign(&conversation, Some(Specialization::new("support")))
            .await
            .unwrap();
        assert_eq!(agent, AgentId::new("agent-node-1"));
        assert_eq!(coordinator.registry().load(&agent), Some(1));

        // Redelivery takes the fast path
        let again = coordinator.on_event(&conversation, None).await.unwrap();
        assert_eq!(again, agent);

        let status = coordinator.status();
        assert_eq!(status.metrics.consensus_rounds_attempted, 1);
        assert_eq!(status.metrics.consensus_rounds_decided, 1);
        assert_eq!(status.metrics.fast_path_hits, 1);
        assert_eq!(status.active_conversations, 1);

        assert!(matches!(coordinator.complete(&conversation), CompleteOutcome::Completed(_)));
        assert_eq!(coordinator.complete(&conversation), CompleteOutcome::AlreadyCompleted);
        assert_eq!(coordinator.registry().load(&agent), Some(0));
        assert_eq!(coordinator.active_conversations_count(), 0);
        assert_eq!(coordinator.get_assignment(&conversation), Some(agent));
    }

    #[tokio::test]
    async fn test_unknown_specialization_has_no_agent() {
        let coordinator = solo();
        let report = coordinator
            .assign(&ConversationId::new("c-1"), Some(Specialization::new("billing")))
            .await
            .unwrap_err();
        assert_eq!(*report.current_context(), AssignError::NoEligibleAgent);
        assert_eq!(coordinator.status().metrics.consensus_rounds_attempted, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged() {
        let coordinator = solo();
        let response = coordinator.handle(Envelope::new(NodeId::new("node-1"), NodeRequest::Heartbeat));
        assert_eq!(response, NodeResponse::HeartbeatAck);
    }

    #[tokio::test]
    async fn test_completion_from_peer_before_decision() {
        let coordinator = solo();
        let conversation = ConversationId::new("c-1");
        let complete = Envelope::new(
            NodeId::new("node-2"),
            NodeRequest::Complete {
                conversation: conversation.clone(),
            },
        );
        assert_eq!(coordinator.handle(complete), NodeResponse::CompleteAck);

        // The decision lands already completed and holds no load
        let agent = coordinator.assign(&conversation, None).await.unwrap();
        assert_eq!(coordinator.registry().load(&agent), Some(0));
        assert_eq!(coordinator.active_conversations_count(), 0);
        assert_eq!(coordinator.complete(&conversation), CompleteOutcome::AlreadyCompleted);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let network = MemoryNetwork::new();
        let config = CoordinatorConfig::new("node-9", [Member::new("node-1", "127.0.0.1:0", [])]);
        assert!(Coordinator::new(config, network.endpoint(NodeId::new("node-9"))).is_err());
    }
}
