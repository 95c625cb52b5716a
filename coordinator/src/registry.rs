//! Agent selection by specialization and load

use std::collections::BTreeSet;
use std::sync::Arc;

use error_stack::Report;
use serde::Serialize;
use tracing::{debug, trace};

use crate::cluster::{AgentId, ClusterState, NodeId, Specialization};
use crate::error::AssignError;
use crate::heartbeat::{Health, HealthSnapshot};

/// What the caller needs from an agent
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub specialization: Option<Specialization>,
    pub exclude: BTreeSet<AgentId>,
}

impl Selection {
    pub fn new(specialization: Option<Specialization>) -> Self {
        Self {
            specialization,
            exclude: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn excluding(mut self, agent: AgentId) -> Self {
        self.exclude.insert(agent);
        self
    }
}

/// Current view of one agent, for status reporting
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub specializations: BTreeSet<Specialization>,
    pub load: u64,
    pub health: Health,
    /// Seconds since the node's last heartbeat
    pub last_heartbeat_secs: f64,
}

pub struct AgentRegistry {
    cluster: Arc<ClusterState>,
}

impl AgentRegistry {
    pub fn new(cluster: Arc<ClusterState>) -> Self {
        Self { cluster }
    }

    /// The least loaded healthy agent matching `selection`, lowest agent id
    /// first among equals.
    ///
    /// # Errors
    ///
    /// [`AssignError::NoEligibleAgent`] when no agent passes the filters.
    pub fn select(
        &self,
        snapshot: &HealthSnapshot,
        selection: &Selection,
    ) -> Result<AgentId, Report<AssignError>> {
        let chosen = self
            .cluster
            .agents()
            .filter(|agent| snapshot.is_healthy(&agent.node_id))
            .filter(|agent| {
                selection
                    .specialization
                    .as_ref()
                    .is_none_or(|tag| agent.specializations.contains(tag))
            })
            .filter(|agent| !selection.exclude.contains(&agent.agent_id))
            .inspect(|agent| trace!(agent = %agent.agent_id, load = agent.load(), "candidate"))
            // `agents()` is ordered by id and `min_by_key` keeps the first minimum
            .min_by_key(|agent| agent.load());

        match chosen {
            Some(agent) => {
                debug!(agent = %agent.agent_id, load = agent.load(), "selected agent");
                Ok(agent.agent_id.clone())
            }
            None => Err(Report::new(AssignError::NoEligibleAgent).attach_printable(format!(
                "specialization: {}",
                selection
                    .specialization
                    .as_ref()
                    .map_or(Specialization::GENERAL, Specialization::as_str)
            ))),
        }
    }

    /// Returns the new load, or `None` for unknown agents.
    pub fn increment_load(&self, agent: &AgentId) -> Option<u64> {
        self.cluster.agent(agent).map(|record| record.increment())
    }

    /// Returns the new load, or `None` for unknown agents.
    pub fn decrement_load(&self, agent: &AgentId) -> Option<u64> {
        self.cluster.agent(agent).map(|record| record.decrement())
    }

    #[must_use]
    pub fn load(&self, agent: &AgentId) -> Option<u64> {
        self.cluster.agent(agent).map(|record| record.load())
    }

    #[must_use]
    pub fn agents(&self, snapshot: &HealthSnapshot) -> Vec<AgentState> {
        self.cluster
            .agents()
            .map(|agent| AgentState {
                agent_id: agent.agent_id.clone(),
                node_id: agent.node_id.clone(),
                specializations: agent.specializations.clone(),
                load: agent.load(),
                health: snapshot.health(&agent.node_id),
                last_heartbeat_secs: snapshot
                    .since_heartbeat(&agent.node_id)
                    .map_or(0.0, |age| age.as_secs_f64()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::cluster::Member;
    use crate::heartbeat::HeartbeatMonitor;

    fn support() -> Specialization {
        Specialization::new("support")
    }

    fn setup() -> (AgentRegistry, HeartbeatMonitor) {
        let cluster = Arc::new(ClusterState::new(
            NodeId::new("node-1"),
            [
                Member::new("node-1", "127.0.0.1:0", [support(), Specialization::general()]),
                Member::new("node-2", "127.0.0.1:0", [support()]),
                Member::new("node-3", "127.0.0.1:0", [support()]),
            ],
        ));
        let monitor = HeartbeatMonitor::new(Arc::clone(&cluster), Duration::from_secs(10), 2, 3);
        (AgentRegistry::new(cluster), monitor)
    }

    fn agent(id: &str) -> AgentId {
        AgentId::new(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_least_loaded_healthy_agent() {
        let (registry, monitor) = setup();
        registry.increment_load(&agent("agent-node-1"));
        registry.increment_load(&agent("agent-node-1"));

        // node-3 goes dead, node-2 keeps beating
        let start = Instant::now();
        monitor.record_heartbeat(&NodeId::new("node-2"), start + Duration::from_secs(25));
        monitor.tick(start + Duration::from_secs(30));

        let selection = Selection::new(Some(support()));
        let chosen = registry.select(&monitor.snapshot(), &selection).unwrap();
        assert_eq!(chosen, agent("agent-node-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_go_to_lowest_agent_id() {
        let (registry, monitor) = setup();
        let snapshot = monitor.snapshot();
        let selection = Selection::new(Some(support()));
        assert_eq!(
            registry.select(&snapshot, &selection).unwrap(),
            agent("agent-node-1")
        );
        let selection = selection.excluding(agent("agent-node-1"));
        assert_eq!(
            registry.select(&snapshot, &selection).unwrap(),
            agent("agent-node-2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eligible_agent_leaves_loads_alone() {
        let (registry, monitor) = setup();
        let selection = Selection::new(Some(Specialization::new("billing")));
        let report = registry.select(&monitor.snapshot(), &selection).unwrap_err();
        assert_eq!(*report.current_context(), AssignError::NoEligibleAgent);
        for state in registry.agents(&monitor.snapshot()) {
            assert_eq!(state.load, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_saturates_at_zero() {
        let (registry, _) = setup();
        assert_eq!(registry.decrement_load(&agent("agent-node-2")), Some(0));
        assert_eq!(registry.increment_load(&agent("agent-node-2")), Some(1));
        assert_eq!(registry.load(&agent("agent-node-2")), Some(1));
        assert_eq!(registry.increment_load(&agent("agent-missing")), None);
    }
}
