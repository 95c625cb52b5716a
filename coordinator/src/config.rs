//! Coordinator configuration

use std::collections::BTreeSet;
use std::time::Duration;

use error_stack::Report;

use crate::cluster::{Member, NodeId};
use crate::error::ConfigError;

/// Everything one node needs to run a coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// This node
    pub node_id: NodeId,
    /// The static cluster, including this node
    pub members: Vec<Member>,
    /// Bound on one consensus round
    pub paxos_timeout: Duration,
    /// Initial backoff between failed rounds
    pub retry_interval: Duration,
    /// Rounds retried after the first one fails
    pub max_retries: u32,
    pub heartbeat_interval: Duration,
    /// Missed intervals before a node is suspect
    pub suspect_after: u32,
    /// Missed intervals before a node is dead
    pub dead_after: u32,
    /// Nodes holding each decision, counting the deciding node
    pub replication_factor: usize,
    /// How long acceptor state of decided conversations is kept
    pub retention: Duration,
    /// Seed for retry jitter; random when unset
    pub seed: Option<u64>,
}

impl CoordinatorConfig {
    /// Configuration with default timings for `node_id` in a cluster of `members`.
    pub fn new(node_id: impl Into<NodeId>, members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            node_id: node_id.into(),
            members: members.into_iter().collect(),
            paxos_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
            max_retries: 5,
            heartbeat_interval: Duration::from_secs(10),
            suspect_after: 2,
            dead_after: 3,
            replication_factor: 3,
            retention: Duration::from_secs(3600),
            seed: None,
        }
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] with the offending setting attached.
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |reason: String| Err(Report::new(ConfigError).attach_printable(reason));

        if self.members.is_empty() {
            return invalid("cluster is empty".to_owned());
        }

        let mut seen = BTreeSet::new();
        for member in &self.members {
            if !seen.insert(&member.node.id) {
                return invalid(format!("node {} listed twice", member.node.id));
            }
        }
        if !seen.contains(&self.node_id) {
            return invalid(format!("local node {} is not in the cluster", self.node_id));
        }

        for (name, value) in [
            ("paxos timeout", self.paxos_timeout),
            ("retry interval", self.retry_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("retention", self.retention),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be positive"));
            }
        }

        if self.suspect_after == 0 {
            return invalid("suspect threshold must be positive".to_owned());
        }
        if self.dead_after <= self.suspect_after {
            return invalid(format!(
                "dead threshold {} must exceed suspect threshold {}",
                self.dead_after, self.suspect_after
            ));
        }
        if self.replication_factor == 0 {
            return invalid("replication factor must be positive".to_owned());
        }
        Ok(())
    }
}
