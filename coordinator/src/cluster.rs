//! Static cluster membership and agent records

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a cluster node
    NodeId
);
string_id!(
    /// Identifier of the agent hosted by a node
    AgentId
);
string_id!(
    /// Identifier of an email thread
    ConversationId
);
string_id!(
    /// Capability tag of an agent (`support`, `billing`, ...)
    Specialization
);

impl AgentId {
    /// The agent hosted by `node`: `agent-<node id>`.
    #[must_use]
    pub fn for_node(node: &NodeId) -> Self {
        Self(format!("agent-{node}"))
    }
}

impl Specialization {
    /// Tag of agents without any particular specialization
    pub const GENERAL: &str = "general";

    #[must_use]
    pub fn general() -> Self {
        Self::new(Self::GENERAL)
    }
}

/// A node of the static cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// `host:port` the node listens on
    pub address: String,
}

/// A node together with the specializations of its agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub node: Node,
    pub specializations: BTreeSet<Specialization>,
}

impl Member {
    pub fn new(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        specializations: impl IntoIterator<Item = Specialization>,
    ) -> Self {
        Self {
            node: Node {
                id: id.into(),
                address: address.into(),
            },
            specializations: specializations.into_iter().collect(),
        }
    }
}

/// The agent of one node. Only the load changes during a run.
#[derive(Debug)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub specializations: BTreeSet<Specialization>,
    load: AtomicU64,
}

impl AgentRecord {
    fn new(node_id: NodeId, specializations: BTreeSet<Specialization>) -> Self {
        Self {
            agent_id: AgentId::for_node(&node_id),
            node_id,
            specializations,
            load: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    /// Returns the new load.
    pub(crate) fn increment(&self) -> u64 {
        self.load.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the new load. Never goes below zero.
    pub(crate) fn decrement(&self) -> u64 {
        let previous = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                Some(load.saturating_sub(1))
            })
            .unwrap_or_else(|load| load);
        previous.saturating_sub(1)
    }
}

/// Everything a node knows about the cluster that is fixed for the run.
///
/// Shared by every component of one node. Several nodes can live in one
/// process, each with its own `ClusterState`.
#[derive(Debug)]
pub struct ClusterState {
    local: NodeId,
    nodes: BTreeMap<NodeId, Node>,
    agents: BTreeMap<AgentId, Arc<AgentRecord>>,
}

impl ClusterState {
    pub fn new(local: NodeId, members: impl IntoIterator<Item = Member>) -> Self {
        let mut nodes = BTreeMap::new();
        let mut agents = BTreeMap::new();
        for Member {
            node,
            specializations,
        } in members
        {
            let agent = AgentRecord::new(node.id.clone(), specializations);
            agents.insert(agent.agent_id.clone(), Arc::new(agent));
            nodes.insert(node.id.clone(), node);
        }
        Self {
            local,
            nodes,
            agents,
        }
    }

    #[must_use]
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Every node, ordered by id
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Every node except the local one
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys().filter(|id| **id != self.local)
    }

    /// Every agent, ordered by agent id
    pub fn agents(&self) -> impl Iterator<Item = &Arc<AgentRecord>> {
        self.agents.values()
    }

    #[must_use]
    pub fn agent(&self, id: &AgentId) -> Option<&Arc<AgentRecord>> {
        self.agents.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_derived_from_node() {
        assert_eq!(AgentId::for_node(&NodeId::new("node-2")).as_str(), "agent-node-2");
    }

    #[test]
    fn test_load_never_negative() {
        let agent = AgentRecord::new(NodeId::new("node-1"), BTreeSet::new());
        assert_eq!(agent.decrement(), 0);
        assert_eq!(agent.increment(), 1);
        assert_eq!(agent.increment(), 2);
        assert_eq!(agent.decrement(), 1);
        assert_eq!(agent.load(), 1);
    }

    #[test]
    fn test_peers_exclude_local() {
        let cluster = ClusterState::new(
            NodeId::new("node-2"),
            ["node-1", "node-2", "node-3"].map(|id| Member::new(id, "127.0.0.1:0", [])),
        );
        let peers: Vec<&str> = cluster.peers().map(NodeId::as_str).collect();
        assert_eq!(peers, ["node-1", "node-3"]);
        assert_eq!(cluster.size(), 3);
        assert!(cluster.agent(&AgentId::new("agent-node-3")).is_some());
    }
}
