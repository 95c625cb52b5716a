//! Conversation-to-agent assignment for a static cluster
//!
//! Every node runs a [`Coordinator`]. An inbound event for a conversation can
//! arrive at any node; the coordinators agree through one Paxos instance per
//! conversation on the single agent that owns it.
//!
//! - [`heartbeat`] decides which nodes are healthy
//! - [`registry`] picks the preferred agent by specialization and load
//! - [`engine`] ratifies (or corrects) that choice with the cluster
//! - [`store`] keeps the decided assignments
//!
//! Nodes talk over a [`NodeTransport`]: [`TcpTransport`] in production,
//! [`MemoryNetwork`] for simulated clusters in one process.

#![warn(clippy::pedantic)]

pub mod cluster;
pub mod codec;
pub mod config;
mod coordinator;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod transport;
pub mod wire;

pub use cluster::{AgentId, ClusterState, ConversationId, Member, Node, NodeId, Specialization};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorStatus};
pub use error::{AssignError, ConfigError};
pub use heartbeat::{Health, HealthSnapshot, HeartbeatMonitor};
pub use metrics::MetricsSnapshot;
pub use store::{CompleteOutcome, ConversationAssignment};
pub use transport::{Handler, MemoryNetwork, MemoryTransport, NodeTransport, TcpTransport};
pub use wire::{NodeEnvelope, NodeRequest, NodeResponse};
