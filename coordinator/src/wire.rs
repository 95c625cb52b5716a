//! Messages exchanged between nodes

use serde::{Deserialize, Serialize};
use switchboard_paxos::{Envelope, Protocol, Request, Response};

use crate::cluster::{AgentId, ConversationId, NodeId};

/// One consensus instance per conversation, deciding its agent
#[derive(Debug)]
pub struct Assignments;

impl Protocol for Assignments {
    type Key = ConversationId;
    type NodeId = NodeId;
    type Value = AgentId;
}

pub type ConsensusRequest = Request<Assignments>;
pub type ConsensusResponse = Response<Assignments>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRequest {
    Consensus(ConsensusRequest),
    Heartbeat,
    /// The sender completed `conversation`; release its agent here too.
    Complete { conversation: ConversationId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeResponse {
    Consensus(ConsensusResponse),
    HeartbeatAck,
    CompleteAck,
}

/// A request tagged with its sender
pub type NodeEnvelope = Envelope<NodeId, NodeRequest>;
