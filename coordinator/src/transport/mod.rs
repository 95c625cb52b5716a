//! Request/response delivery between nodes
//!
//! [`NodeTransport`] carries every [`NodeRequest`] kind. The consensus engine
//! and the heartbeat loop see it through [`ConsensusTransport`] and
//! [`HeartbeatBeacon`].

mod memory;
mod tcp;

use std::future::Future;

use error_stack::Report;
use switchboard_paxos::{Envelope, Transport, TransportError};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, exchange, serve, serve_connection};

use crate::cluster::NodeId;
use crate::heartbeat::Beacon;
use crate::wire::{Assignments, ConsensusRequest, ConsensusResponse, NodeEnvelope, NodeRequest, NodeResponse};

pub trait NodeTransport: Clone + Send + Sync + 'static {
    fn send(
        &self,
        to: NodeId,
        envelope: NodeEnvelope,
    ) -> impl Future<Output = Result<NodeResponse, Report<TransportError>>> + Send;
}

/// Answers requests arriving from other nodes.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, envelope: NodeEnvelope) -> NodeResponse;
}

/// Consensus view of a [`NodeTransport`]
#[derive(Clone, Debug)]
pub struct ConsensusTransport<T>(pub T);

impl<T: NodeTransport> Transport<Assignments> for ConsensusTransport<T> {
    async fn call(
        &self,
        to: NodeId,
        request: Envelope<NodeId, ConsensusRequest>,
    ) -> Result<ConsensusResponse, Report<TransportError>> {
        let Envelope { from, body } = request;
        let envelope = Envelope::new(from, NodeRequest::Consensus(body));
        match self.0.send(to, envelope).await? {
            NodeResponse::Consensus(response) => Ok(response),
            other => Err(Report::new(TransportError)
                .attach_printable(format!("unexpected response to consensus request: {other:?}"))),
        }
    }
}

/// Sends heartbeats from `from` over a [`NodeTransport`].
#[derive(Clone, Debug)]
pub struct HeartbeatBeacon<T> {
    from: NodeId,
    transport: T,
}

impl<T> HeartbeatBeacon<T> {
    pub fn new(from: NodeId, transport: T) -> Self {
        Self { from, transport }
    }
}

impl<T: NodeTransport> Beacon for HeartbeatBeacon<T> {
    async fn beat(&self, to: NodeId) -> bool {
        let envelope = Envelope::new(self.from.clone(), NodeRequest::Heartbeat);
        match self.transport.send(to.clone(), envelope).await {
            Ok(NodeResponse::HeartbeatAck) => true,
            Ok(other) => {
                tracing::trace!(%to, response = ?other, "unexpected heartbeat response");
                false
            }
            Err(report) => {
                tracing::trace!(%to, ?report, "heartbeat not delivered");
                false
            }
        }
    }
}
