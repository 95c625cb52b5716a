//! In-process network with fault injection
//!
//! Every node registers its [`Handler`]. Requests are delivered by calling the
//! destination handler directly, after yielding once so concurrent requests
//! interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use error_stack::Report;
use switchboard_paxos::TransportError;
use tracing::trace;

use super::{Handler, NodeTransport};
use crate::cluster::NodeId;
use crate::wire::{NodeEnvelope, NodeResponse};

#[derive(Default)]
struct Links {
    handlers: HashMap<NodeId, Weak<dyn Handler>>,
    /// Crashed nodes: requests to or from them fail immediately
    down: BTreeSet<NodeId>,
    /// Requests to these nodes are lost and never answered
    silent: BTreeSet<NodeId>,
    /// Unordered pairs that cannot reach each other
    partitions: BTreeSet<(NodeId, NodeId)>,
}

enum Delivery {
    Deliver(Arc<dyn Handler>),
    Refused(&'static str),
    Lost,
}

fn pair(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Shared in-memory network. Cloning gives another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<Mutex<Links>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver requests for `node` to `handler`.
    ///
    /// The network only keeps a weak reference; the node is unreachable once
    /// the handler is dropped.
    pub fn register<H: Handler>(&self, node: NodeId, handler: &Arc<H>) {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn Handler> = weak;
        self.links().handlers.insert(node, weak);
    }

    /// Transport sending as `from`
    #[must_use]
    pub fn endpoint(&self, from: NodeId) -> MemoryTransport {
        MemoryTransport {
            from,
            network: self.clone(),
        }
    }

    /// Crash `node`: requests to and from it fail.
    pub fn kill(&self, node: &NodeId) {
        self.links().down.insert(node.clone());
    }

    pub fn revive(&self, node: &NodeId) {
        self.links().down.remove(node);
    }

    /// Drop every request sent to `node` without an answer.
    pub fn black_hole(&self, node: &NodeId) {
        self.links().silent.insert(node.clone());
    }

    /// Cut the link between `a` and `b` in both directions. Requests across
    /// it are lost.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        self.links().partitions.insert(pair(a, b));
    }

    /// Undo every partition and black hole. Crashed nodes stay down.
    pub fn heal(&self) {
        let mut links = self.links();
        links.silent.clear();
        links.partitions.clear();
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Delivery {
        let links = self.links();
        if links.down.contains(from) || links.down.contains(to) {
            return Delivery::Refused("node is down");
        }
        if links.silent.contains(to) || links.partitions.contains(&pair(from, to)) {
            return Delivery::Lost;
        }
        match links.handlers.get(to).and_then(Weak::upgrade) {
            Some(handler) => Delivery::Deliver(handler),
            None => Delivery::Refused("node is not registered"),
        }
    }
}

/// One node's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    from: NodeId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.from
    }

    #[must_use]
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl NodeTransport for MemoryTransport {
    async fn send(
        &self,
        to: NodeId,
        envelope: NodeEnvelope,
    ) -> Result<NodeResponse, Report<TransportError>> {
        tokio::task::yield_now().await;
        match self.network.route(&self.from, &to) {
            Delivery::Deliver(handler) => Ok(handler.handle(envelope)),
            Delivery::Refused(reason) => Err(Report::new(TransportError)
                .attach_printable(format!("{} -> {to}: {reason}", self.from))),
            Delivery::Lost => {
                trace!(from = %self.from, %to, "request lost");
                std::future::pending().await
            }
        }
    }
}
