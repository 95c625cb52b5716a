//! Heartbeat-based failure detection
//!
//! Every node is `Healthy` until it misses `suspect_after` heartbeat
//! intervals, then `Suspect`, and `Dead` after `dead_after` intervals. A
//! suspect node recovers with its next heartbeat; a dead node stays dead
//! until [`HeartbeatMonitor::reset`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterState, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Suspect,
    Dead,
}

/// A change of health observed by the monitor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthTransition {
    pub node: NodeId,
    pub from: Health,
    pub to: Health,
}

#[derive(Clone, Copy, Debug)]
struct Liveness {
    health: Health,
    last_heartbeat: Instant,
}

/// Health of every node, taken at one instant under one lock.
///
/// Selection and quorum decisions of a single operation all read the same
/// snapshot.
#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    taken_at: Instant,
    nodes: BTreeMap<NodeId, Liveness>,
}

impl HealthSnapshot {
    /// Health of `node`. Nodes outside the cluster are reported dead.
    #[must_use]
    pub fn health(&self, node: &NodeId) -> Health {
        self.nodes.get(node).map_or(Health::Dead, |l| l.health)
    }

    #[must_use]
    pub fn is_healthy(&self, node: &NodeId) -> bool {
        self.health(node) == Health::Healthy
    }

    /// Healthy nodes, ordered by id
    #[must_use]
    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, l)| l.health == Health::Healthy)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether a majority of `cluster_size` nodes is healthy.
    #[must_use]
    pub fn is_quorum_available(&self, cluster_size: usize) -> bool {
        self.healthy_nodes().len() >= switchboard_paxos::quorum(cluster_size)
    }

    /// Time since the last heartbeat of `node`, as of the snapshot.
    #[must_use]
    pub fn since_heartbeat(&self, node: &NodeId) -> Option<Duration> {
        self.nodes
            .get(node)
            .map(|l| self.taken_at.saturating_duration_since(l.last_heartbeat))
    }
}

/// Sends a heartbeat to one peer.
pub trait Beacon: Send + Sync + 'static {
    /// Returns whether the peer acknowledged.
    fn beat(&self, to: NodeId) -> impl Future<Output = bool> + Send;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HeartbeatMonitor {
    cluster: Arc<ClusterState>,
    interval: Duration,
    suspect_after: u32,
    dead_after: u32,
    nodes: Mutex<BTreeMap<NodeId, Liveness>>,
}

impl HeartbeatMonitor {
    /// Every node starts healthy, as if it had just sent a heartbeat.
    pub fn new(
        cluster: Arc<ClusterState>,
        interval: Duration,
        suspect_after: u32,
        dead_after: u32,
    ) -> Self {
        let now = Instant::now();
        let nodes = cluster
            .nodes()
            .map(|node| {
                let liveness = Liveness {
                    health: Health::Healthy,
                    last_heartbeat: now,
                };
                (node.id.clone(), liveness)
            })
            .collect();
        Self {
            cluster,
            interval,
            suspect_after,
            dead_after,
            nodes: Mutex::new(nodes),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a heartbeat from `node` observed at `at`.
    ///
    /// A suspect node becomes healthy again. A dead node only has its
    /// timestamp updated.
    pub fn record_heartbeat(&self, node: &NodeId, at: Instant) -> Option<HealthTransition> {
        let mut nodes = lock(&self.nodes);
        let Some(liveness) = nodes.get_mut(node) else {
            warn!(%node, "heartbeat from unknown node");
            return None;
        };
        liveness.last_heartbeat = liveness.last_heartbeat.max(at);
        if liveness.health != Health::Suspect {
            return None;
        }
        liveness.health = Health::Healthy;
        info!(%node, "node recovered");
        Some(HealthTransition {
            node: node.clone(),
            from: Health::Suspect,
            to: Health::Healthy,
        })
    }

    /// Evaluate every node against the thresholds as of `at`.
    ///
    /// The local node is never degraded.
    pub fn tick(&self, at: Instant) -> Vec<HealthTransition> {
        let suspect = self.interval.saturating_mul(self.suspect_after);
        let dead = self.interval.saturating_mul(self.dead_after);

        let mut transitions = Vec::new();
        let mut nodes = lock(&self.nodes);
        for (node, liveness) in nodes.iter_mut() {
            if node == self.cluster.local() || liveness.health == Health::Dead {
                continue;
            }
            let silent_for = at.saturating_duration_since(liveness.last_heartbeat);
            let health = if silent_for >= dead {
                Health::Dead
            } else if silent_for >= suspect {
                Health::Suspect
            } else {
                continue;
            };
            if health != liveness.health {
                warn!(%node, from = ?liveness.health, to = ?health, ?silent_for, "node health degraded");
                transitions.push(HealthTransition {
                    node: node.clone(),
                    from: liveness.health,
                    to: health,
                });
                liveness.health = health;
            }
        }
        transitions
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let nodes = lock(&self.nodes).clone();
        HealthSnapshot {
            taken_at: Instant::now(),
            nodes,
        }
    }

    #[must_use]
    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.snapshot().healthy_nodes()
    }

    #[must_use]
    pub fn is_quorum_available(&self) -> bool {
        self.snapshot().is_quorum_available(self.cluster.size())
    }

    /// Explicitly bring `node` back, whatever its health.
    ///
    /// Returns `false` for nodes outside the cluster.
    pub fn reset(&self, node: &NodeId) -> bool {
        let mut nodes = lock(&self.nodes);
        let Some(liveness) = nodes.get_mut(node) else {
            return false;
        };
        info!(%node, from = ?liveness.health, "node reset");
        *liveness = Liveness {
            health: Health::Healthy,
            last_heartbeat: Instant::now(),
        };
        true
    }

    /// Tick and send heartbeats to every peer once per interval until
    /// `token` is cancelled. Acknowledged heartbeats count as liveness of
    /// the peer.
    pub fn spawn<B: Beacon>(self: Arc<Self>, beacon: B, token: CancellationToken) -> JoinHandle<()> {
        let peers: Vec<NodeId> = self.cluster.peers().cloned().collect();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(peers = peers.len(), interval = ?self.interval, "heartbeat started");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                self.tick(Instant::now());
                let beats = peers.iter().map(|peer| {
                    let beat = tokio::time::timeout(self.interval, beacon.beat(peer.clone()));
                    async move { (peer, matches!(beat.await, Ok(true))) }
                });
                for (peer, acked) in join_all(beats).await {
                    if acked {
                        self.record_heartbeat(peer, Instant::now());
                    }
                }
            }
            debug!("heartbeat stopped");
        })
    }
}
