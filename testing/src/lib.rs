//! Switchboard testing - simulated clusters
//!
//! Runs several coordinators in one process over a [`MemoryNetwork`], with
//! helpers to crash nodes and to drive the heartbeat monitors by hand.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use switchboard_coordinator::{
    Coordinator, CoordinatorConfig, MemoryNetwork, MemoryTransport, Member, NodeId, Specialization,
};
use tokio::time::Instant;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses `RUST_LOG` for filtering (defaults to debug for the coordinator crates).
pub fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("switchboard_coordinator=debug,switchboard_paxos=debug")
        }))
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    // Only for this thread, so parallel tests keep their own output
    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

pub type TestNode = Arc<Coordinator<MemoryTransport>>;

/// Members `node-1..=node-n`, every agent tagged with `specializations`
#[must_use]
pub fn members(n: usize, specializations: &[&str]) -> Vec<Member> {
    (1..=n)
        .map(|i| {
            Member::new(
                format!("node-{i}"),
                format!("127.0.0.1:{}", 7000 + i),
                specializations.iter().map(|tag| Specialization::new(*tag)),
            )
        })
        .collect()
}

/// Timings for simulated clusters: short rounds, quick retries.
#[must_use]
pub fn test_config(node: &NodeId, members: &[Member]) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::new(node.clone(), members.iter().cloned());
    config.paxos_timeout = Duration::from_millis(500);
    config.retry_interval = Duration::from_millis(10);
    config.max_retries = 3;
    config
}

/// A cluster of coordinators in one process
pub struct TestCluster {
    pub network: MemoryNetwork,
    nodes: Vec<TestNode>,
    down: Mutex<BTreeSet<String>>,
    /// Heartbeat exchanges so far; each one happens further in the future
    exchanges: AtomicU32,
}

impl TestCluster {
    /// One coordinator per member with [`test_config`] timings.
    ///
    /// # Panics
    ///
    /// If a configuration does not validate.
    #[must_use]
    pub fn new(members: &[Member]) -> Self {
        Self::with_config(members, |_| {})
    }

    /// Like [`TestCluster::new`], adjusting every node's configuration with
    /// `tweak` first.
    ///
    /// # Panics
    ///
    /// If a configuration does not validate.
    #[must_use]
    pub fn with_config(members: &[Member], tweak: impl Fn(&mut CoordinatorConfig)) -> Self {
        let network = MemoryNetwork::new();
        let nodes = members
            .iter()
            .zip(1u64..)
            .map(|(member, seed)| {
                let id = member.node.id.clone();
                let mut config = test_config(&id, members);
                config.seed = Some(seed);
                tweak(&mut config);
                let coordinator = Coordinator::new(config, network.endpoint(id.clone()))
                    .expect("test configuration should be valid");
                let coordinator = Arc::new(coordinator);
                network.register(id, &coordinator);
                coordinator
            })
            .collect();
        Self {
            network,
            nodes,
            down: Mutex::new(BTreeSet::new()),
            exchanges: AtomicU32::new(0),
        }
    }

    /// # Panics
    ///
    /// If there is no node `id`.
    #[must_use]
    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.node_id().as_str() == id)
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.iter()
    }

    /// Crash `id` on the network and let every other live node's monitor
    /// declare it dead.
    ///
    /// # Panics
    ///
    /// If the bookkeeping lock is poisoned.
    pub fn kill(&self, id: &str) {
        self.network.kill(&NodeId::new(id));
        let mut down = self.down.lock().unwrap();
        down.insert(id.to_owned());
        let alive: Vec<&str> = self
            .nodes
            .iter()
            .map(|node| node.node_id().as_str())
            .filter(|node| !down.contains(*node))
            .collect();
        self.exchange_heartbeats(&alive);
    }

    /// Every node in `alive` hears from every other node in `alive`, then all
    /// of them evaluate health far enough in the future that anyone else is
    /// dead.
    pub fn exchange_heartbeats(&self, alive: &[&str]) {
        let epoch = self.exchanges.fetch_add(1, Ordering::Relaxed) + 1;
        for node in self.nodes.iter().filter(|n| alive.contains(&n.node_id().as_str())) {
            let monitor = node.monitor();
            let config = node.config();
            let later = Instant::now() + config.heartbeat_interval * config.dead_after * epoch;
            for peer in alive {
                monitor.record_heartbeat(&NodeId::new(*peer), later);
            }
            monitor.tick(later);
        }
    }
}
