use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use error_stack::Report;
use switchboard_paxos::{
    AcceptorHandler, BackoffConfig, DecisionOf, Envelope, Learner, ProposalId, ProposalOf,
    Proposer, ProposerConfig, Protocol, Request, Response, TokioSleep, Transport, TransportError,
};

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("switchboard_paxos=debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    // set_default only affects this thread, unlike set_global_default
    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

// --- Test protocol ---

struct Test;

impl Protocol for Test {
    type Key = String;
    type NodeId = String;
    type Value = String;
}

#[derive(Default)]
struct Decisions(Mutex<HashMap<String, DecisionOf<Test>>>);

impl Learner<Test> for Decisions {
    fn learn(&self, key: &String, proposal: &ProposalOf<Test>, value: &String) -> bool {
        let mut map = self.0.lock().unwrap();
        if let Some((_, existing)) = map.get(key) {
            assert_eq!(existing, value, "two values decided for {key}");
            return false;
        }
        map.insert(key.clone(), (proposal.clone(), value.clone()));
        true
    }

    fn decided(&self, key: &String) -> Option<DecisionOf<Test>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

type Handler = Arc<AcceptorHandler<Test, Decisions>>;

// --- In-memory network ---

#[derive(Clone, Default)]
struct Network {
    nodes: Arc<Mutex<HashMap<String, Handler>>>,
    /// Calls to these nodes fail immediately
    down: Arc<Mutex<HashSet<String>>>,
    /// Calls to these nodes never complete
    silent: Arc<Mutex<HashSet<String>>>,
}

impl Transport<Test> for Network {
    fn call(
        &self,
        to: String,
        request: Envelope<String, Request<Test>>,
    ) -> impl Future<Output = Result<Response<Test>, Report<TransportError>>> + Send {
        let handler = self.nodes.lock().unwrap().get(&to).cloned();
        let down = self.down.lock().unwrap().contains(&to);
        let silent = self.silent.lock().unwrap().contains(&to);
        async move {
            if silent {
                futures::future::pending::<()>().await;
            }
            tokio::task::yield_now().await;
            match handler {
                Some(handler) if !down => Ok(handler.handle(request)),
                _ => Err(Report::new(TransportError).attach_printable(format!("node {to} down"))),
            }
        }
    }
}

struct Cluster {
    network: Network,
    ids: Vec<String>,
    proposers: HashMap<String, Proposer<Test, Decisions, Network>>,
}

impl Cluster {
    fn new(n: usize) -> Self {
        let network = Network::default();
        let ids: Vec<String> = (1..=n).map(|i| format!("node-{i}")).collect();
        let mut proposers = HashMap::new();
        for (seed, id) in ids.iter().enumerate() {
            let handler = Arc::new(AcceptorHandler::new(id.clone(), Decisions::default()));
            network
                .nodes
                .lock()
                .unwrap()
                .insert(id.clone(), Arc::clone(&handler));
            let config = ProposerConfig::with_seed(BackoffConfig::default(), TokioSleep, seed as u64)
                .with_timeout(Duration::from_millis(500))
                .with_max_retries(3);
            proposers.insert(id.clone(), Proposer::new(handler, network.clone(), config));
        }
        Self {
            network,
            ids,
            proposers,
        }
    }

    fn proposer(&self, id: &str) -> &Proposer<Test, Decisions, Network> {
        &self.proposers[id]
    }

    fn handler(&self, id: &str) -> Handler {
        Arc::clone(&self.network.nodes.lock().unwrap()[id])
    }
}

fn id(round: u64, node: &str) -> ProposalOf<Test> {
    ProposalId::new(round, node.to_string())
}

#[tokio::test]
async fn test_single_proposer_decides_own_value() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let proposer = cluster.proposer("node-1");

    let decision = proposer
        .propose(&"c-1".to_string(), "x".to_string(), &cluster.ids, 3)
        .await
        .unwrap();

    assert_eq!(decision.value, "x");
    assert_eq!(decision.rounds, 1);
    assert!(decision.newly_learned);
    assert_eq!(decision.proposal, id(1, "node-1"));
}

#[tokio::test]
async fn test_known_decision_skips_rounds() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let proposer = cluster.proposer("node-1");
    let key = "c-1".to_string();

    proposer.propose(&key, "x".to_string(), &cluster.ids, 3).await.unwrap();
    let again = proposer.propose(&key, "y".to_string(), &cluster.ids, 3).await.unwrap();

    assert_eq!(again.value, "x");
    assert_eq!(again.rounds, 0);
    assert!(!again.newly_learned);
}

#[tokio::test]
async fn test_later_proposer_adopts_chosen_value() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let key = "c-1".to_string();

    // node-1 decides but never announces; node-2 does not know
    cluster
        .proposer("node-1")
        .propose(&key, "x".to_string(), &cluster.ids, 3)
        .await
        .unwrap();
    assert!(cluster.handler("node-2").decided(&key).is_none());

    let decision = cluster
        .proposer("node-2")
        .propose(&key, "y".to_string(), &cluster.ids, 3)
        .await
        .unwrap();
    assert_eq!(decision.value, "x");
}

#[tokio::test]
async fn test_concurrent_proposers_agree() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let key = "c-1".to_string();

    let (a, b, c) = tokio::join!(
        cluster.proposer("node-1").propose(&key, "a".to_string(), &cluster.ids, 3),
        cluster.proposer("node-2").propose(&key, "b".to_string(), &cluster.ids, 3),
        cluster.proposer("node-3").propose(&key, "c".to_string(), &cluster.ids, 3),
    );

    let values: HashSet<String> = [a, b, c]
        .into_iter()
        .filter_map(Result::ok)
        .map(|d| d.value)
        .collect();
    assert!(values.len() <= 1, "disagreement: {values:?}");
}

#[tokio::test]
async fn test_survives_minority_failure() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    cluster.network.down.lock().unwrap().insert("node-3".to_string());

    let decision = cluster
        .proposer("node-1")
        .propose(&"c-1".to_string(), "x".to_string(), &cluster.ids, 3)
        .await
        .unwrap();
    assert_eq!(decision.value, "x");
}

#[tokio::test(start_paused = true)]
async fn test_majority_failure_exhausts_retries() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    cluster.network.silent.lock().unwrap().insert("node-2".to_string());
    cluster.network.down.lock().unwrap().insert("node-3".to_string());

    let report = cluster
        .proposer("node-1")
        .propose(&"c-1".to_string(), "x".to_string(), &cluster.ids, 3)
        .await
        .unwrap_err();

    // One initial round plus three retries
    assert_eq!(report.current_context().rounds, 4);
    assert!(cluster.handler("node-1").decided(&"c-1".to_string()).is_none());
}

#[tokio::test]
async fn test_too_few_targets_fail_without_messages() {
    let _guard = init_tracing();
    let cluster = Cluster::new(5);
    let targets = vec!["node-1".to_string(), "node-2".to_string()];

    let report = cluster
        .proposer("node-1")
        .propose(&"c-1".to_string(), "x".to_string(), &targets, 5)
        .await
        .unwrap_err();
    assert_eq!(report.current_context().rounds, 4);
    assert!(cluster.handler("node-2").state().is_empty());
}

#[tokio::test]
async fn test_announce_reaches_peers() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    cluster.network.down.lock().unwrap().insert("node-3".to_string());
    let key = "c-1".to_string();
    let proposer = cluster.proposer("node-1");

    let decision = proposer.propose(&key, "x".to_string(), &cluster.ids, 3).await.unwrap();
    let peers = vec!["node-2".to_string(), "node-3".to_string()];
    let acked = proposer
        .announce(&key, &decision.proposal, &decision.value, &peers)
        .await;

    assert_eq!(acked, vec!["node-2".to_string()]);
    assert_eq!(
        cluster.handler("node-2").decided(&key),
        Some((id(1, "node-1"), "x".to_string()))
    );
    assert!(cluster.handler("node-3").decided(&key).is_none());
}

#[tokio::test]
async fn test_learn_recovers_orphaned_decision() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let key = "c-1".to_string();

    // A proposer reached a majority of accepts, then crashed before tallying
    for node in ["node-1", "node-2"] {
        let handler = cluster.handler(node);
        handler.handle(Envelope::new(
            "node-9".to_string(),
            Request::Prepare {
                key: key.clone(),
                proposal: id(4, "node-9"),
            },
        ));
        handler.handle(Envelope::new(
            "node-9".to_string(),
            Request::Accept {
                key: key.clone(),
                proposal: id(4, "node-9"),
                value: "orphan".to_string(),
            },
        ));
    }

    let learned = cluster
        .proposer("node-3")
        .learn(&key, &cluster.ids, 3)
        .await
        .unwrap();
    assert_eq!(learned.value, "orphan");
    assert!(learned.newly_learned);
    assert_eq!(
        cluster.handler("node-3").decided(&key),
        Some((id(4, "node-9"), "orphan".to_string()))
    );
}

#[tokio::test]
async fn test_learn_without_majority_finds_nothing() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let key = "c-1".to_string();

    cluster.handler("node-1").handle(Envelope::new(
        "node-9".to_string(),
        Request::Accept {
            key: key.clone(),
            proposal: id(1, "node-9"),
            value: "lonely".to_string(),
        },
    ));

    assert!(
        cluster
            .proposer("node-3")
            .learn(&key, &cluster.ids, 3)
            .await
            .is_none()
    );
    // Querying never touches acceptor state
    assert!(cluster.handler("node-2").state().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_garbage_collection_keeps_decisions() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let key = "c-1".to_string();
    let proposer = cluster.proposer("node-1");

    proposer.propose(&key, "x".to_string(), &cluster.ids, 3).await.unwrap();
    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(proposer.collect_garbage(Duration::from_secs(60)), 1);
    assert!(cluster.handler("node-1").state().is_empty());

    // Another node proposing after collection still converges on "x"
    let decision = cluster
        .proposer("node-2")
        .propose(&key, "y".to_string(), &cluster.ids, 3)
        .await
        .unwrap();
    assert_eq!(decision.value, "x");
}

#[tokio::test(start_paused = true)]
async fn test_decision_reports_failed_rounds() {
    let _guard = init_tracing();
    let cluster = Cluster::new(3);
    let key = "c-1".to_string();

    // node-3 promised a high round, node-2 is silent: the first round of node-1
    // fails on the reject from node-3 and the timeout of node-2
    cluster.handler("node-3").handle(Envelope::new(
        "node-3".to_string(),
        Request::Prepare {
            key: key.clone(),
            proposal: id(5, "node-3"),
        },
    ));
    cluster.network.silent.lock().unwrap().insert("node-2".to_string());
    let proposer = cluster.proposer("node-1");
    let first = proposer.propose(&key, "x".to_string(), &cluster.ids, 3);
    let heal = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cluster.network.silent.lock().unwrap().clear();
    };
    let (decision, ()) = tokio::join!(first, heal);
    let decision = decision.unwrap();

    assert_eq!(decision.value, "x");
    assert_eq!(decision.failed_rounds, decision.rounds - 1);
    assert!(decision.rounds >= 2);
    // The retry outbid the round seen in the rejection
    assert!(decision.proposal.round > 5);
}
