//! Command line and environment configuration

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;
use error_stack::{Report, ResultExt};
use switchboard_coordinator::{ConfigError, CoordinatorConfig, Member, NodeId, Specialization};

/// A cluster node given as `id=host:port`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: String,
    pub address: String,
}

/// Specializations of one node's agent given as `id=tag+tag`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecializationSpec {
    pub id: String,
    pub tags: Vec<String>,
}

fn parse_node(s: &str) -> Result<NodeSpec, String> {
    let (id, address) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {s:?}"))?;
    if id.is_empty() || address.is_empty() {
        return Err(format!("expected id=host:port, got {s:?}"));
    }
    Ok(NodeSpec {
        id: id.trim().to_owned(),
        address: address.trim().to_owned(),
    })
}

fn parse_specializations(s: &str) -> Result<SpecializationSpec, String> {
    let (id, tags) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=tag+tag, got {s:?}"))?;
    let tags: Vec<String> = tags
        .split('+')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect();
    if id.is_empty() || tags.is_empty() {
        return Err(format!("expected id=tag+tag, got {s:?}"));
    }
    Ok(SpecializationSpec {
        id: id.trim().to_owned(),
        tags,
    })
}

/// Agent coordinator node
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Run a node of the agent coordinator cluster")]
pub struct Args {
    /// Id of this node; must appear in the cluster list
    #[arg(long, env = "NODE_ID")]
    pub node_id: String,

    /// Every node of the cluster as `id=host:port`, comma separated
    #[arg(long, env = "CLUSTER_NODES", value_delimiter = ',', required = true, value_parser = parse_node)]
    pub cluster: Vec<NodeSpec>,

    /// Agent specializations as `id=tag+tag`, comma separated.
    /// Nodes without an entry get `general`
    #[arg(long, env = "AGENT_SPECIALIZATIONS", value_delimiter = ',', value_parser = parse_specializations)]
    pub specializations: Vec<SpecializationSpec>,

    /// Bound on one consensus round, in seconds
    #[arg(long, env = "PAXOS_TIMEOUT", default_value_t = 5.0)]
    pub paxos_timeout: f64,

    /// Initial backoff between failed rounds, in seconds
    #[arg(long, env = "PAXOS_RETRY_INTERVAL", default_value_t = 1.0)]
    pub paxos_retry_interval: f64,

    /// Rounds retried after the first one fails
    #[arg(long, env = "PAXOS_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Seconds between heartbeats
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value_t = 10.0)]
    pub heartbeat_interval: f64,

    /// Missed heartbeat intervals before a node is suspect
    #[arg(long, env = "SUSPECT_THRESHOLD", default_value_t = 2)]
    pub suspect_after: u32,

    /// Missed heartbeat intervals before a node is dead
    #[arg(long, env = "FAILURE_THRESHOLD", default_value_t = 3)]
    pub dead_after: u32,

    /// Nodes holding each decision, counting the deciding node
    #[arg(long, env = "STATE_REPLICATION_FACTOR", default_value_t = 3)]
    pub replication_factor: usize,

    /// Seconds acceptor state of decided conversations is kept
    #[arg(long, env = "DECISION_RETENTION", default_value_t = 3600.0)]
    pub retention: f64,

    /// Run an interactive REPL on stdin
    #[arg(long)]
    pub repl: bool,
}

fn seconds(name: &str, value: f64) -> Result<Duration, Report<ConfigError>> {
    Duration::try_from_secs_f64(value)
        .change_context(ConfigError)
        .attach_printable_lazy(|| format!("{name}: {value} is not a duration in seconds"))
}

impl Args {
    /// Build and validate the coordinator configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for unusable durations or an invalid cluster.
    pub fn to_config(&self) -> Result<CoordinatorConfig, Report<ConfigError>> {
        let mut tags: BTreeMap<&str, &[String]> = BTreeMap::new();
        for spec in &self.specializations {
            if tags.insert(&spec.id, &spec.tags).is_some() {
                return Err(Report::new(ConfigError)
                    .attach_printable(format!("specializations of {} given twice", spec.id)));
            }
        }
        if let Some(unknown) = tags
            .keys()
            .find(|id| !self.cluster.iter().any(|node| node.id == **id))
        {
            return Err(Report::new(ConfigError)
                .attach_printable(format!("specializations given for unknown node {unknown}")));
        }

        let members = self.cluster.iter().map(|node| {
            let specializations: Vec<Specialization> = match tags.get(node.id.as_str()) {
                Some(tags) => tags.iter().map(|tag| Specialization::new(tag.as_str())).collect(),
                None => vec![Specialization::general()],
            };
            Member::new(node.id.as_str(), node.address.as_str(), specializations)
        });

        let mut config = CoordinatorConfig::new(NodeId::new(self.node_id.as_str()), members);
        config.paxos_timeout = seconds("paxos timeout", self.paxos_timeout)?;
        config.retry_interval = seconds("retry interval", self.paxos_retry_interval)?;
        config.max_retries = self.max_retries;
        config.heartbeat_interval = seconds("heartbeat interval", self.heartbeat_interval)?;
        config.suspect_after = self.suspect_after;
        config.dead_after = self.dead_after;
        config.replication_factor = self.replication_factor;
        config.retention = seconds("retention", self.retention)?;
        config.validate()?;
        Ok(config)
    }

    /// Address this node listens on
    #[must_use]
    pub fn listen_address(&self) -> Option<&str> {
        self.cluster
            .iter()
            .find(|node| node.id == self.node_id)
            .map(|node| node.address.as_str())
    }
}
