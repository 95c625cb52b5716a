//! Interactive commands against a running coordinator

#![allow(clippy::missing_errors_doc)]

use std::sync::Arc;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use switchboard_coordinator::{
    CompleteOutcome, ConversationId, Coordinator, NodeId, NodeTransport, Specialization,
};
use tracing::warn;

/// Executes REPL commands for one node
pub struct ReplContext<T: NodeTransport> {
    pub coordinator: Arc<Coordinator<T>>,
}

impl<T: NodeTransport> ReplContext<T> {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator<T>>) -> Self {
        Self { coordinator }
    }

    /// Execute one command line
    pub async fn execute(&self, line: &str) -> Result<String, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            return Ok(String::new());
        };

        match (command, &parts[1..]) {
            ("help" | "?", _) => Ok(Self::help()),
            ("assign", [conversation]) => self.cmd_assign(conversation, None).await,
            ("assign", [conversation, specialization]) => {
                self.cmd_assign(conversation, Some(*specialization)).await
            }
            ("assign", _) => Err("Usage: assign <conversation> [specialization]".to_owned()),
            ("get", [conversation]) => Ok(self.cmd_get(conversation)),
            ("get", _) => Err("Usage: get <conversation>".to_owned()),
            ("complete", [conversation]) => Ok(self.cmd_complete(conversation)),
            ("complete", _) => Err("Usage: complete <conversation>".to_owned()),
            ("learn", [conversation]) => Ok(self.cmd_learn(conversation).await),
            ("learn", _) => Err("Usage: learn <conversation>".to_owned()),
            ("reset", [node]) => self.cmd_reset(node),
            ("reset", _) => Err("Usage: reset <node>".to_owned()),
            ("status", _) => self.cmd_status(),
            ("metrics", _) => Ok(self.cmd_metrics()),
            _ => Err(format!(
                "Unknown command: {command}. Type 'help' for available commands."
            )),
        }
    }

    async fn cmd_assign(&self, conversation: &str, specialization: Option<&str>) -> Result<String, String> {
        self.coordinator
            .assign(
                &ConversationId::new(conversation),
                specialization.map(Specialization::new),
            )
            .await
            .map(|agent| agent.to_string())
            .map_err(|report| format!("{report:#}"))
    }

    fn cmd_get(&self, conversation: &str) -> String {
        match self.coordinator.get_assignment(&ConversationId::new(conversation)) {
            Some(agent) => agent.to_string(),
            None => format!("{conversation} is not assigned"),
        }
    }

    fn cmd_complete(&self, conversation: &str) -> String {
        match self.coordinator.complete(&ConversationId::new(conversation)) {
            CompleteOutcome::Completed(assignment) => {
                format!("{conversation} completed, {} released", assignment.agent_id)
            }
            CompleteOutcome::AlreadyCompleted => format!("{conversation} was already completed"),
            CompleteOutcome::Unknown => format!("{conversation} is not assigned"),
        }
    }

    async fn cmd_learn(&self, conversation: &str) -> String {
        match self.coordinator.learn(&ConversationId::new(conversation)).await {
            Some(agent) => agent.to_string(),
            None => format!("no decision found for {conversation}"),
        }
    }

    fn cmd_reset(&self, node: &str) -> Result<String, String> {
        if self.coordinator.reset_node(&NodeId::new(node)) {
            Ok(format!("{node} reset to healthy"))
        } else {
            Err(format!("unknown node {node}"))
        }
    }

    fn cmd_status(&self) -> Result<String, String> {
        serde_json::to_string_pretty(&self.coordinator.status()).map_err(|e| e.to_string())
    }

    fn cmd_metrics(&self) -> String {
        String::from_utf8_lossy(&self.coordinator.metrics().encode())
            .trim_end()
            .to_owned()
    }

    fn help() -> String {
        r"Available commands:
  assign <conversation> [specialization]  - Assign a conversation to an agent
  get <conversation>                      - Show the decided agent, without consensus
  complete <conversation>                 - Release the agent of a finished conversation
  learn <conversation>                    - Ask the cluster for an existing decision
  reset <node>                            - Mark a dead node healthy again
  status                                  - Print node status as JSON
  metrics                                 - Print counters in the Prometheus text format
  help                                    - Show this help
  exit / quit                             - Exit the REPL"
            .to_owned()
    }
}

/// Read commands from stdin until `exit`, EOF or a readline error.
///
/// Readline blocks, so it runs on the blocking pool and hands lines over a
/// channel.
pub async fn run<T: NodeTransport>(context: ReplContext<T>) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(error) => {
            warn!(%error, "cannot start the REPL");
            return;
        }
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1);
    let (resp_tx, mut resp_rx) = tokio::sync::mpsc::channel::<Result<String, String>>(1);
    let prompt = format!("{}> ", context.coordinator.node_id());

    tokio::task::spawn_blocking(move || {
        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "exit" || line == "quit" {
                        break;
                    }

                    let _ = rl.add_history_entry(line);
                    if tx.blocking_send(line.to_owned()).is_err() {
                        break;
                    }

                    match resp_rx.blocking_recv() {
                        Some(Ok(output)) if !output.is_empty() => println!("{output}"),
                        Some(Err(e)) => eprintln!("Error: {e}"),
                        _ => {}
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("Interrupted. Use 'exit' to quit.");
                }
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("Readline error: {e}");
                    break;
                }
            }
        }
    });

    while let Some(line) = rx.recv().await {
        let result = context.execute(&line).await;
        let _ = resp_tx.send(result).await;
    }
}

#[cfg(test)]
mod tests {
    use switchboard_coordinator::{CoordinatorConfig, MemoryNetwork, MemoryTransport, Member};

    use super::*;

    fn context() -> ReplContext<MemoryTransport> {
        let network = MemoryNetwork::new();
        let mut config = CoordinatorConfig::new(
            "node-1",
            [Member::new("node-1", "127.0.0.1:0", [Specialization::new("support")])],
        );
        config.seed = Some(3);
        let coordinator = Coordinator::new(config, network.endpoint(NodeId::new("node-1"))).unwrap();
        ReplContext::new(Arc::new(coordinator))
    }

    #[tokio::test]
    async fn test_assign_then_get_and_complete() {
        let repl = context();
        assert_eq!(repl.execute("assign c-1 support").await.unwrap(), "agent-node-1");
        assert_eq!(repl.execute("get c-1").await.unwrap(), "agent-node-1");
        assert_eq!(
            repl.execute("complete c-1").await.unwrap(),
            "c-1 completed, agent-node-1 released"
        );
        assert_eq!(repl.execute("get c-2").await.unwrap(), "c-2 is not assigned");
    }

    #[tokio::test]
    async fn test_metrics_after_assign() {
        let repl = context();
        repl.execute("assign c-1 support").await.unwrap();
        let metrics = repl.execute("metrics").await.unwrap();
        assert!(metrics.contains("consensus_rounds_decided_total 1"), "{metrics}");
        assert!(metrics.contains(r#"agent_assignments_total{specialization="support"} 1"#));
    }

    #[tokio::test]
    async fn test_errors_and_usage() {
        let repl = context();
        assert!(repl.execute("assign c-1 billing").await.unwrap_err().contains("no eligible agent"));
        assert!(repl.execute("assign").await.unwrap_err().starts_with("Usage"));
        assert!(repl.execute("reset node-9").await.is_err());
        assert!(repl.execute("frobnicate").await.is_err());
        assert_eq!(repl.execute("   ").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_status_is_json() {
        let repl = context();
        repl.execute("assign c-1").await.unwrap();
        let status: serde_json::Value =
            serde_json::from_str(&repl.execute("status").await.unwrap()).unwrap();
        assert_eq!(status["node_id"], "node-1");
        assert_eq!(status["active_conversations"], 1);
        assert_eq!(status["metrics"]["agent_assignments_by_specialization"]["general"], 1);
    }
}
