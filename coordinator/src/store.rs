//! Conversation assignments decided by consensus
//!
//! The store is a projection of decisions. It never runs a protocol of its
//! own: entries arrive from local decisions, `Learn` announcements and
//! learner queries, and a decided entry is never overwritten.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use switchboard_paxos::ProposalId;
use tracing::{debug, trace};

use crate::cluster::{AgentId, ConversationId, NodeId};
use crate::heartbeat::HealthSnapshot;

/// The owner of one conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationAssignment {
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub proposal_id: ProposalId<NodeId>,
    pub decided: bool,
}

/// Result of [`AssignmentStore::put_if_absent_or_matching`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// First decision for the conversation
    Inserted,
    /// First decision for the conversation, which a peer already completed
    InsertedCompleted,
    /// The same agent was already decided
    Matching,
    /// A different agent is decided; the store is unchanged
    Conflict(ConversationAssignment),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed(ConversationAssignment),
    AlreadyCompleted,
    /// Nothing is decided for the conversation on this node
    Unknown,
}

#[derive(Debug)]
struct Entry {
    assignment: ConversationAssignment,
    completed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AssignmentStore {
    local: NodeId,
    replication_factor: usize,
    decided: Mutex<HashMap<ConversationId, Entry>>,
    pending: Mutex<HashMap<ConversationId, ConversationAssignment>>,
    /// Completed by a peer before the decision reached this node
    completed_early: Mutex<HashSet<ConversationId>>,
}

impl AssignmentStore {
    pub fn new(local: NodeId, replication_factor: usize) -> Self {
        Self {
            local,
            replication_factor,
            decided: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            completed_early: Mutex::new(HashSet::new()),
        }
    }

    /// The decided assignment of `conversation`, completed or not
    #[must_use]
    pub fn get(&self, conversation: &ConversationId) -> Option<ConversationAssignment> {
        lock(&self.decided)
            .get(conversation)
            .map(|entry| entry.assignment.clone())
    }

    /// Store a decided assignment unless a different agent is already decided.
    pub fn put_if_absent_or_matching(&self, assignment: ConversationAssignment) -> PutOutcome {
        let conversation = assignment.conversation_id.clone();
        let outcome = {
            let mut decided = lock(&self.decided);
            match decided.get(&conversation) {
                Some(entry) if entry.assignment.agent_id == assignment.agent_id => PutOutcome::Matching,
                Some(entry) => PutOutcome::Conflict(entry.assignment.clone()),
                None => {
                    let completed = lock(&self.completed_early).remove(&conversation);
                    debug!(
                        conversation = %conversation,
                        agent = %assignment.agent_id,
                        proposal = %assignment.proposal_id,
                        completed,
                        "assignment decided"
                    );
                    decided.insert(
                        conversation.clone(),
                        Entry {
                            assignment: ConversationAssignment {
                                decided: true,
                                ..assignment
                            },
                            completed,
                        },
                    );
                    if completed {
                        PutOutcome::InsertedCompleted
                    } else {
                        PutOutcome::Inserted
                    }
                }
            }
        };
        if !matches!(outcome, PutOutcome::Conflict(_)) {
            lock(&self.pending).remove(&conversation);
        }
        outcome
    }

    /// Record the value this node is proposing for an undecided conversation.
    pub fn record_pending(
        &self,
        conversation: &ConversationId,
        agent: &AgentId,
        proposal: &ProposalId<NodeId>,
    ) {
        if lock(&self.decided).contains_key(conversation) {
            return;
        }
        trace!(%conversation, %agent, %proposal, "pending assignment");
        lock(&self.pending).insert(
            conversation.clone(),
            ConversationAssignment {
                conversation_id: conversation.clone(),
                agent_id: agent.clone(),
                proposal_id: proposal.clone(),
                decided: false,
            },
        );
    }

    #[must_use]
    pub fn pending(&self, conversation: &ConversationId) -> Option<ConversationAssignment> {
        lock(&self.pending).get(conversation).cloned()
    }

    /// Forget what this node was proposing for `conversation` after its
    /// rounds gave up.
    pub fn clear_pending(&self, conversation: &ConversationId) -> Option<ConversationAssignment> {
        lock(&self.pending).remove(conversation)
    }

    /// Mark a decided conversation as processed. The decision stays.
    pub fn complete(&self, conversation: &ConversationId) -> CompleteOutcome {
        mark_completed(&mut lock(&self.decided), conversation)
    }

    /// Apply a completion announced by a peer.
    ///
    /// If the decision has not reached this node yet, it is stored as
    /// completed when it does arrive.
    pub fn complete_announced(&self, conversation: &ConversationId) -> CompleteOutcome {
        let mut decided = lock(&self.decided);
        let outcome = mark_completed(&mut decided, conversation);
        if outcome == CompleteOutcome::Unknown {
            lock(&self.completed_early).insert(conversation.clone());
        }
        outcome
    }

    /// Decided conversations that are not completed yet
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.decided).values().filter(|e| !e.completed).count()
    }

    #[must_use]
    pub fn decided_count(&self) -> usize {
        lock(&self.decided).len()
    }

    /// Every decided assignment, ordered by conversation id
    #[must_use]
    pub fn assignments(&self) -> Vec<ConversationAssignment> {
        let mut assignments: Vec<_> = lock(&self.decided)
            .values()
            .map(|entry| entry.assignment.clone())
            .collect();
        assignments.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        assignments
    }

    /// Healthy peers that should hold a copy of the decision for
    /// `conversation`, highest rendezvous score first.
    ///
    /// Every node computes the same ordering, so the set only moves when
    /// health changes.
    #[must_use]
    pub fn replica_targets(
        &self,
        conversation: &ConversationId,
        snapshot: &HealthSnapshot,
    ) -> Vec<NodeId> {
        let count = self.replication_factor.saturating_sub(1);
        if count == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Reverse<(u64, NodeId)>> = BinaryHeap::new();
        for node in snapshot.healthy_nodes() {
            if node == self.local {
                continue;
            }
            let score = rendezvous_score(&node, conversation);
            if heap.len() < count {
                heap.push(Reverse((score, node)));
            } else if let Some(Reverse((min, _))) = heap.peek()
                && score > *min
            {
                heap.pop();
                heap.push(Reverse((score, node)));
            }
        }

        let mut replicas: Vec<_> = heap.into_iter().map(|Reverse(scored)| scored).collect();
        replicas.sort_by(|a, b| b.0.cmp(&a.0));
        replicas.into_iter().map(|(_, node)| node).collect()
    }
}

fn mark_completed(
    decided: &mut HashMap<ConversationId, Entry>,
    conversation: &ConversationId,
) -> CompleteOutcome {
    match decided.get_mut(conversation) {
        None => CompleteOutcome::Unknown,
        Some(entry) if entry.completed => CompleteOutcome::AlreadyCompleted,
        Some(entry) => {
            entry.completed = true;
            CompleteOutcome::Completed(entry.assignment.clone())
        }
    }
}

fn rendezvous_score(node: &NodeId, conversation: &ConversationId) -> u64 {
    let mut hasher = DefaultHasher::new();
    node.as_str().hash(&mut hasher);
    conversation.as_str().hash(&mut hasher);
    hasher.finish()
}
