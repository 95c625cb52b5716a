//! Pure state machine core for Paxos - no I/O, no async
//!
//! This module contains the core state transition logic that is shared between:
//! - The async runtime implementation
//! - The Stateright model checker tests
//!
//! # Modules
//!
//! - [`types`]: Core type definitions (`ProposalId`, quorum size)
//! - [`acceptor`]: Acceptor state machine (`AcceptorCore`)
//! - [`proposer`]: Proposer state machine (`ProposerCore`)
//! - [`quorum`]: Quorum tracking (`QuorumCore`)

pub(crate) mod acceptor;
pub(crate) mod proposer;
pub(crate) mod quorum;
pub(crate) mod types;

pub use acceptor::{AcceptResult, AcceptorCore, PrepareResult};
pub use proposer::{AcceptPhaseResult, PreparePhaseResult, ProposerCore};
pub(crate) use quorum::QuorumCore;
pub use types::{ProposalId, quorum};
