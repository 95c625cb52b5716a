//! Single-decree Paxos, one independent instance per key
//!
//! This library decides one value per key among a fixed set of nodes. Every
//! node plays all three roles.
//!
//! # Architecture
//!
//! - **Acceptors**: [`AcceptorHandler`] answers `Prepare`/`Accept`/`Learn`/`Query`
//!   for every key, keeping per-key state in [`SharedAcceptorState`]
//! - **Proposers**: [`Proposer`] runs rounds with retry and backoff over a
//!   [`Transport`], calling the local acceptor directly
//! - **Learners**: decisions are recorded through the [`Learner`] trait, and
//!   [`Proposer::learn`] recovers decisions from a majority of acceptors
//!
//! The transition logic lives in the pure [`core`] module so the model
//! checker exercises the same code as the runtime.
//!
//! # Quick Start
//!
//! ```ignore
//! use switchboard_paxos::{AcceptorHandler, Proposer, ProposerConfig};
//!
//! let handler = Arc::new(AcceptorHandler::new(node_id, learner));
//! // Inbound requests from other nodes
//! let response = handler.handle(envelope);
//!
//! let proposer = Proposer::new(handler, transport, ProposerConfig::default());
//! let decision = proposer.propose(&key, value, &targets, cluster_size).await?;
//! ```

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod config;
pub mod core;
mod messages;
pub mod proposer;
mod traits;

pub use acceptor::{AcceptorHandler, SharedAcceptorState};
pub use config::{BackoffConfig, ProposerConfig, RetryState, Sleep, TokioSleep};
pub use crate::core::{ProposalId, quorum};
pub use messages::{Envelope, Request, Response};
pub use proposer::{ConsensusFailed, Decision, Proposer};
pub use traits::{DecisionOf, Learner, ProposalOf, Protocol, Transport, TransportError};
