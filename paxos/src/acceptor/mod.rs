//! Acceptor runtime
//!
//! - [`SharedAcceptorState`]: per-instance acceptor state with fine-grained locking
//! - [`AcceptorHandler`]: dispatches protocol requests and records decisions

mod handler;
mod state;

pub use handler::AcceptorHandler;
pub use state::SharedAcceptorState;
