//! Agent coordinator node
//!
//! Configuration parsing and the interactive REPL of the `switchboard`
//! binary.

#![warn(clippy::pedantic)]

pub mod args;
pub mod repl;

pub use args::Args;
pub use repl::ReplContext;
