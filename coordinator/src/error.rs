use std::fmt;

/// Why `assign` returned without an agent. Use `error_stack::Report<AssignError>`
/// with context attachments for details; match on `Report::current_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    /// No healthy agent matches the requested specialization
    NoEligibleAgent,
    /// Consensus rounds kept failing; the caller may retry the whole `assign`
    ConsensusFailed,
    /// Fewer than a majority of nodes are healthy, no round was attempted
    QuorumUnavailable,
}

impl fmt::Display for AssignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEligibleAgent => f.write_str("no eligible agent"),
            Self::ConsensusFailed => f.write_str("consensus failed"),
            Self::QuorumUnavailable => f.write_str("quorum unavailable"),
        }
    }
}

impl std::error::Error for AssignError {}

/// Marker error for invalid configuration.
#[derive(Debug)]
pub struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid coordinator configuration")
    }
}

impl std::error::Error for ConfigError {}
