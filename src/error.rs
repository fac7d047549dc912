//! Error types surfaced by the cluster and proxy layers.

use thiserror::Error;

/// Joining the cluster failed.  Reported at startup; the agent keeps
/// serving requests that only concern the local node.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("no seed reachable after {attempts} attempt(s): {reason}")]
    Unreachable { attempts: u32, reason: String },
    #[error("membership protocol error: {0}")]
    Protocol(#[from] anyhow::Error),
}

/// Terminal failure of a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("agent management is disabled")]
    ManagementDisabled,
    #[error("resource {0} not found on any known node")]
    Unresolved(String),
    #[error("member {member} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        member: String,
        attempts: u32,
        reason: String,
    },
    #[error("member {member} did not answer in time")]
    Timeout { member: String },
}

impl ProxyError {
    /// Machine-readable failure kind returned to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::ManagementDisabled => "management_disabled",
            ProxyError::Unresolved(_) => "unresolved",
            ProxyError::Unreachable { .. } => "unreachable",
            ProxyError::Timeout { .. } => "timeout",
        }
    }
}
