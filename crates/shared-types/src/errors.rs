//! # Error Types
//!
//! The control-plane error surface. Component crates define their own
//! error enums; `TriremeError` is the shape they converge to at the
//! orchestrator boundary.

use thiserror::Error;

/// Errors surfaced by PU lifecycle transitions.
///
/// A failed transition rolls back its partial steps, leaves the PU in
/// `Failed` and emits a collector event; it never aborts the process.
#[derive(Debug, Clone, Error)]
pub enum TriremeError {
    /// A referenced PU or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A resource that must be created once already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// An RPC request failed HMAC verification.
    #[error("Unauthenticated request")]
    Unauthenticated,

    /// A collaborator could not be reached or timed out.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The resolver refused to grant a policy for the PU.
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// iptables/ipset/cgroup programming failed.
    #[error("Kernel programming failed: {0}")]
    KernelProgrammingFailed(String),

    /// A per-PU enforcer child could not be launched.
    #[error("Child launch failed: {0}")]
    ChildLaunchFailed(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}
