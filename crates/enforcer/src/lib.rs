//! # Enforcer Handles
//!
//! The control-plane object representing a PU's datapath. The local
//! variant owns secrets and a datapath in this process; the proxy
//! variant launches a per-PU child in the PU's network namespace and
//! forwards the same contract over the authenticated RPC channel.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod local;
pub mod proxy;

pub use local::{Datapath, LocalEnforcer, NullDatapath};
pub use proxy::EnforcerProxy;

use async_trait::async_trait;
use shared_types::PuInfo;
use thiserror::Error;

/// Errors from enforcer operations.
#[derive(Debug, Error)]
pub enum EnforcerError {
    /// No policy is enforced under the context.
    #[error("No enforced PU in context {0}")]
    NotFound(String),

    /// The per-PU child could not be launched.
    #[error("Child launch failed: {0}")]
    ChildLaunchFailed(String),

    /// The child did not answer in time.
    #[error("Remote enforcer unavailable: {0}")]
    Unavailable(String),

    /// The child reported a failure.
    #[error("Remote enforcer error: {0}")]
    Remote(String),

    /// The local datapath rejected the policy.
    #[error("Datapath failure: {0}")]
    Datapath(String),
}

impl From<rpc_wrapper::RpcError> for EnforcerError {
    fn from(err: rpc_wrapper::RpcError) -> Self {
        match err {
            rpc_wrapper::RpcError::Timeout => EnforcerError::Unavailable(err.to_string()),
            rpc_wrapper::RpcError::Transport(m) => EnforcerError::Unavailable(m),
            other => EnforcerError::Remote(other.to_string()),
        }
    }
}

/// The policy enforcement contract.
#[async_trait]
pub trait PolicyEnforcer: Send + Sync {
    /// Hand a policy to the datapath for a PU. Re-enforcing an already
    /// enforced PU replaces its policy atomically.
    async fn enforce(&self, context_id: &str, pu: &PuInfo) -> Result<(), EnforcerError>;

    /// Evict a PU's policy from the datapath. Best-effort idempotent.
    async fn unenforce(&self, context_id: &str) -> Result<(), EnforcerError>;

    /// Bring up the datapath (or the stats plumbing, for the proxy).
    async fn start(&self) -> Result<(), EnforcerError>;

    /// Tear everything down, including remote children.
    async fn stop(&self) -> Result<(), EnforcerError>;
}
