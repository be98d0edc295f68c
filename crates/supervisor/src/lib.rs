//! # Supervisor
//!
//! Programs kernel traffic filters implementing a PU's policy. For each
//! supervised PU an indexed pair of iptables chains steers the PU's
//! traffic into the enforcer's NFQUEUEs and applies the policy ACLs.
//! Chain names carry the `TRIREME-` prefix so a restart can enumerate
//! and reclaim leftovers from an unclean shutdown.
//!
//! Two implementations share the contract: [`IptablesSupervisor`]
//! programs the local kernel, [`SupervisorProxy`] forwards the calls to
//! a per-PU remote enforcer child.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod iptables;
pub mod provider;
pub mod proxy;
pub mod rules;
pub mod testing;

pub use iptables::IptablesSupervisor;
pub use provider::{IptablesProvider, ProviderError, ShellIptables};
pub use proxy::SupervisorProxy;

use async_trait::async_trait;
use shared_types::PuInfo;
use thiserror::Error;

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No PU is supervised under the context.
    #[error("No supervised PU in context {0}")]
    NotFound(String),

    /// iptables programming failed; partial rules were rolled back.
    #[error("Kernel programming failed: {0}")]
    KernelProgrammingFailed(String),

    /// The remote enforcer child could not be launched.
    #[error("Child launch failed: {0}")]
    ChildLaunchFailed(String),

    /// The remote enforcer child did not answer in time.
    #[error("Remote supervisor unavailable: {0}")]
    Unavailable(String),

    /// The remote enforcer child reported a failure.
    #[error("Remote supervisor error: {0}")]
    Remote(String),
}

impl From<rpc_wrapper::RpcError> for SupervisorError {
    fn from(err: rpc_wrapper::RpcError) -> Self {
        match err {
            rpc_wrapper::RpcError::Timeout => SupervisorError::Unavailable(err.to_string()),
            rpc_wrapper::RpcError::Transport(m) => SupervisorError::Unavailable(m),
            other => SupervisorError::Remote(other.to_string()),
        }
    }
}

/// The datapath programming contract.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Install or update the kernel state for a PU. Reprogramming an
    /// already supervised PU swaps to a fresh chain index; readers never
    /// observe a partially built chain.
    async fn supervise(&self, context_id: &str, pu: &PuInfo) -> Result<(), SupervisorError>;

    /// Remove the kernel state for a PU. Best-effort idempotent.
    async fn unsupervise(&self, context_id: &str) -> Result<(), SupervisorError>;

    /// Reclaim leftover state from a prior run and get ready to
    /// supervise.
    async fn start(&self) -> Result<(), SupervisorError>;

    /// Remove all state this supervisor owns.
    async fn stop(&self) -> Result<(), SupervisorError>;
}

/// Extension installing bypass rules for infrastructure addresses that
/// must never be steered into the queues.
pub trait Excluder: Send + Sync {
    fn add_excluded_ip(&self, ip: &str) -> Result<(), SupervisorError>;
    fn remove_excluded_ip(&self, ip: &str) -> Result<(), SupervisorError>;
}
