//! # Supervisor Proxy
//!
//! Forwards the supervise contract over the authenticated RPC channel
//! to the PU's remote enforcer child. The child programs iptables from
//! inside the PU's network namespace; exclusion bypasses stay on the
//! host and are programmed locally.

use std::sync::Arc;

use async_trait::async_trait;
use cache::Cache;
use processmon::ProcessMon;
use rpc_wrapper::{
    InitSupervisorPayload, RequestPayload, RpcClientManager, SupervisePayload, UnSupervisePayload,
};
use shared_types::{FilterQueue, PuInfo};
use tracing::{debug, info};

use crate::provider::IptablesProvider;
use crate::rules::exclusion_rules;
use crate::{Excluder, Supervisor, SupervisorError};

/// Supervisor forwarding to per-PU children.
pub struct SupervisorProxy {
    rpc: Arc<RpcClientManager>,
    processes: Arc<ProcessMon>,
    filter_queue: FilterQueue,
    target_networks: Vec<String>,
    /// Children that have received their `InitSupervisor`.
    initialized: Cache<String, ()>,
    /// Host-side backend for exclusion bypasses.
    host_ipt: Arc<dyn IptablesProvider>,
}

impl SupervisorProxy {
    #[must_use]
    pub fn new(
        rpc: Arc<RpcClientManager>,
        processes: Arc<ProcessMon>,
        filter_queue: FilterQueue,
        target_networks: Vec<String>,
        host_ipt: Arc<dyn IptablesProvider>,
    ) -> Self {
        Self {
            rpc,
            processes,
            filter_queue,
            target_networks,
            initialized: Cache::new(),
            host_ipt,
        }
    }
}

#[async_trait]
impl Supervisor for SupervisorProxy {
    async fn supervise(&self, context_id: &str, pu: &PuInfo) -> Result<(), SupervisorError> {
        let pid = pu.runtime.pid();
        if pid <= 0 {
            return Err(SupervisorError::ChildLaunchFailed(format!(
                "context {context_id} has no pid to attach to"
            )));
        }
        // Whichever proxy gets there first launches the child.
        self.processes
            .launch_process(context_id, pid)
            .map_err(|e| SupervisorError::ChildLaunchFailed(e.to_string()))?;

        if self.initialized.get(&context_id.to_string()).is_err() {
            self.rpc
                .remote_call_checked(
                    context_id,
                    RequestPayload::InitSupervisor(InitSupervisorPayload {
                        network_queues: self.filter_queue.network_balance(),
                        application_queues: self.filter_queue.application_balance(),
                        target_networks: self.target_networks.clone(),
                    }),
                )
                .await?;
            self.initialized.add_or_update(context_id.to_string(), ());
        }

        self.rpc
            .remote_call_checked(
                context_id,
                RequestPayload::Supervise(SupervisePayload::from_pu(pu)),
            )
            .await?;
        info!(context_id, "Remote supervise completed");
        Ok(())
    }

    async fn unsupervise(&self, context_id: &str) -> Result<(), SupervisorError> {
        let result = self
            .rpc
            .remote_call_checked(
                context_id,
                RequestPayload::UnSupervise(UnSupervisePayload {
                    context_id: context_id.to_string(),
                }),
            )
            .await;
        let _ = self.initialized.remove(&context_id.to_string());
        // A dead child has no state left to remove.
        if let Err(e) = result {
            debug!(context_id, error = %e, "Remote unsupervise failed");
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        for context_id in self.initialized.keys() {
            let _ = self.unsupervise(&context_id).await;
        }
        Ok(())
    }
}

impl Excluder for SupervisorProxy {
    fn add_excluded_ip(&self, ip: &str) -> Result<(), SupervisorError> {
        for (table, section, rule) in exclusion_rules(ip) {
            self.host_ipt
                .insert(&table, &section, 1, &rule)
                .map_err(|e| SupervisorError::KernelProgrammingFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn remove_excluded_ip(&self, ip: &str) -> Result<(), SupervisorError> {
        for (table, section, rule) in exclusion_rules(ip) {
            self.host_ipt
                .delete(&table, &section, &rule)
                .map_err(|e| SupervisorError::KernelProgrammingFailed(e.to_string()))?;
        }
        Ok(())
    }
}
