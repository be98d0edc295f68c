//! # Enforcer Proxy
//!
//! Represents a remote datapath running in a per-PU child. The first
//! `enforce` for a context launches the child, pushes the secret
//! material and queue layout through `Init`, then programs the policy.
//! The proxy also runs the stats channel the children report their
//! flows on.

use std::sync::Arc;

use async_trait::async_trait;
use cache::Cache;
use processmon::ProcessMon;
use rpc_wrapper::{
    EnforcePayload, InitRequestPayload, RequestPayload, Response, RpcClientManager, RpcHandler,
    RpcServer, StatsPayload, UnEnforcePayload, STATS_CHANNEL,
};
use shared_types::{Collector, FilterQueue, PuInfo, Secrets};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{EnforcerError, PolicyEnforcer};

/// Default token validity pushed to children.
const DEFAULT_VALIDITY_SECS: u64 = 3600;

/// Enforcer handle forwarding to per-PU children.
pub struct EnforcerProxy {
    server_id: String,
    rpc: Arc<RpcClientManager>,
    processes: Arc<ProcessMon>,
    secrets: Arc<dyn Secrets>,
    filter_queue: FilterQueue,
    mutual_auth: bool,
    validity_secs: u64,
    collector: Arc<dyn Collector>,
    stats_secret: Vec<u8>,
    /// Children that have received their `Init`.
    initialized: Cache<String, ()>,
    stats_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl EnforcerProxy {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: impl Into<String>,
        rpc: Arc<RpcClientManager>,
        processes: Arc<ProcessMon>,
        secrets: Arc<dyn Secrets>,
        filter_queue: FilterQueue,
        mutual_auth: bool,
        collector: Arc<dyn Collector>,
        stats_secret: Vec<u8>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            rpc,
            processes,
            secrets,
            filter_queue,
            mutual_auth,
            validity_secs: DEFAULT_VALIDITY_SECS,
            collector,
            stats_secret,
            initialized: Cache::new(),
            stats_task: Mutex::new(None),
        }
    }

    /// The identity pushed to children.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn init_payload(&self, context_id: &str) -> InitRequestPayload {
        InitRequestPayload {
            filter_queue: self.filter_queue,
            mutual_auth: self.mutual_auth,
            validity_secs: self.validity_secs,
            secret_type: self.secrets.secrets_type(),
            context_id: context_id.to_string(),
            ca_pem: self.secrets.auth_pem(),
            public_pem: self.secrets.transmitted_pem(),
            private_pem: self.secrets.encoding_pem(),
        }
    }
}

#[async_trait]
impl PolicyEnforcer for EnforcerProxy {
    async fn enforce(&self, context_id: &str, pu: &PuInfo) -> Result<(), EnforcerError> {
        let pid = pu.runtime.pid();
        if pid <= 0 {
            return Err(EnforcerError::ChildLaunchFailed(format!(
                "context {context_id} has no pid to attach to"
            )));
        }
        self.processes
            .launch_process(context_id, pid)
            .map_err(|e| EnforcerError::ChildLaunchFailed(e.to_string()))?;

        if self.initialized.get(&context_id.to_string()).is_err() {
            self.rpc
                .remote_call_checked(
                    context_id,
                    RequestPayload::Init(self.init_payload(context_id)),
                )
                .await?;
            self.initialized.add_or_update(context_id.to_string(), ());
        }

        self.rpc
            .remote_call_checked(
                context_id,
                RequestPayload::Enforce(EnforcePayload::from_pu(pu)),
            )
            .await?;
        info!(context_id, "Remote enforce completed");
        Ok(())
    }

    async fn unenforce(&self, context_id: &str) -> Result<(), EnforcerError> {
        let result = self
            .rpc
            .remote_call_checked(
                context_id,
                RequestPayload::UnEnforce(UnEnforcePayload {
                    context_id: context_id.to_string(),
                }),
            )
            .await;
        if let Err(e) = result {
            debug!(context_id, error = %e, "Remote unenforce failed");
        }
        // Stats from a child on its way out are suppressed.
        let _ = self.processes.set_exit_status(context_id, true);
        self.processes.kill_process(context_id).await;
        let _ = self.initialized.remove(&context_id.to_string());
        Ok(())
    }

    async fn start(&self) -> Result<(), EnforcerError> {
        let mut guard = self.stats_task.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = RpcServer::new(STATS_CHANNEL, self.stats_secret.clone());
        let handler = Arc::new(StatsHandler {
            collector: Arc::clone(&self.collector),
            processes: Arc::clone(&self.processes),
        });
        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(handler, shutdown_rx).await {
                warn!(error = %e, "Stats server failed");
            }
        });
        *guard = Some((shutdown_tx, task));
        Ok(())
    }

    async fn stop(&self) -> Result<(), EnforcerError> {
        for context_id in self.initialized.keys() {
            let _ = self.unenforce(&context_id).await;
        }
        if let Some((shutdown_tx, task)) = self.stats_task.lock().await.take() {
            let _ = shutdown_tx.send(true);
            let _ = task.await;
        }
        Ok(())
    }
}

/// Handler for the stats channel: forwards child flow reports to the
/// collector, dropping reports from children marked for deletion.
struct StatsHandler {
    collector: Arc<dyn Collector>,
    processes: Arc<ProcessMon>,
}

#[async_trait]
impl RpcHandler for StatsHandler {
    async fn handle(&self, payload: RequestPayload) -> Response {
        match payload {
            RequestPayload::Stats(StatsPayload { flows, .. }) => {
                for flow in flows {
                    if self.processes.get_exit_status(&flow.context_id) {
                        continue;
                    }
                    self.collector.collect_flow_event(
                        &flow.context_id,
                        &flow.source_ip,
                        &flow.destination_ip,
                        flow.action,
                    );
                }
                Response::success()
            }
            other => Response::error(format!(
                "stats channel does not serve {}",
                other.method()
            )),
        }
    }
}
