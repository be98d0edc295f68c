//! # Remote Enforcer Child
//!
//! The per-PU process the manager launches. It joins the PU's network
//! namespace before the runtime starts threads, then serves the
//! authenticated envelope on its socket: `Init` carries secret material
//! and queue layout, `InitSupervisor` the target networks, and the
//! `Supervise`/`Enforce` pairs program a local supervisor and enforcer
//! from inside the namespace. `EnforcerExit` shuts the process down.

use std::os::fd::AsFd;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use enforcer::{LocalEnforcer, NullDatapath, PolicyEnforcer};
use rpc_wrapper::{
    RequestPayload, Response, RpcClientManager, RpcHandler, RpcServer, StatsPayload,
    ENV_RPC_SECRET, ENV_STATS_SECRET,
};
use shared_types::{FilterQueue, PkiSecrets, PskSecrets, Secrets, SecretsType};
use supervisor::{IptablesProvider, IptablesSupervisor, ShellIptables, Supervisor};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATS_CLIENT_KEY: &str = "stats";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let context_id = std::env::args()
        .nth(1)
        .context("missing context id argument")?;
    let socket_path = std::env::var("SOCKET_PATH").context("SOCKET_PATH not set")?;
    let container_pid: i32 = std::env::var("CONTAINER_PID")
        .context("CONTAINER_PID not set")?
        .parse()
        .context("CONTAINER_PID is not a pid")?;
    let secret = hex::decode(std::env::var(ENV_RPC_SECRET).unwrap_or_default())
        .context("channel secret is not hex")?;
    let stats_path = std::env::var("STATSCHANNEL_PATH").unwrap_or_default();
    let stats_secret =
        hex::decode(std::env::var(ENV_STATS_SECRET).unwrap_or_default()).unwrap_or_default();

    // Join the PU's namespace on the main thread, before the runtime
    // exists: threads spawned afterwards inherit it.
    join_netns(container_pid)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(
            context_id,
            socket_path,
            secret,
            stats_path,
            stats_secret,
        ))
}

fn join_netns(container_pid: i32) -> Result<()> {
    let path = format!("/proc/{container_pid}/ns/net");
    let file = std::fs::File::open(&path)
        .with_context(|| format!("cannot open namespace {path}"))?;
    nix::sched::setns(file.as_fd(), nix::sched::CloneFlags::CLONE_NEWNET)
        .with_context(|| format!("cannot join namespace {path}"))?;
    info!(container_pid, "Joined network namespace");
    Ok(())
}

async fn run(
    context_id: String,
    socket_path: String,
    secret: Vec<u8>,
    stats_path: String,
    stats_secret: Vec<u8>,
) -> Result<()> {
    let host_ipt: Arc<dyn IptablesProvider> = match ShellIptables::new() {
        Ok(provider) => Arc::new(provider),
        Err(e) => bail!("iptables unavailable inside namespace: {e}"),
    };

    let stats = Arc::new(RpcClientManager::new());
    if !stats_path.is_empty() {
        stats.new_client_with_secret(STATS_CLIENT_KEY, &stats_path, stats_secret);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handler = Arc::new(EnforcerServer {
        context_id: context_id.clone(),
        host_ipt,
        filter_queue: Mutex::new(FilterQueue::default()),
        supervisor: Mutex::new(None),
        enforcer: Mutex::new(None),
        shutdown: shutdown_tx,
        stats: Arc::clone(&stats),
    });

    info!(context_id, socket = socket_path, "Remote enforcer serving");
    let server = RpcServer::new(&socket_path, secret);
    server
        .serve(handler, shutdown_rx)
        .await
        .context("rpc server failed")?;
    info!(context_id, "Remote enforcer exiting");
    Ok(())
}

/// Dispatches the envelope against the in-namespace components.
struct EnforcerServer {
    context_id: String,
    host_ipt: Arc<dyn IptablesProvider>,
    filter_queue: Mutex<FilterQueue>,
    supervisor: Mutex<Option<Arc<IptablesSupervisor>>>,
    enforcer: Mutex<Option<Arc<LocalEnforcer>>>,
    shutdown: watch::Sender<bool>,
    stats: Arc<RpcClientManager>,
}

impl EnforcerServer {
    fn build_secrets(
        secret_type: SecretsType,
        private_pem: Vec<u8>,
        public_pem: Vec<u8>,
        ca_pem: Vec<u8>,
    ) -> Arc<dyn Secrets> {
        match secret_type {
            SecretsType::Psk => Arc::new(PskSecrets::new(private_pem)),
            SecretsType::Pki => Arc::new(PkiSecrets::new(private_pem, public_pem, ca_pem)),
        }
    }

    /// Flush any pending flow records to the parent before exiting.
    async fn flush_stats(&self) {
        let payload = RequestPayload::Stats(StatsPayload {
            num_flows: 0,
            flows: Vec::new(),
        });
        if let Err(e) = self.stats.remote_call_checked(STATS_CLIENT_KEY, payload).await {
            warn!(error = %e, "Final stats flush failed");
        }
    }
}

#[async_trait]
impl RpcHandler for EnforcerServer {
    async fn handle(&self, payload: RequestPayload) -> Response {
        match payload {
            RequestPayload::Init(init) => {
                let secrets = Self::build_secrets(
                    init.secret_type,
                    init.private_pem,
                    init.public_pem,
                    init.ca_pem,
                );
                *self.filter_queue.lock().await = init.filter_queue;
                let enforcer = Arc::new(LocalEnforcer::new(
                    init.context_id,
                    secrets,
                    init.filter_queue,
                    Arc::new(NullDatapath),
                ));
                if let Err(e) = enforcer.start().await {
                    return Response::error(e.to_string());
                }
                *self.enforcer.lock().await = Some(enforcer);
                info!(context_id = self.context_id, "Enforcer initialized");
                Response::success()
            }

            RequestPayload::InitSupervisor(init) => {
                let filter_queue = *self.filter_queue.lock().await;
                let supervisor = Arc::new(IptablesSupervisor::new(
                    Arc::clone(&self.host_ipt),
                    filter_queue,
                    init.target_networks,
                ));
                if let Err(e) = supervisor.start().await {
                    return Response::error(e.to_string());
                }
                *self.supervisor.lock().await = Some(supervisor);
                info!(context_id = self.context_id, "Supervisor initialized");
                Response::success()
            }

            RequestPayload::Supervise(payload) => {
                let Some(supervisor) = self.supervisor.lock().await.clone() else {
                    return Response::error("supervisor not initialized");
                };
                let pu = payload.into_pu();
                match supervisor.supervise(&pu.context_id, &pu).await {
                    Ok(()) => Response::success(),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            RequestPayload::Enforce(payload) => {
                let Some(enforcer) = self.enforcer.lock().await.clone() else {
                    return Response::error("enforcer not initialized");
                };
                let pu = payload.into_pu();
                match enforcer.enforce(&pu.context_id, &pu).await {
                    Ok(()) => Response::success(),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            RequestPayload::UnSupervise(payload) => {
                let Some(supervisor) = self.supervisor.lock().await.clone() else {
                    return Response::error("supervisor not initialized");
                };
                match supervisor.unsupervise(&payload.context_id).await {
                    Ok(()) => Response::success(),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            RequestPayload::UnEnforce(payload) => {
                let Some(enforcer) = self.enforcer.lock().await.clone() else {
                    return Response::error("enforcer not initialized");
                };
                match enforcer.unenforce(&payload.context_id).await {
                    Ok(()) => Response::success(),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            RequestPayload::EnforcerExit(_) => {
                info!(context_id = self.context_id, "Exit requested");
                self.flush_stats().await;
                let _ = self.shutdown.send(true);
                Response::success()
            }

            other => Response::error(format!(
                "remote enforcer does not serve {}",
                other.method()
            )),
        }
    }
}
