//! # RPC Monitor
//!
//! Serves the authenticated envelope on the monitor socket. Launchers
//! send `HandleEvent` requests; anything else on this socket is
//! refused. A request whose payload lacks a valid `event_type` fails
//! envelope decoding and never reaches the handler.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cgnetcls::CgroupNetCls;
use rpc_wrapper::{RequestPayload, Response, RpcHandler, RpcServer};
use shared_types::{EventInfo, EventType};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{EventHandler, Monitor, MonitorError};

/// First class id handed to a launched PU. Grows monotonically.
const INITIAL_MARK: u64 = 100;

/// Monitor accepting launcher events over the authenticated channel.
///
/// PUs arriving here are plain processes, not containers, so the
/// monitor owns their traffic marking: each accepted `create` puts the
/// launched pid into a fresh `net_cls` cgroup with an allocated class
/// id, and `destroy` removes the group.
pub struct RpcMonitor {
    path: PathBuf,
    secret: Vec<u8>,
    handler: Arc<dyn EventHandler>,
    cgroups: Option<Arc<MarkAllocator>>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl RpcMonitor {
    #[must_use]
    pub fn new(path: impl AsRef<Path>, secret: Vec<u8>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            secret,
            handler,
            cgroups: None,
            task: Mutex::new(None),
        }
    }

    /// Assign launched PUs to `net_cls` cgroups through this
    /// controller.
    #[must_use]
    pub fn with_net_cls(mut self, controller: CgroupNetCls) -> Self {
        self.cgroups = Some(Arc::new(MarkAllocator {
            controller,
            next_mark: AtomicU64::new(INITIAL_MARK),
        }));
        self
    }

    /// The socket this monitor serves on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The net_cls controller plus the class id counter.
struct MarkAllocator {
    controller: CgroupNetCls,
    next_mark: AtomicU64,
}

impl MarkAllocator {
    fn assign(&self, event: &EventInfo) -> Result<(), cgnetcls::CgroupError> {
        let Some(pid) = event.pid_as_i32() else {
            return Ok(());
        };
        let mark = self.next_mark.fetch_add(1, Ordering::SeqCst);
        self.controller.create_group(&event.pu_id)?;
        self.controller.assign_mark(&event.pu_id, mark)?;
        self.controller.add_process(&event.pu_id, pid)?;
        Ok(())
    }

    fn release(&self, event: &EventInfo) {
        if let Err(e) = self.controller.delete_cgroup(&event.pu_id) {
            warn!(pu_id = event.pu_id, error = %e, "Cannot remove net_cls group");
        }
    }
}

#[async_trait]
impl Monitor for RpcMonitor {
    async fn start(&self) -> Result<(), MonitorError> {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = RpcServer::new(&self.path, self.secret.clone());
        let rpc_handler = Arc::new(MonitorRpcHandler {
            handler: Arc::clone(&self.handler),
            cgroups: self.cgroups.clone(),
        });
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(rpc_handler, shutdown_rx).await {
                warn!(path = %path.display(), error = %e, "RPC monitor failed");
            }
        });
        *guard = Some((shutdown_tx, task));
        info!(path = %self.path.display(), "RPC monitor started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some((shutdown_tx, task)) = self.task.lock().await.take() {
            let _ = shutdown_tx.send(true);
            let _ = task.await;
        }
    }
}

struct MonitorRpcHandler {
    handler: Arc<dyn EventHandler>,
    cgroups: Option<Arc<MarkAllocator>>,
}

#[async_trait]
impl RpcHandler for MonitorRpcHandler {
    async fn handle(&self, payload: RequestPayload) -> Response {
        match payload {
            RequestPayload::HandleEvent(event) => {
                if let Err(e) = self.handler.handle_event(event.clone()).await {
                    return Response::error(e.to_string());
                }
                if let Some(cgroups) = &self.cgroups {
                    match event.event_type {
                        EventType::Create => {
                            if let Err(e) = cgroups.assign(&event) {
                                warn!(pu_id = event.pu_id, error = %e,
                                    "Cannot place PU into net_cls group");
                                return Response::error(e.to_string());
                            }
                        }
                        EventType::Destroy => cgroups.release(&event),
                        _ => {}
                    }
                }
                Response::success()
            }
            other => Response::error(format!(
                "monitor does not serve {}",
                other.method()
            )),
        }
    }
}
