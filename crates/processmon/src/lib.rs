//! # Process Manager
//!
//! Launches, tracks and terminates the per-PU enforcer children. Each
//! child joins its PU's network namespace through a symlink the manager
//! maintains under the netns directory, and serves the authenticated
//! RPC envelope on a per-PU socket.
//!
//! ## Lifecycle
//!
//! `launch_process` is idempotent per context. A launched child gets a
//! dedicated reaper task: the task first joins the stdout/stderr pumps
//! (so no output is lost), then waits on the child and posts the exit
//! status to a bounded channel. A collector drains that channel, logs
//! the exit and cleans up state for children that died without a
//! `kill_process` (crash recovery: the next event for the PU launches a
//! fresh child).

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cache::Cache;
use rpc_wrapper::{
    EnforcerExitPayload, RequestPayload, RpcClientManager, ENV_RPC_SECRET, ENV_STATS_SECRET,
    STATS_CHANNEL,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default directory for network namespace symlinks.
pub const NETNS_PATH: &str = "/var/run/netns/";

/// Default name of the enforcer child binary, resolved via PATH.
pub const ENFORCER_BINARY: &str = "remote_enforcer";

/// Capacity of the exit-status channel.
const EXIT_CHANNEL_CAPACITY: usize = 100;

/// Errors from child lifecycle operations.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The enforcer binary could not be spawned.
    #[error("Enforcer binary not found or not executable: {0}")]
    BinaryNotFound(String),

    /// No child is tracked for the context.
    #[error("No process in context {0}")]
    NotFound(String),

    /// Filesystem trouble around the netns directory.
    #[error("Process io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit record posted by a reaper.
#[derive(Debug)]
struct ExitRecord {
    pid: u32,
    context_id: String,
    status: Option<i32>,
}

/// State for one live child.
struct ProcessInfo {
    context_id: String,
    pid: u32,
    deleted: AtomicBool,
}

/// Launches and tracks per-PU enforcer children.
pub struct ProcessMon {
    active: Arc<Cache<String, Arc<ProcessInfo>>>,
    rpc: Arc<RpcClientManager>,
    netns_path: PathBuf,
    enforcer_binary: PathBuf,
    stats_secret: Vec<u8>,
    exit_tx: mpsc::Sender<ExitRecord>,
    collector: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProcessMon {
    /// Manager with the default netns directory and binary name. The
    /// stats secret is the one the enforcer proxy serves its stats
    /// channel with; every child receives it in its environment.
    #[must_use]
    pub fn new(rpc: Arc<RpcClientManager>, stats_secret: Vec<u8>) -> Self {
        Self::with_paths(rpc, stats_secret, NETNS_PATH, ENFORCER_BINARY)
    }

    /// Manager with explicit paths. Tests point both at scratch space.
    #[must_use]
    pub fn with_paths(
        rpc: Arc<RpcClientManager>,
        stats_secret: Vec<u8>,
        netns_path: impl AsRef<Path>,
        enforcer_binary: impl AsRef<Path>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active: Arc<Cache<String, Arc<ProcessInfo>>> = Arc::new(Cache::new());
        let collector = tokio::spawn(collect_exit_status(
            exit_rx,
            shutdown_rx,
            Arc::clone(&active),
            Arc::clone(&rpc),
            netns_path.as_ref().to_path_buf(),
        ));
        Self {
            active,
            rpc,
            netns_path: netns_path.as_ref().to_path_buf(),
            enforcer_binary: enforcer_binary.as_ref().to_path_buf(),
            stats_secret,
            exit_tx,
            collector,
            shutdown_tx,
        }
    }

    /// Whether a live child is tracked for the context.
    #[must_use]
    pub fn is_active(&self, context_id: &str) -> bool {
        self.active.get(&context_id.to_string()).is_ok()
    }

    /// Number of tracked children.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.size()
    }

    /// Reports whether the child is marked for deletion. A context with
    /// no tracked child reports `true`: the process is already gone.
    #[must_use]
    pub fn get_exit_status(&self, context_id: &str) -> bool {
        match self.active.get(&context_id.to_string()) {
            Ok(info) => info.deleted.load(Ordering::SeqCst),
            Err(_) => {
                debug!(context_id, "Process already dead");
                true
            }
        }
    }

    /// Mark the child for deletion, suppressing its stats during
    /// shutdown.
    pub fn set_exit_status(&self, context_id: &str, status: bool) -> Result<(), ProcessError> {
        let info = self
            .active
            .get(&context_id.to_string())
            .map_err(|_| ProcessError::NotFound(context_id.to_string()))?;
        info.deleted.store(status, Ordering::SeqCst);
        Ok(())
    }

    /// Launch the enforcer child for a context, joined to the network
    /// namespace of `ref_pid`. Succeeds immediately when a child is
    /// already active for the context.
    pub fn launch_process(&self, context_id: &str, ref_pid: i32) -> Result<(), ProcessError> {
        if self.is_active(context_id) {
            return Ok(());
        }

        std::fs::create_dir_all(&self.netns_path)?;
        let link = self.netns_link(context_id);
        if let Err(e) = std::os::unix::fs::symlink(format!("/proc/{ref_pid}/ns/net"), &link) {
            // An existing link from a prior run still points at the right
            // namespace; anything else is reported by the child's setns.
            warn!(context_id, error = %e, "Failed to create netns symlink");
        }

        let socket_path = child_socket_path(ref_pid);
        let secret = self.rpc.new_client(context_id, &socket_path);

        let spawned = Command::new(&self.enforcer_binary)
            .arg(context_id)
            .env("SOCKET_PATH", &socket_path)
            .env("STATSCHANNEL_PATH", STATS_CHANNEL)
            .env("CONTAINER_PID", ref_pid.to_string())
            .env(ENV_RPC_SECRET, hex::encode(&secret))
            .env(ENV_STATS_SECRET, hex::encode(&self.stats_secret))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(context_id, binary = %self.enforcer_binary.display(), error = %e,
                    "Enforcer binary not present in expected location");
                let _ = std::fs::remove_file(&link);
                self.rpc.destroy_client(context_id);
                return Err(ProcessError::BinaryNotFound(e.to_string()));
            }
        };

        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let ctx = context_id.to_string();
        let exit_tx = self.exit_tx.clone();

        tokio::spawn(async move {
            // Drain both streams before waiting so no output is missed.
            let out_pump = stdout.map(|s| tokio::spawn(pump_lines(s, ctx.clone(), "stdout")));
            let err_pump = stderr.map(|s| tokio::spawn(pump_lines(s, ctx.clone(), "stderr")));
            if let Some(handle) = out_pump {
                let _ = handle.await;
            }
            if let Some(handle) = err_pump {
                let _ = handle.await;
            }
            let status = child.wait().await.ok().and_then(|s| s.code());
            let _ = exit_tx
                .send(ExitRecord {
                    pid,
                    context_id: ctx,
                    status,
                })
                .await;
        });

        self.active.add_or_update(
            context_id.to_string(),
            Arc::new(ProcessInfo {
                context_id: context_id.to_string(),
                pid,
                deleted: AtomicBool::new(false),
            }),
        );
        info!(context_id, pid, "Launched enforcer child");
        Ok(())
    }

    /// Terminate the child for a context: graceful RPC exit first, kill
    /// on RPC failure. Always tears down the RPC client, the netns
    /// symlink and the tracking entry. Unknown contexts are a no-op.
    pub async fn kill_process(&self, context_id: &str) {
        let Ok(info) = self.active.get(&context_id.to_string()) else {
            info!(context_id, "Process already killed or never launched");
            return;
        };

        let exit = self
            .rpc
            .remote_call_checked(
                context_id,
                RequestPayload::EnforcerExit(EnforcerExitPayload { pid: info.pid }),
            )
            .await;
        if let Err(e) = exit {
            debug!(context_id, error = %e, "Graceful exit failed, killing child");
            kill_pid(info.pid);
        }

        self.rpc.destroy_client(context_id);
        let _ = std::fs::remove_file(self.netns_link(context_id));
        let _ = self.active.remove(&context_id.to_string());
        info!(context_id, pid = info.pid, "Enforcer child terminated");
    }

    /// Remove dangling netns symlinks left behind by an earlier run.
    pub fn reclaim_stale(&self) -> Result<usize, ProcessError> {
        let mut reclaimed = 0;
        let entries = match std::fs::read_dir(&self.netns_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if matches!(path.symlink_metadata().map(|m| m.file_type().is_symlink()), Ok(true))
                && std::fs::metadata(&path).is_err()
            {
                warn!(link = %path.display(), "Reclaiming stale netns symlink");
                let _ = std::fs::remove_file(&path);
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Stop the exit-status collector. Live children are not touched;
    /// callers kill them per context first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.collector.await;
    }

    fn netns_link(&self, context_id: &str) -> PathBuf {
        self.netns_path.join(context_id)
    }
}

/// Socket path a child serves on, derived from the namespace owner pid.
#[must_use]
pub fn child_socket_path(ref_pid: i32) -> String {
    format!("/tmp/{ref_pid}.sock")
}

fn kill_pid(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}

async fn pump_lines(
    stream: impl tokio::io::AsyncRead + Unpin,
    context_id: String,
    name: &'static str,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(context_id, stream = name, "{line}");
    }
}

/// Drains exit records, logs them and cleans up after children that
/// died without a `kill_process` call.
async fn collect_exit_status(
    mut exit_rx: mpsc::Receiver<ExitRecord>,
    mut shutdown: watch::Receiver<bool>,
    active: Arc<Cache<String, Arc<ProcessInfo>>>,
    rpc: Arc<RpcClientManager>,
    netns_path: PathBuf,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.changed() => return,
            record = exit_rx.recv() => match record {
                Some(record) => record,
                None => return,
            },
        };
        info!(
            context_id = record.context_id,
            pid = record.pid,
            status = record.status,
            "Enforcer exited"
        );
        // A record for a still-tracked child means it crashed. Drop the
        // tracking state so the next event launches a fresh child.
        if let Ok(info) = active.get(&record.context_id) {
            if info.pid == record.pid {
                let _ = active.remove(&record.context_id);
                rpc.destroy_client(&info.context_id);
                let _ = std::fs::remove_file(netns_path.join(&record.context_id));
            }
        }
    }
}
