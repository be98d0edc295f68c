//! # Configurator
//!
//! Helpers wiring a complete deployment: orchestrator, monitors and
//! either the local datapath components or the remote-enforcement
//! proxy set. Must run inside the tokio runtime, since the remote set
//! spawns its background tasks at construction.

use std::sync::Arc;

use cgnetcls::CgroupNetCls;
use enforcer::{EnforcerProxy, LocalEnforcer, NullDatapath, PolicyEnforcer};
use monitor::{
    DockerMetadataExtractor, DockerMonitor, Monitor, MonitorError, RpcMonitor,
    DEFAULT_DOCKER_SOCKET, DEFAULT_DOCKER_SOCKET_TYPE, MONITOR_SOCKET,
};
use processmon::ProcessMon;
use rpc_wrapper::{generate_secret, RpcClientManager};
use shared_types::{
    Collector, FilterQueue, PkiSecrets, PskSecrets, Secrets, TriremeError,
};
use supervisor::{
    Excluder, IptablesProvider, IptablesSupervisor, ShellIptables, Supervisor, SupervisorProxy,
};
use tracing::info;

use crate::{PolicyResolver, Trireme};

/// A wired deployment: the orchestrator plus its event sources and the
/// exclusion handle.
pub struct TriremeSet {
    pub trireme: Arc<Trireme>,
    pub docker_monitor: Arc<DockerMonitor>,
    pub rpc_monitor: Arc<RpcMonitor>,
    pub excluder: Arc<dyn Excluder>,
}

impl TriremeSet {
    /// Start everything: datapath components first, then the event
    /// sources.
    pub async fn start(&self) -> Result<(), TriremeError> {
        self.trireme.start().await?;
        self.docker_monitor
            .start()
            .await
            .map_err(monitor_err)?;
        self.rpc_monitor.start().await.map_err(monitor_err)?;
        Ok(())
    }

    /// Stop in reverse: no new events, drain PUs, tear down datapath.
    pub async fn stop(&self) {
        self.rpc_monitor.stop().await;
        self.docker_monitor.stop().await;
        self.trireme.stop().await;
    }
}

/// Everything needed to wire a deployment.
pub struct TriremeConfig {
    pub server_id: String,
    pub target_networks: Vec<String>,
    pub sync_at_start: bool,
    /// Launch a per-PU child instead of programming in process.
    pub remote_enforcer: bool,
    pub docker_socket_type: String,
    pub docker_socket: String,
    pub monitor_socket: String,
    /// Secret for the launcher channel on the monitor socket.
    pub monitor_secret: Vec<u8>,
    pub filter_queue: FilterQueue,
    pub mutual_auth: bool,
}

impl TriremeConfig {
    #[must_use]
    pub fn new(server_id: impl Into<String>, target_networks: Vec<String>) -> Self {
        Self {
            server_id: server_id.into(),
            target_networks,
            sync_at_start: true,
            remote_enforcer: false,
            docker_socket_type: DEFAULT_DOCKER_SOCKET_TYPE.to_string(),
            docker_socket: DEFAULT_DOCKER_SOCKET.to_string(),
            monitor_socket: MONITOR_SOCKET.to_string(),
            monitor_secret: Vec::new(),
            filter_queue: FilterQueue::default(),
            mutual_auth: false,
        }
    }
}

/// Wire a deployment around the given secrets.
pub fn new_trireme_with_docker_monitor(
    config: &TriremeConfig,
    resolver: Arc<dyn PolicyResolver>,
    collector: Arc<dyn Collector>,
    secrets: Arc<dyn Secrets>,
    extractor: Option<Arc<dyn DockerMetadataExtractor>>,
) -> Result<TriremeSet, TriremeError> {
    let host_ipt: Arc<dyn IptablesProvider> = Arc::new(
        ShellIptables::new().map_err(|e| TriremeError::Internal(e.to_string()))?,
    );

    let (supervisor, enforcer, excluder): (
        Arc<dyn Supervisor>,
        Arc<dyn PolicyEnforcer>,
        Arc<dyn Excluder>,
    ) = if config.remote_enforcer {
        let rpc = Arc::new(RpcClientManager::new());
        let stats_secret = generate_secret();
        let processes = Arc::new(ProcessMon::new(Arc::clone(&rpc), stats_secret.clone()));
        let supervisor = Arc::new(SupervisorProxy::new(
            Arc::clone(&rpc),
            Arc::clone(&processes),
            config.filter_queue,
            config.target_networks.clone(),
            Arc::clone(&host_ipt),
        ));
        let enforcer = Arc::new(EnforcerProxy::new(
            config.server_id.clone(),
            rpc,
            processes,
            secrets,
            config.filter_queue,
            config.mutual_auth,
            Arc::clone(&collector),
            stats_secret,
        ));
        info!("Configured remote enforcement");
        (
            Arc::clone(&supervisor) as Arc<dyn Supervisor>,
            enforcer as Arc<dyn PolicyEnforcer>,
            supervisor as Arc<dyn Excluder>,
        )
    } else {
        let supervisor = Arc::new(IptablesSupervisor::new(
            host_ipt,
            config.filter_queue,
            config.target_networks.clone(),
        ));
        let enforcer = Arc::new(LocalEnforcer::new(
            config.server_id.clone(),
            secrets,
            config.filter_queue,
            Arc::new(NullDatapath),
        ));
        info!("Configured local enforcement");
        (
            Arc::clone(&supervisor) as Arc<dyn Supervisor>,
            enforcer as Arc<dyn PolicyEnforcer>,
            supervisor as Arc<dyn Excluder>,
        )
    };

    let trireme = Trireme::new(
        config.server_id.clone(),
        resolver,
        supervisor,
        enforcer,
        collector,
    );

    let docker_monitor = Arc::new(
        DockerMonitor::new(
            &config.docker_socket_type,
            &config.docker_socket,
            Arc::clone(&trireme) as _,
            extractor,
            config.sync_at_start,
        )
        .map_err(monitor_err)?,
    );
    // Launched PUs are plain processes; the monitor marks their
    // traffic through net_cls.
    let rpc_monitor = Arc::new(
        RpcMonitor::new(
            &config.monitor_socket,
            config.monitor_secret.clone(),
            Arc::clone(&trireme) as _,
        )
        .with_net_cls(CgroupNetCls::new()),
    );

    Ok(TriremeSet {
        trireme,
        docker_monitor,
        rpc_monitor,
        excluder,
    })
}

/// Wire a deployment keyed by a pre-shared secret.
pub fn new_psk_trireme_with_docker_monitor(
    config: &TriremeConfig,
    key: Vec<u8>,
    resolver: Arc<dyn PolicyResolver>,
    collector: Arc<dyn Collector>,
    extractor: Option<Arc<dyn DockerMetadataExtractor>>,
) -> Result<TriremeSet, TriremeError> {
    new_trireme_with_docker_monitor(
        config,
        resolver,
        collector,
        Arc::new(PskSecrets::new(key)),
        extractor,
    )
}

/// Wire a deployment keyed by PKI material. Also returns the secrets
/// handle so callers can register peer public keys at runtime.
pub fn new_pki_trireme_with_docker_monitor(
    config: &TriremeConfig,
    key_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    ca_cert_pem: Vec<u8>,
    resolver: Arc<dyn PolicyResolver>,
    collector: Arc<dyn Collector>,
    extractor: Option<Arc<dyn DockerMetadataExtractor>>,
) -> Result<(TriremeSet, Arc<PkiSecrets>), TriremeError> {
    let secrets = Arc::new(PkiSecrets::new(key_pem, cert_pem, ca_cert_pem));
    let set = new_trireme_with_docker_monitor(
        config,
        resolver,
        collector,
        Arc::clone(&secrets) as Arc<dyn Secrets>,
        extractor,
    )?;
    Ok((set, secrets))
}

fn monitor_err(err: MonitorError) -> TriremeError {
    TriremeError::Unavailable(err.to_string())
}
