//! Remote enforcement over a real Unix socket: the proxies launch a
//! child, initialize it over the authenticated channel and program the
//! policy. A recording server stands in for the child's RPC side.

use std::sync::Arc;

use async_trait::async_trait;
use enforcer::{EnforcerError, EnforcerProxy, PolicyEnforcer};
use parking_lot::Mutex;
use processmon::{child_socket_path, ProcessMon};
use rpc_wrapper::{
    generate_secret, RequestPayload, Response, RpcClientManager, RpcHandler, RpcServer,
};
use shared_types::{
    DefaultCollector, FilterQueue, PskSecrets, PuInfo, PuPolicy, PuRuntime, SecretsType,
};
use supervisor::testing::FakeIptables;
use supervisor::{Supervisor, SupervisorProxy};
use tokio::sync::watch;

/// Records every method the fake child sees, plus the init details the
/// assertions care about.
#[derive(Default)]
struct ChildRecorder {
    methods: Mutex<Vec<String>>,
    init_context: Mutex<Option<(String, SecretsType)>>,
}

#[async_trait]
impl RpcHandler for ChildRecorder {
    async fn handle(&self, payload: RequestPayload) -> Response {
        self.methods.lock().push(payload.method().to_string());
        if let RequestPayload::Init(init) = &payload {
            *self.init_context.lock() = Some((init.context_id.clone(), init.secret_type));
        }
        Response::success()
    }
}

fn stub_child_binary(dir: &tempfile::TempDir) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("remote_enforcer");
    std::fs::write(&path, "#!/bin/sh\nsleep 5\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn pu_for(context_id: &str, pid: i32) -> PuInfo {
    let runtime = PuRuntime::new(pid, context_id, Default::default(), Default::default());
    PuInfo::new(context_id, runtime, PuPolicy::default())
}

#[tokio::test]
async fn test_remote_enforcement_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let binary = stub_child_binary(&dir);
    let ref_pid = std::process::id() as i32;

    let rpc = Arc::new(RpcClientManager::new());
    let stats_secret = generate_secret();
    let processes = Arc::new(ProcessMon::with_paths(
        Arc::clone(&rpc),
        stats_secret.clone(),
        dir.path().join("netns"),
        &binary,
    ));

    // Launch once so the channel secret exists, then stand up the
    // recording server where the child would listen.
    processes.launch_process("svcA", ref_pid).unwrap();
    let secret = rpc.secret_of("svcA").unwrap();
    let recorder = Arc::new(ChildRecorder::default());
    let server = RpcServer::new(child_socket_path(ref_pid), secret);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let served = {
        let recorder = Arc::clone(&recorder);
        tokio::spawn(async move { server.serve(recorder, shutdown_rx).await })
    };

    let fake_host = Arc::new(FakeIptables::new());
    let sup_proxy = SupervisorProxy::new(
        Arc::clone(&rpc),
        Arc::clone(&processes),
        FilterQueue::default(),
        vec!["0.0.0.0/0".to_string()],
        fake_host as _,
    );
    let enf_proxy = EnforcerProxy::new(
        "test-server",
        Arc::clone(&rpc),
        Arc::clone(&processes),
        Arc::new(PskSecrets::new(b"psk".to_vec())),
        FilterQueue::default(),
        false,
        Arc::new(DefaultCollector),
        stats_secret,
    );

    let pu = pu_for("svcA", ref_pid);
    sup_proxy.supervise("svcA", &pu).await.unwrap();
    enf_proxy.enforce("svcA", &pu).await.unwrap();
    // A second enforce reuses the initialized child.
    enf_proxy.enforce("svcA", &pu).await.unwrap();

    {
        let methods = recorder.methods.lock();
        assert_eq!(
            *methods,
            vec!["InitSupervisor", "Supervise", "Init", "Enforce", "Enforce"]
        );
    }
    let (init_ctx, secret_type) = recorder.init_context.lock().clone().unwrap();
    assert_eq!(init_ctx, "svcA");
    assert_eq!(secret_type, SecretsType::Psk);

    // Teardown: the graceful exit goes over the same channel and the
    // tracking state disappears.
    enf_proxy.unenforce("svcA").await.unwrap();
    {
        let methods = recorder.methods.lock();
        assert_eq!(methods.last().map(String::as_str), Some("EnforcerExit"));
        assert!(methods.iter().filter(|m| *m == "UnEnforce").count() == 1);
    }
    assert!(!processes.is_active("svcA"));
    assert!(!dir.path().join("netns").join("svcA").exists());

    shutdown_tx.send(true).unwrap();
    served.await.unwrap().unwrap();
    drop(sup_proxy);
    drop(enf_proxy);
    match Arc::try_unwrap(processes) {
        Ok(p) => p.shutdown().await,
        Err(_) => panic!("process manager still shared"),
    }
}

#[tokio::test]
async fn test_proxy_requires_a_pid() {
    let dir = tempfile::tempdir().unwrap();
    let binary = stub_child_binary(&dir);
    let rpc = Arc::new(RpcClientManager::new());
    let processes = Arc::new(ProcessMon::with_paths(
        Arc::clone(&rpc),
        generate_secret(),
        dir.path().join("netns"),
        &binary,
    ));

    let enf_proxy = EnforcerProxy::new(
        "test-server",
        Arc::clone(&rpc),
        Arc::clone(&processes),
        Arc::new(PskSecrets::new(b"psk".to_vec())),
        FilterQueue::default(),
        false,
        Arc::new(DefaultCollector),
        generate_secret(),
    );

    let pu = pu_for("svcA", 0);
    let err = enf_proxy.enforce("svcA", &pu).await.unwrap_err();
    assert!(matches!(err, EnforcerError::ChildLaunchFailed(_)));
    assert!(!processes.is_active("svcA"));
}
