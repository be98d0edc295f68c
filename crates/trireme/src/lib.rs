//! # Trireme Orchestrator
//!
//! The PU-keyed state machine at the center of the control plane.
//! Monitors push normalized events in; the orchestrator resolves a
//! policy, programs the supervisor and the enforcer, and keeps the
//! per-PU context through `New`, `Programmed`, `Stopped`, `Destroyed`
//! and `Failed`.
//!
//! ## Ordering
//!
//! Events for one PU are serialized in arrival order behind a fair
//! per-key lock; PUs make progress independently of each other. A
//! failed transition rolls back the steps it took, parks the PU in
//! `Failed` and reports to the collector; the daemon keeps running.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod configurator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cache::Cache;
use enforcer::{EnforcerError, PolicyEnforcer};
use monitor::EventHandler;
use shared_types::{
    Collector, EventInfo, EventType, PuInfo, PuPolicy, PuRuntime, PuState, TriremeError,
};
use supervisor::{Supervisor, SupervisorError};
use tracing::{debug, info, warn};

/// Provider of policies. External to this crate; deployments implement
/// it against their policy store.
#[async_trait]
pub trait PolicyResolver: Send + Sync {
    /// Resolve the policy for a PU. An error denies the PU.
    async fn resolve_policy(
        &self,
        context_id: &str,
        runtime: &PuRuntime,
    ) -> Result<PuPolicy, TriremeError>;

    /// The PU was destroyed; the resolver may drop its state.
    async fn handle_pu_delete(&self, context_id: &str);
}

/// Per-PU context owned exclusively by the orchestrator.
#[derive(Debug, Clone)]
pub struct PuContext {
    pub context_id: String,
    pub runtime: PuRuntime,
    pub policy: Option<PuPolicy>,
    pub state: PuState,
    pub last_supervised: Option<Instant>,
    pub last_enforced: Option<Instant>,
}

/// The orchestrator.
pub struct Trireme {
    server_id: String,
    contexts: Cache<String, PuContext>,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    resolver: Arc<dyn PolicyResolver>,
    supervisor: Arc<dyn Supervisor>,
    enforcer: Arc<dyn PolicyEnforcer>,
    collector: Arc<dyn Collector>,
}

impl Trireme {
    #[must_use]
    pub fn new(
        server_id: impl Into<String>,
        resolver: Arc<dyn PolicyResolver>,
        supervisor: Arc<dyn Supervisor>,
        enforcer: Arc<dyn PolicyEnforcer>,
        collector: Arc<dyn Collector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.into(),
            contexts: Cache::new(),
            locks: parking_lot::Mutex::new(HashMap::new()),
            resolver,
            supervisor,
            enforcer,
            collector,
        })
    }

    /// The identity of this control plane instance.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Bring up the datapath components. The supervisor reclaims any
    /// kernel state left by an unclean shutdown before new PUs arrive.
    pub async fn start(&self) -> Result<(), TriremeError> {
        self.supervisor.start().await.map_err(sup_err)?;
        self.enforcer.start().await.map_err(enf_err)?;
        info!(server_id = self.server_id, "Trireme started");
        Ok(())
    }

    /// Tear down: evict every programmed PU, then stop the components.
    pub async fn stop(&self) {
        for context_id in self.contexts.keys() {
            let _ = self.handle_stop(&context_id).await;
        }
        let _ = self.enforcer.stop().await;
        let _ = self.supervisor.stop().await;
        info!(server_id = self.server_id, "Trireme stopped");
    }

    /// Current state of a PU, if the orchestrator tracks it.
    #[must_use]
    pub fn context_state(&self, context_id: &str) -> Option<PuState> {
        self.contexts
            .get(&context_id.to_string())
            .ok()
            .map(|c| c.state)
    }

    /// Replace the policy of a live PU: the supervisor swaps to a new
    /// chain index and the enforcer receives the new policy.
    pub async fn update_policy(
        &self,
        context_id: &str,
        policy: PuPolicy,
    ) -> Result<(), TriremeError> {
        let lock = self.lock_for(context_id);
        let _guard = lock.lock().await;

        let mut context = self
            .contexts
            .get(&context_id.to_string())
            .map_err(|_| TriremeError::NotFound(context_id.to_string()))?;
        let pu = PuInfo::new(context_id, context.runtime.clone(), policy.clone());

        if let Err(e) = self.supervisor.supervise(context_id, &pu).await {
            self.fail(&mut context, "policy update supervise failed");
            return Err(sup_err(e));
        }
        context.last_supervised = Some(Instant::now());
        if let Err(e) = self.enforcer.enforce(context_id, &pu).await {
            self.fail(&mut context, "policy update enforce failed");
            return Err(enf_err(e));
        }
        context.last_enforced = Some(Instant::now());
        context.policy = Some(policy);
        context.state = PuState::Programmed;
        self.contexts
            .add_or_update(context_id.to_string(), context);
        info!(context_id, "Policy updated");
        Ok(())
    }

    fn lock_for(&self, context_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(context_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn drop_lock(&self, context_id: &str) {
        self.locks.lock().remove(context_id);
    }

    fn fail(&self, context: &mut PuContext, reason: &str) {
        warn!(context_id = context.context_id, reason, "PU transition failed");
        context.state = PuState::Failed;
        self.contexts
            .add_or_update(context.context_id.clone(), context.clone());
        self.collector.collect_container_event(
            &context.context_id,
            &context.runtime.default_ip_address().unwrap_or_default(),
            &context.runtime.tags(),
            "failed",
        );
    }

    /// Resolve and program a PU, rolling back on failure. The context
    /// must already be stored; its runtime is the authority.
    async fn program(&self, context_id: &str) -> Result<(), TriremeError> {
        let mut context = self
            .contexts
            .get(&context_id.to_string())
            .map_err(|_| TriremeError::NotFound(context_id.to_string()))?;

        let policy = match self
            .resolver
            .resolve_policy(context_id, &context.runtime)
            .await
        {
            Ok(policy) => policy,
            Err(e) => {
                self.fail(&mut context, "resolver denied policy");
                return Err(TriremeError::PolicyDenied(e.to_string()));
            }
        };

        let pu = PuInfo::new(context_id, context.runtime.clone(), policy.clone());

        if let Err(e) = self.supervisor.supervise(context_id, &pu).await {
            self.fail(&mut context, "supervise failed");
            return Err(sup_err(e));
        }
        context.last_supervised = Some(Instant::now());

        if let Err(e) = self.enforcer.enforce(context_id, &pu).await {
            // Roll back in reverse order.
            let _ = self.supervisor.unsupervise(context_id).await;
            self.fail(&mut context, "enforce failed");
            return Err(enf_err(e));
        }
        context.last_enforced = Some(Instant::now());

        context.policy = Some(policy);
        context.state = PuState::Programmed;
        self.contexts
            .add_or_update(context_id.to_string(), context.clone());
        self.collector.collect_container_event(
            context_id,
            &context.runtime.default_ip_address().unwrap_or_default(),
            &context.runtime.tags(),
            "start",
        );
        info!(context_id, "PU programmed");
        Ok(())
    }

    async fn handle_create(&self, event: &EventInfo) -> Result<(), TriremeError> {
        let context_id = event.pu_id.as_str();
        if let Ok(existing) = self.contexts.get(&context_id.to_string()) {
            if existing.state == PuState::Programmed {
                debug!(context_id, "Redelivered create for programmed PU");
                return Ok(());
            }
        }

        let context = PuContext {
            context_id: context_id.to_string(),
            runtime: PuRuntime::from_event(event),
            policy: None,
            state: PuState::New,
            last_supervised: None,
            last_enforced: None,
        };
        self.contexts
            .add_or_update(context_id.to_string(), context);
        self.program(context_id).await
    }

    async fn handle_start(&self, event: &EventInfo) -> Result<(), TriremeError> {
        let context_id = event.pu_id.as_str();
        let Ok(mut context) = self.contexts.get(&context_id.to_string()) else {
            // Unknown PU on start: the resync path synthesizes start
            // events for containers created before this process.
            return self.handle_create(event).await;
        };

        let merged = merge_runtime(&context.runtime, event);
        if context.state == PuState::Programmed && merged == context.runtime {
            debug!(context_id, "Start for already programmed PU");
            return Ok(());
        }

        // The runtime gained information (the container got its address
        // and pid at start) or the PU is not programmed yet.
        context.runtime = merged;
        self.contexts
            .add_or_update(context_id.to_string(), context);
        self.program(context_id).await
    }

    async fn handle_stop(&self, context_id: &str) -> Result<(), TriremeError> {
        let Ok(mut context) = self.contexts.get(&context_id.to_string()) else {
            debug!(context_id, "Stop for unknown PU");
            return Ok(());
        };
        if matches!(context.state, PuState::Stopped | PuState::New) {
            return Ok(());
        }

        // Reverse of programming order.
        if let Err(e) = self.enforcer.unenforce(context_id).await {
            warn!(context_id, error = %e, "Unenforce failed during stop");
        }
        if let Err(e) = self.supervisor.unsupervise(context_id).await {
            warn!(context_id, error = %e, "Unsupervise failed during stop");
        }

        context.state = PuState::Stopped;
        self.contexts
            .add_or_update(context_id.to_string(), context.clone());
        self.collector.collect_container_event(
            context_id,
            &context.runtime.default_ip_address().unwrap_or_default(),
            &context.runtime.tags(),
            "stop",
        );
        info!(context_id, "PU stopped");
        Ok(())
    }

    async fn handle_destroy(&self, context_id: &str) -> Result<(), TriremeError> {
        if self.contexts.get(&context_id.to_string()).is_ok() {
            self.handle_stop(context_id).await?;
            let _ = self.contexts.remove(&context_id.to_string());
        }
        self.resolver.handle_pu_delete(context_id).await;
        self.collector.collect_container_event(
            context_id,
            "",
            &Default::default(),
            "destroy",
        );
        info!(context_id, "PU destroyed");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Trireme {
    async fn handle_event(&self, event: EventInfo) -> Result<(), TriremeError> {
        let lock = self.lock_for(&event.pu_id);
        let _guard = lock.lock().await;

        let result = match event.event_type {
            EventType::Create => self.handle_create(&event).await,
            EventType::Start => self.handle_start(&event).await,
            EventType::Stop => self.handle_stop(&event.pu_id).await,
            EventType::Destroy => self.handle_destroy(&event.pu_id).await,
            EventType::Pause | EventType::Unpause => {
                self.collector.collect_container_event(
                    &event.pu_id,
                    "",
                    &event.tags,
                    event.event_type.as_str(),
                );
                Ok(())
            }
        };

        if event.event_type == EventType::Destroy {
            drop(_guard);
            self.drop_lock(&event.pu_id);
        }
        result
    }
}

/// The stored runtime updated with whatever the event knows. Fields the
/// event does not carry keep their stored value.
fn merge_runtime(current: &PuRuntime, event: &EventInfo) -> PuRuntime {
    let mut merged = current.clone();
    if let Some(pid) = event.pid_as_i32() {
        merged.set_pid(pid);
    }
    if !event.ip_addresses.is_empty() {
        merged.set_ip_addresses(event.ip_addresses.clone());
    }
    merged
}

fn sup_err(err: SupervisorError) -> TriremeError {
    match err {
        SupervisorError::Unavailable(m) => TriremeError::Unavailable(m),
        SupervisorError::ChildLaunchFailed(m) => TriremeError::ChildLaunchFailed(m),
        other => TriremeError::KernelProgrammingFailed(other.to_string()),
    }
}

fn enf_err(err: EnforcerError) -> TriremeError {
    match err {
        EnforcerError::Unavailable(m) => TriremeError::Unavailable(m),
        EnforcerError::ChildLaunchFailed(m) => TriremeError::ChildLaunchFailed(m),
        other => TriremeError::Internal(other.to_string()),
    }
}
