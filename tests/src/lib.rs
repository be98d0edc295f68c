//! # Trireme Test Suite
//!
//! Shared mock components for the cross-crate scenarios under
//! `tests/`. The mocks record every call so ordering and rollback
//! assertions can run against the exact sequence the orchestrator
//! produced.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enforcer::{EnforcerError, PolicyEnforcer};
use parking_lot::Mutex;
use shared_types::{PuInfo, PuPolicy, PuRuntime, TriremeError};
use supervisor::{Supervisor, SupervisorError};
use trireme::PolicyResolver;

/// One recorded component call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Supervise(String),
    Unsupervise(String),
    Enforce(String),
    Unenforce(String),
}

/// Order-preserving record of component calls, shared between mocks.
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<Call>>,
}

impl CallLog {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn count_of(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }
}

/// Resolver handing out a fixed policy, with optional latency and
/// denial switches.
pub struct MockResolver {
    policy: Mutex<PuPolicy>,
    pub deny: AtomicBool,
    pub resolve_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    latency: Duration,
}

impl MockResolver {
    #[must_use]
    pub fn new(policy: PuPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy: Mutex::new(policy),
            deny: AtomicBool::new(false),
            resolve_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        })
    }

    /// Resolver that sleeps before answering, for ordering tests.
    #[must_use]
    pub fn with_latency(policy: PuPolicy, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            policy: Mutex::new(policy),
            deny: AtomicBool::new(false),
            resolve_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            latency,
        })
    }

    pub fn set_policy(&self, policy: PuPolicy) {
        *self.policy.lock() = policy;
    }
}

#[async_trait]
impl PolicyResolver for MockResolver {
    async fn resolve_policy(
        &self,
        context_id: &str,
        _runtime: &PuRuntime,
    ) -> Result<PuPolicy, TriremeError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(TriremeError::PolicyDenied(context_id.to_string()));
        }
        Ok(self.policy.lock().clone())
    }

    async fn handle_pu_delete(&self, _context_id: &str) {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Supervisor recording calls, with a failure switch.
pub struct MockSupervisor {
    log: Arc<CallLog>,
    pub fail: AtomicBool,
}

impl MockSupervisor {
    #[must_use]
    pub fn new(log: Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self {
            log,
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn supervise(&self, context_id: &str, _pu: &PuInfo) -> Result<(), SupervisorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SupervisorError::KernelProgrammingFailed(
                "mock failure".to_string(),
            ));
        }
        self.log.record(Call::Supervise(context_id.to_string()));
        Ok(())
    }

    async fn unsupervise(&self, context_id: &str) -> Result<(), SupervisorError> {
        self.log.record(Call::Unsupervise(context_id.to_string()));
        Ok(())
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        Ok(())
    }
}

/// Enforcer recording calls, with a failure switch.
pub struct MockEnforcer {
    log: Arc<CallLog>,
    pub fail: AtomicBool,
}

impl MockEnforcer {
    #[must_use]
    pub fn new(log: Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self {
            log,
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PolicyEnforcer for MockEnforcer {
    async fn enforce(&self, context_id: &str, _pu: &PuInfo) -> Result<(), EnforcerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EnforcerError::Datapath("mock failure".to_string()));
        }
        self.log.record(Call::Enforce(context_id.to_string()));
        Ok(())
    }

    async fn unenforce(&self, context_id: &str) -> Result<(), EnforcerError> {
        self.log.record(Call::Unenforce(context_id.to_string()));
        Ok(())
    }

    async fn start(&self) -> Result<(), EnforcerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), EnforcerError> {
        Ok(())
    }
}

/// A policy pinning one default address, the shape most scenarios use.
#[must_use]
pub fn policy_with_ip(ip: &str) -> PuPolicy {
    let mut policy = PuPolicy::default();
    policy.policy_ips.insert(String::new(), ip.to_string());
    policy
}

/// A minimal monitor event.
#[must_use]
pub fn event(
    pu_id: &str,
    pid: &str,
    event_type: shared_types::EventType,
) -> shared_types::EventInfo {
    shared_types::EventInfo {
        pu_id: pu_id.to_string(),
        name: format!("/bin/{pu_id}"),
        tags: [("role".to_string(), "db".to_string())].into(),
        pid: pid.to_string(),
        event_type,
        ip_addresses: Default::default(),
    }
}
