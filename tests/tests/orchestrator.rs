//! Orchestrator state machine scenarios: ordering, idempotence and
//! rollback, driven through the same handler contract the monitors use.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use monitor::EventHandler;
use shared_types::{DefaultCollector, EventType, PuState, TriremeError};
use trireme::Trireme;
use trireme_tests::{event, policy_with_ip, Call, CallLog, MockEnforcer, MockResolver, MockSupervisor};

struct Fixture {
    trireme: Arc<Trireme>,
    log: Arc<CallLog>,
    resolver: Arc<MockResolver>,
    supervisor: Arc<MockSupervisor>,
    enforcer: Arc<MockEnforcer>,
}

fn fixture(resolver_latency: Duration) -> Fixture {
    let log = CallLog::new();
    let resolver = MockResolver::with_latency(policy_with_ip("10.0.0.5"), resolver_latency);
    let supervisor = MockSupervisor::new(Arc::clone(&log));
    let enforcer = MockEnforcer::new(Arc::clone(&log));
    let trireme = Trireme::new(
        "test-server",
        Arc::clone(&resolver) as _,
        Arc::clone(&supervisor) as _,
        Arc::clone(&enforcer) as _,
        Arc::new(DefaultCollector),
    );
    Fixture {
        trireme,
        log,
        resolver,
        supervisor,
        enforcer,
    }
}

#[tokio::test]
async fn test_create_programs_supervise_then_enforce() {
    let f = fixture(Duration::ZERO);
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();

    assert_eq!(
        f.log.calls(),
        vec![
            Call::Supervise("svcA".to_string()),
            Call::Enforce("svcA".to_string())
        ]
    );
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Programmed));
}

#[tokio::test]
async fn test_redelivered_create_is_idempotent() {
    let f = fixture(Duration::ZERO);
    let create = event("svcA", "1234", EventType::Create);
    f.trireme.handle_event(create.clone()).await.unwrap();
    f.trireme.handle_event(create).await.unwrap();

    // Programming happened exactly once.
    assert_eq!(f.log.count_of(&Call::Supervise("svcA".to_string())), 1);
    assert_eq!(f.log.count_of(&Call::Enforce("svcA".to_string())), 1);
}

#[tokio::test]
async fn test_start_after_create_is_noop_when_unchanged() {
    let f = fixture(Duration::ZERO);
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Start))
        .await
        .unwrap();

    assert_eq!(f.log.count_of(&Call::Supervise("svcA".to_string())), 1);
}

#[tokio::test]
async fn test_start_with_new_address_reprograms() {
    let f = fixture(Duration::ZERO);
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();

    let mut start = event("svcA", "1234", EventType::Start);
    start
        .ip_addresses
        .insert(String::new(), "172.17.0.2".to_string());
    f.trireme.handle_event(start).await.unwrap();

    assert_eq!(f.log.count_of(&Call::Supervise("svcA".to_string())), 2);
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Programmed));
}

#[tokio::test]
async fn test_lifecycle_order_survives_resolver_latency() {
    // Events arrive in order create, stop, destroy; the slow resolver
    // must not let the stop overtake the create.
    let f = fixture(Duration::from_millis(50));

    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Stop))
        .await
        .unwrap();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Destroy))
        .await
        .unwrap();

    assert_eq!(
        f.log.calls(),
        vec![
            Call::Supervise("svcA".to_string()),
            Call::Enforce("svcA".to_string()),
            Call::Unenforce("svcA".to_string()),
            Call::Unsupervise("svcA".to_string()),
        ]
    );
    assert_eq!(f.trireme.context_state("svcA"), None);
    assert_eq!(f.resolver.delete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_enforce_failure_rolls_back_supervision() {
    let f = fixture(Duration::ZERO);
    f.enforcer.fail.store(true, Ordering::SeqCst);

    let err = f
        .trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap_err();
    assert!(matches!(err, TriremeError::Internal(_)));

    // Rollback in reverse order: the supervision was undone.
    assert_eq!(
        f.log.calls(),
        vec![
            Call::Supervise("svcA".to_string()),
            Call::Unsupervise("svcA".to_string()),
        ]
    );
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Failed));
}

#[tokio::test]
async fn test_supervise_failure_leaves_failed_state() {
    let f = fixture(Duration::ZERO);
    f.supervisor.fail.store(true, Ordering::SeqCst);

    let err = f
        .trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap_err();
    assert!(matches!(err, TriremeError::KernelProgrammingFailed(_)));
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Failed));
    // The enforcer was never reached.
    assert_eq!(f.log.count_of(&Call::Enforce("svcA".to_string())), 0);
}

#[tokio::test]
async fn test_resolver_denial_fails_pu() {
    let f = fixture(Duration::ZERO);
    f.resolver.deny.store(true, Ordering::SeqCst);

    let err = f
        .trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap_err();
    assert!(matches!(err, TriremeError::PolicyDenied(_)));
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Failed));
    assert!(f.log.calls().is_empty());
}

#[tokio::test]
async fn test_failed_pu_recovers_on_next_start() {
    let f = fixture(Duration::ZERO);
    f.resolver.deny.store(true, Ordering::SeqCst);
    let _ = f
        .trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await;

    // The denial is lifted; the next start programs the PU.
    f.resolver.deny.store(false, Ordering::SeqCst);
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Start))
        .await
        .unwrap();
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Programmed));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let f = fixture(Duration::ZERO);
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Stop))
        .await
        .unwrap();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Stop))
        .await
        .unwrap();

    assert_eq!(f.log.count_of(&Call::Unenforce("svcA".to_string())), 1);
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Stopped));
}

#[tokio::test]
async fn test_stop_for_unknown_pu_is_ok() {
    let f = fixture(Duration::ZERO);
    f.trireme
        .handle_event(event("ghost", "1", EventType::Stop))
        .await
        .unwrap();
    assert!(f.log.calls().is_empty());
}

#[tokio::test]
async fn test_cross_pu_events_are_independent() {
    let f = fixture(Duration::from_millis(20));

    let a = f
        .trireme
        .handle_event(event("svcA", "1", EventType::Create));
    let b = f
        .trireme
        .handle_event(event("svcB", "2", EventType::Create));
    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap();
    rb.unwrap();

    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Programmed));
    assert_eq!(f.trireme.context_state("svcB"), Some(PuState::Programmed));
}

#[tokio::test]
async fn test_update_policy_reprograms() {
    let f = fixture(Duration::ZERO);
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();

    f.trireme
        .update_policy("svcA", policy_with_ip("10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(f.log.count_of(&Call::Supervise("svcA".to_string())), 2);
    assert_eq!(f.log.count_of(&Call::Enforce("svcA".to_string())), 2);

    let err = f
        .trireme
        .update_policy("ghost", policy_with_ip("10.0.0.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, TriremeError::NotFound(_)));
}
