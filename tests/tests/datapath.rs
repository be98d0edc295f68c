//! End-to-end lifecycle against the real supervisor and local enforcer,
//! with the kernel modeled by the recording provider: steering rule
//! shapes, policy version swaps and restart garbage collection.

use std::sync::Arc;

use enforcer::{LocalEnforcer, NullDatapath};
use monitor::EventHandler;
use shared_types::{DefaultCollector, EventType, FilterQueue, PskSecrets, PuState};
use supervisor::testing::FakeIptables;
use supervisor::{IptablesProvider, IptablesSupervisor};
use trireme::Trireme;
use trireme_tests::{event, policy_with_ip, MockResolver};

struct Fixture {
    trireme: Arc<Trireme>,
    fake: Arc<FakeIptables>,
    resolver: Arc<MockResolver>,
}

fn fixture() -> Fixture {
    let fake = Arc::new(FakeIptables::new());
    let supervisor = Arc::new(IptablesSupervisor::new(
        Arc::clone(&fake) as Arc<dyn IptablesProvider>,
        FilterQueue::default(),
        vec!["0.0.0.0/0".to_string()],
    ));
    let enforcer = Arc::new(LocalEnforcer::new(
        "test-server",
        Arc::new(PskSecrets::new(b"key".to_vec())),
        FilterQueue::default(),
        Arc::new(NullDatapath),
    ));
    let resolver = MockResolver::new(policy_with_ip("10.0.0.5"));
    let trireme = Trireme::new(
        "test-server",
        Arc::clone(&resolver) as _,
        supervisor as _,
        enforcer as _,
        Arc::new(DefaultCollector),
    );
    Fixture {
        trireme,
        fake,
        resolver,
    }
}

#[tokio::test]
async fn test_create_installs_expected_steering() {
    let f = fixture();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();

    // The application steering rule matches the policy address and
    // jumps to the index-1 chain.
    let steering = f.fake.rules_of("raw", "PREROUTING");
    assert_eq!(steering.len(), 1);
    assert_eq!(steering[0][0..2], ["-s", "10.0.0.5"]);
    assert_eq!(
        steering[0].last().map(String::as_str),
        Some("TRIREME-App-svcA-1")
    );
    assert!(f.fake.chain_exists("mangle", "TRIREME-Net-svcA-1"));
    assert_eq!(f.trireme.context_state("svcA"), Some(PuState::Programmed));
}

#[tokio::test]
async fn test_policy_update_moves_to_second_index() {
    let f = fixture();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();

    f.resolver.set_policy(policy_with_ip("10.0.0.5"));
    f.trireme
        .update_policy("svcA", policy_with_ip("10.0.0.5"))
        .await
        .unwrap();

    assert!(f.fake.chain_exists("raw", "TRIREME-App-svcA-2"));
    assert!(!f.fake.chain_exists("raw", "TRIREME-App-svcA-1"));
    let steering = f.fake.rules_of("raw", "PREROUTING");
    assert_eq!(
        steering[0].last().map(String::as_str),
        Some("TRIREME-App-svcA-2")
    );

    // The steering never pointed at both indexes at once.
    for snapshot in f.fake.reference_history() {
        let has_old = snapshot.iter().any(|t| t.ends_with("svcA-1"));
        let has_new = snapshot.iter().any(|t| t.ends_with("svcA-2"));
        assert!(!(has_old && has_new), "both indexes referenced: {snapshot:?}");
    }
}

#[tokio::test]
async fn test_redelivery_stays_on_index_one() {
    let f = fixture();
    let create = event("svcA", "1234", EventType::Create);
    f.trireme.handle_event(create.clone()).await.unwrap();
    f.trireme.handle_event(create.clone()).await.unwrap();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Start))
        .await
        .unwrap();

    assert!(f.fake.chain_exists("raw", "TRIREME-App-svcA-1"));
    assert!(!f.fake.chain_exists("raw", "TRIREME-App-svcA-2"));
}

#[tokio::test]
async fn test_stop_removes_kernel_state() {
    let f = fixture();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Create))
        .await
        .unwrap();
    f.trireme
        .handle_event(event("svcA", "1234", EventType::Stop))
        .await
        .unwrap();

    assert!(f.fake.prefixed_chains().is_empty());
    assert!(f.fake.rules_of("raw", "PREROUTING").is_empty());
}

#[tokio::test]
async fn test_start_reclaims_foreign_leftovers() {
    let f = fixture();
    f.fake.seed_chain("raw", "TRIREME-App-old-1");
    f.fake.seed_chain("mangle", "TRIREME-Net-old-1");

    f.trireme.start().await.unwrap();

    assert!(f.fake.prefixed_chains().is_empty());
}
