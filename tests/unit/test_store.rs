//! Stores: persistence across reopen, corrupted documents and field-level
//! health updates.

use chrono::{Duration, Utc};
use proptest::prelude::*;
use tokio_test::{assert_ok, block_on};
use wpheal::errors::StoreError;
use wpheal::model::{CircuitState, DiagnosisType, HealingPattern, HealthStatus, Target};
use wpheal::store::{JsonFileStore, MemoryStore, Store};

fn pattern(id: &str) -> HealingPattern {
    HealingPattern {
        id: id.to_string(),
        diagnosis_type: DiagnosisType::Maintenance,
        error_type: None,
        culprit: "*".to_string(),
        error_pattern: None,
        commands: vec!["rm -f {path}/.maintenance".to_string()],
        description: "clear maintenance lock".to_string(),
        success_count: 2,
        failure_count: 0,
        confidence: 1.0,
        auto_approve: false,
        verified: true,
        created_at: Utc::now(),
        last_used_at: None,
        last_success_at: None,
        last_failure_at: None,
    }
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("wpheal.json");

    {
        let store = JsonFileStore::open(&path).await.unwrap();
        let mut target = Target::new("blog", "blog.example.com", "/srv/blog");
        target.breaker.state = CircuitState::Open;
        target.breaker.reset_at = Some(Utc::now() + Duration::minutes(30));
        target.consecutive_failures = 3;
        store.upsert_target(&target).await.unwrap();
        store.upsert_pattern(&pattern("pat_a")).await.unwrap();
        store.upsert_pattern(&pattern("pat_b")).await.unwrap();
        assert!(store.delete_pattern("pat_b").await.unwrap());
    }
    assert!(path.exists());

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let target = reopened.get_target("blog").await.unwrap().unwrap();
    assert_eq!(target.breaker.state, CircuitState::Open);
    assert_eq!(target.consecutive_failures, 3);

    let patterns = reopened.list_patterns().await.unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].id, "pat_a");
    assert!(patterns[0].verified);
}

#[tokio::test]
async fn test_missing_and_empty_files_open_empty() {
    let dir = tempfile::tempdir().unwrap();

    let missing = JsonFileStore::open(dir.path().join("none.json")).await.unwrap();
    assert!(missing.list_targets().await.unwrap().is_empty());

    let empty_path = dir.path().join("empty.json");
    std::fs::write(&empty_path, "  \n").unwrap();
    let empty = JsonFileStore::open(&empty_path).await.unwrap();
    assert!(empty.list_patterns().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupted_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ \"targets\": [").unwrap();

    match JsonFileStore::open(&path).await {
        Err(StoreError::Corrupted(message)) => assert!(message.contains("broken.json")),
        Err(other) => panic!("expected Corrupted, got {other:?}"),
        Ok(_) => panic!("corrupted document opened"),
    }
}

#[tokio::test]
async fn test_health_update_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wpheal.json");
    let now = Utc::now();
    {
        let store = JsonFileStore::open(&path).await.unwrap();
        let mut target = Target::new("blog", "blog.example.com", "/srv/blog");
        target.breaker.state = CircuitState::Open;
        store.upsert_target(&target).await.unwrap();
        assert!(store.record_target_health("blog", 64, now).await.unwrap());
    }

    let reopened = JsonFileStore::open(&path).await.unwrap();
    let target = reopened.get_target("blog").await.unwrap().unwrap();
    assert_eq!(target.health_score, Some(64));
    assert_eq!(target.health_status, HealthStatus::Degraded);
    assert_eq!(target.breaker.state, CircuitState::Open);
}

const BREAKER_STATES: [CircuitState; 3] = [
    CircuitState::Closed,
    CircuitState::Open,
    CircuitState::HalfOpen,
];

proptest! {
    #[test]
    fn test_health_update_touches_only_health_fields(
        state in 0usize..3,
        trial in any::<bool>(),
        consecutive in 0u32..10,
        total in 0u32..100,
        score in 0u8..=100,
    ) {
        let store = MemoryStore::new();
        let mut target = Target::new("site", "example.com", "/var/www");
        target.breaker.state = BREAKER_STATES[state];
        target.breaker.trial_in_flight = trial;
        target.consecutive_failures = consecutive;
        target.total_failures = total;
        assert_ok!(block_on(store.upsert_target(&target)));

        let now = Utc::now();
        prop_assert!(block_on(store.record_target_health("site", score, now)).unwrap());
        let after = block_on(store.get_target("site")).unwrap().unwrap();
        prop_assert_eq!(after.breaker.state, BREAKER_STATES[state]);
        prop_assert_eq!(after.breaker.trial_in_flight, trial);
        prop_assert_eq!(after.consecutive_failures, consecutive);
        prop_assert_eq!(after.total_failures, total);
        prop_assert_eq!(after.health_score, Some(score));
        prop_assert_eq!(after.health_status, HealthStatus::from_score(score));
        prop_assert_eq!(after.last_diagnosed_at, Some(now));
    }
}
