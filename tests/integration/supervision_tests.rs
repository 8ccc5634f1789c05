use chrono::Duration;

use super::helpers::*;
use wpheal::errors::{HealerError, HealingError, StoreError};
use wpheal::model::{CircuitState, ExecutionStatus, HealingConfig, RetryStrategy};
use wpheal::testing::MockBackupService;

/// Three heals that never bring the site back.
async fn trip_breaker(h: &Harness) {
    for _ in 0..3 {
        let execution = h.diagnose().await;
        let failed = h.heal_now(&execution.id).await;
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed
            .error
            .as_deref()
            .unwrap()
            .contains("Verification failed"));
    }
}

#[tokio::test]
async fn test_repeated_failures_open_breaker() {
    let h = broken_site(no_cooldown()).await;
    trip_breaker(&h).await;

    let target = h.target().await;
    assert_eq!(target.breaker.state, CircuitState::Open);
    assert_eq!(target.consecutive_failures, 3);
    assert!(target.breaker.reset_at.unwrap() > h.engine.now());
    // Verification failures are not retried.
    assert_eq!(h.engine.stats().retries_scheduled, 0);

    let blocked = h.diagnose().await;
    let calls = h.executor.call_count();
    let err = h.engine.heal(&blocked.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        HealerError::Healing(HealingError::CircuitOpen { .. })
    ));
    assert_eq!(h.executor.call_count(), calls);
    assert_eq!(h.engine.run_pending().await.unwrap(), 0);
    assert_eq!(h.execution(&blocked.id).await.status, ExecutionStatus::Diagnosed);
}

#[tokio::test]
async fn test_half_open_trial_closes_breaker() {
    let h = broken_site(no_cooldown()).await;
    trip_breaker(&h).await;

    h.clock.advance(Duration::hours(1));
    h.site_recovers();
    let execution = h.diagnose().await;
    let healed = h.heal_now(&execution.id).await;
    assert_eq!(healed.status, ExecutionStatus::Success);

    let target = h.target().await;
    assert_eq!(target.breaker.state, CircuitState::Closed);
    assert!(!target.breaker.trial_in_flight);
    assert_eq!(target.consecutive_failures, 0);
}

#[tokio::test]
async fn test_half_open_admits_one_trial() {
    let h = broken_site(no_cooldown()).await;
    trip_breaker(&h).await;
    h.clock.advance(Duration::hours(1));

    let trial = h.diagnose().await;
    let second = h.diagnose().await;
    h.engine.heal(&trial.id, None).await.unwrap();
    let target = h.target().await;
    assert_eq!(target.breaker.state, CircuitState::HalfOpen);
    assert!(target.breaker.trial_in_flight);

    let err = h.engine.heal(&second.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        HealerError::Healing(HealingError::TrialInFlight { .. })
            | HealerError::Healing(HealingError::HealingInProgress { .. })
    ));

    // The trial fails again and the breaker reopens.
    h.engine.run_pending().await.unwrap();
    let target = h.target().await;
    assert_eq!(target.breaker.state, CircuitState::Open);
    assert!(!target.breaker.trial_in_flight);
}

#[tokio::test]
async fn test_manual_reset_closes_breaker() {
    let h = broken_site(no_cooldown()).await;
    trip_breaker(&h).await;

    let target = h.engine.reset_circuit_breaker(SITE).await.unwrap();
    assert_eq!(target.breaker.state, CircuitState::Closed);
    assert_eq!(target.consecutive_failures, 0);

    let execution = h.diagnose().await;
    h.engine.heal(&execution.id, None).await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_build_retry_chain() {
    let h = harness_from(
        HealingConfig {
            retry_strategy: RetryStrategy::Exponential,
            ..no_cooldown()
        },
        broken_host().timeout_on("plugin deactivate"),
        MockBackupService::new(),
    )
    .await;

    let first = h.diagnose().await;
    h.site_recovers();
    h.engine.heal(&first.id, None).await.unwrap();
    assert_eq!(h.engine.run_pending().await.unwrap(), 3);

    let mut chain = h
        .engine
        .orchestrator()
        .execution_history(SITE, None)
        .await
        .unwrap();
    // All three share a timestamp on the frozen clock.
    chain.sort_by_key(|e| e.attempt);
    assert_eq!(chain.len(), 3);
    for (i, execution) in chain.iter().enumerate() {
        assert_eq!(execution.attempt, i as u32 + 1);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("timed out"));
    }
    assert!(chain[0].previous_attempt_id.is_none());
    assert_eq!(chain[1].previous_attempt_id.as_deref(), Some(chain[0].id.as_str()));
    assert_eq!(chain[2].previous_attempt_id.as_deref(), Some(chain[1].id.as_str()));

    let stats = h.engine.stats();
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.failures, 3);
    assert_eq!(h.target().await.breaker.state, CircuitState::Open);
}

#[tokio::test]
async fn test_non_retryable_failure_opens_breaker_immediately() {
    let h = broken_site(no_cooldown()).await;
    h.executor
        .add_failure("plugin deactivate", 1, "Error: permission denied");

    let execution = h.diagnose().await;
    h.site_recovers();
    let failed = h.heal_now(&execution.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);

    let target = h.target().await;
    assert_eq!(target.breaker.state, CircuitState::Open);
    assert_eq!(h.engine.stats().retries_scheduled, 0);
}

#[tokio::test]
async fn test_diagnosis_does_not_undo_concurrent_breaker_update() {
    let h = broken_site(no_cooldown()).await;
    // A job finishes and opens the breaker while the checks are running.
    h.store.after_next_diagnosis(|store| {
        store.update_target(SITE, |t| {
            t.breaker.state = CircuitState::Open;
            t.consecutive_failures = 3;
        });
    });

    let execution = h.diagnose().await;
    let target = h.target().await;
    assert_eq!(target.breaker.state, CircuitState::Open);
    assert_eq!(target.consecutive_failures, 3);
    assert_eq!(target.health_score, Some(execution.diagnosis.health_score));
    assert_eq!(target.last_diagnosed_at, Some(h.engine.now()));
}

#[tokio::test]
async fn test_trial_slot_released_when_approval_cannot_be_saved() {
    let h = broken_site(no_cooldown()).await;
    trip_breaker(&h).await;
    h.clock.advance(Duration::hours(1));

    let trial = h.diagnose().await;
    h.store
        .fail_next_execution_write(ExecutionStatus::Approved, "disk full");
    let err = h.engine.heal(&trial.id, None).await.unwrap_err();
    assert!(matches!(err, HealerError::Store(StoreError::Io { .. })));

    let target = h.target().await;
    assert_eq!(target.breaker.state, CircuitState::HalfOpen);
    assert!(!target.breaker.trial_in_flight);
    assert_eq!(h.execution(&trial.id).await.status, ExecutionStatus::Diagnosed);

    // The slot is free for the next attempt.
    h.engine.heal(&trial.id, None).await.unwrap();
    assert!(h.target().await.breaker.trial_in_flight);
}

#[tokio::test]
async fn test_store_failure_mid_job_does_not_strand_execution() {
    let h = broken_site(no_cooldown()).await;
    let execution = h.diagnose().await;
    h.site_recovers();
    h.store
        .fail_next_execution_write(ExecutionStatus::Success, "disk full");

    let aborted = h.heal_now(&execution.id).await;
    assert_eq!(aborted.status, ExecutionStatus::Failed);
    let error = aborted.error.as_deref().unwrap();
    assert!(error.contains("healing job aborted"));
    assert!(error.contains("disk full"));
    assert!(h.engine.active_execution(SITE).await.unwrap().is_none());
    assert_eq!(h.target().await.consecutive_failures, 1);

    let next = h.diagnose().await;
    h.engine.heal(&next.id, None).await.unwrap();
}
