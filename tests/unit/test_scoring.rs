//! Properties of the health score, pattern confidence and retry backoff.

use chrono::Utc;
use proptest::prelude::*;
use wpheal::config::CheckWeights;
use wpheal::diagnosis::weighted_score;
use wpheal::model::{
    CheckPriority, CheckResult, CheckStatus, CheckType, DiagnosisType, HealingPattern,
    RetryStrategy, AUTO_APPROVE_CONFIDENCE, AUTO_APPROVE_MIN_SUCCESSES,
};
use wpheal::supervision::{classify_failure, delay_for, FailureClass};

const PRIORITIES: [CheckPriority; 4] = [
    CheckPriority::Critical,
    CheckPriority::High,
    CheckPriority::Medium,
    CheckPriority::Low,
];

const STATUSES: [CheckStatus; 5] = [
    CheckStatus::Pass,
    CheckStatus::Fail,
    CheckStatus::Warning,
    CheckStatus::Skipped,
    CheckStatus::Error,
];

fn result(i: usize, priority: usize, status: usize, score: u8) -> CheckResult {
    CheckResult::new(
        CheckType::ALL[i % CheckType::ALL.len()],
        PRIORITIES[priority % PRIORITIES.len()],
        STATUSES[status % STATUSES.len()],
        score,
        "scored",
    )
}

fn empty_pattern() -> HealingPattern {
    HealingPattern {
        id: "pat_test".to_string(),
        diagnosis_type: DiagnosisType::PluginFault,
        error_type: None,
        culprit: "*".to_string(),
        error_pattern: None,
        commands: vec!["wp cache flush --path={path}".to_string()],
        description: "flush".to_string(),
        success_count: 0,
        failure_count: 0,
        confidence: 0.0,
        auto_approve: false,
        verified: false,
        created_at: Utc::now(),
        last_used_at: None,
        last_success_at: None,
        last_failure_at: None,
    }
}

#[test]
fn test_weighted_score_examples() {
    let weights = CheckWeights::default();
    // Critical 100 (weight 3) and low 0 (weight 0.5): 300 / 3.5.
    let results = vec![
        CheckResult::new(CheckType::HttpAvailability, CheckPriority::Critical, CheckStatus::Pass, 100, "ok"),
        CheckResult::new(CheckType::CoreUpdates, CheckPriority::Low, CheckStatus::Fail, 0, "old"),
    ];
    assert_eq!(weighted_score(&results, &weights), 86);

    let skipped = vec![CheckResult::skipped(CheckType::SslCertificate, "no https")];
    assert_eq!(weighted_score(&skipped, &weights), 0);
    assert_eq!(weighted_score(&[], &weights), 0);
}

#[test]
fn test_backoff_strategies() {
    assert_eq!(delay_for(RetryStrategy::Immediate, 60_000, 3, u64::MAX), 0);
    assert_eq!(delay_for(RetryStrategy::Linear, 1_000, 3, u64::MAX), 3_000);
    assert_eq!(delay_for(RetryStrategy::Exponential, 1_000, 1, u64::MAX), 1_000);
    assert_eq!(delay_for(RetryStrategy::Exponential, 1_000, 4, u64::MAX), 8_000);
    assert_eq!(delay_for(RetryStrategy::Fibonacci, 1_000, 5, u64::MAX), 5_000);
    assert_eq!(delay_for(RetryStrategy::Exponential, 60_000, 10, 3_600_000), 3_600_000);
}

#[test]
fn test_failure_classes() {
    assert_eq!(classify_failure("Connection reset by peer"), FailureClass::Retryable);
    assert_eq!(
        classify_failure("Remote command timed out after 30 seconds"),
        FailureClass::Retryable
    );
    assert_eq!(classify_failure("Error: Permission denied"), FailureClass::NonRetryable);
    assert_eq!(
        classify_failure("connection refused: invalid credentials"),
        FailureClass::NonRetryable
    );
    assert_eq!(
        classify_failure("Verification failed with score 42"),
        FailureClass::Unclassified
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_weighted_score_in_range(
        checks in prop::collection::vec((0usize..9, 0usize..4, 0usize..5, 0u8..=255), 0..20)
    ) {
        let results: Vec<CheckResult> = checks
            .iter()
            .enumerate()
            .map(|(i, (t, p, s, score))| result(i + t, *p, *s, *score))
            .collect();
        let score = weighted_score(&results, &CheckWeights::default());
        prop_assert!(score <= 100);
    }

    #[test]
    fn prop_all_perfect_scores_give_100(priorities in prop::collection::vec(0usize..4, 1..12)) {
        let results: Vec<CheckResult> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| result(i, *p, 0, 100))
            .collect();
        prop_assert_eq!(weighted_score(&results, &CheckWeights::default()), 100);
    }

    #[test]
    fn prop_auto_approve_tracks_counters(outcomes in prop::collection::vec(any::<bool>(), 0..40)) {
        let mut pattern = empty_pattern();
        let now = Utc::now();
        for ok in outcomes {
            if ok {
                pattern.record_success(now);
            } else {
                pattern.record_failure(now);
            }
            prop_assert!((0.0..=1.0).contains(&pattern.confidence));
            prop_assert_eq!(
                pattern.auto_approve,
                pattern.confidence > AUTO_APPROVE_CONFIDENCE
                    && pattern.success_count >= AUTO_APPROVE_MIN_SUCCESSES
            );
        }
    }

    #[test]
    fn prop_backoff_is_pure_and_capped(
        base in 0u64..1_000_000,
        attempt in 1u32..80,
        cap in 0u64..10_000_000,
        strategy in prop::sample::select(vec![
            RetryStrategy::Immediate,
            RetryStrategy::Linear,
            RetryStrategy::Exponential,
            RetryStrategy::Fibonacci,
        ])
    ) {
        let first = delay_for(strategy, base, attempt, cap);
        prop_assert_eq!(first, delay_for(strategy, base, attempt, cap));
        prop_assert!(first <= cap);
        prop_assert!(delay_for(strategy, base, attempt + 1, cap) >= first);
    }
}
