use chrono::Duration;

use super::helpers::*;
use wpheal::errors::{DiagnosisError, HealerError, HealingError};
use wpheal::healing::AutoHealOutcome;
use wpheal::learning::fingerprint;
use wpheal::model::{
    DiagnosisType, ExecutionStatus, HealingConfig, HealingMode, HealingPattern,
};
use wpheal::testing::{MockBackupService, MockExecutor};

fn transitioned(log: &[wpheal::model::ExecutionLogEntry], from: ExecutionStatus, to: ExecutionStatus) -> bool {
    let wanted = format!("{} -> {}", from, to);
    log.iter().any(|e| e.message == wanted)
}

#[tokio::test]
async fn test_plugin_fault_heals_and_credits_pattern() {
    let h = broken_site(no_cooldown()).await;

    let execution = h.diagnose().await;
    let diagnosis = execution.diagnosis.diagnosis.clone();
    assert_eq!(execution.status, ExecutionStatus::Diagnosed);
    assert_eq!(diagnosis.diagnosis_type, DiagnosisType::PluginFault);
    assert_eq!(diagnosis.culprit.as_deref(), Some(BROKEN_PLUGIN));
    assert!((diagnosis.confidence - 0.95).abs() < f64::EPSILON);

    let pattern_id = fingerprint(&diagnosis);
    assert!(h.engine.patterns().get(&pattern_id).await.unwrap().is_none());

    h.site_recovers();
    let healed = h.heal_now(&execution.id).await;
    assert_eq!(healed.status, ExecutionStatus::Success, "{:?}", healed.error);
    assert!(healed.verification_score.unwrap() >= 80);
    assert!(h.executor.ran("plugin deactivate broken-plugin"));
    assert_eq!(h.backups.created().len(), 1);
    assert!(healed.backup.is_some());
    for (from, to) in [
        (ExecutionStatus::Diagnosed, ExecutionStatus::Approved),
        (ExecutionStatus::Approved, ExecutionStatus::Healing),
        (ExecutionStatus::Healing, ExecutionStatus::Success),
    ] {
        assert!(transitioned(&healed.log, from, to), "missing {} -> {}", from, to);
    }

    let learned = h.engine.patterns().get(&pattern_id).await.unwrap().unwrap();
    assert_eq!(learned.success_count, 1);
    assert!(learned.commands[0].contains("{path}"));

    // The plugin breaks again; the same fingerprint is credited exactly once more.
    h.prober.set_response(DOMAIN, 200, &critical_error_page());
    let again = h.diagnose().await;
    assert_eq!(fingerprint(&again.diagnosis.diagnosis), pattern_id);
    assert_eq!(
        again.learned_suggestion.as_ref().map(|s| s.pattern_id.as_str()),
        Some(pattern_id.as_str())
    );
    h.site_recovers();
    let healed_again = h.heal_now(&again.id).await;
    assert_eq!(healed_again.status, ExecutionStatus::Success);

    let credited = h.engine.patterns().get(&pattern_id).await.unwrap().unwrap();
    assert_eq!(credited.success_count, learned.success_count + 1);
    assert_eq!(credited.failure_count, 0);

    let target = h.target().await;
    assert_eq!(target.consecutive_failures, 0);
    assert!(target.last_healed_at.is_some());
    assert_eq!(h.engine.stats().successes, 2);
}

/// Auto-approved pattern that deactivates the broken plugin and flushes the cache.
fn auto_approved_pattern(h: &Harness) -> HealingPattern {
    let mut pattern = HealingPattern {
        id: "pat_cache_flush".to_string(),
        diagnosis_type: DiagnosisType::PluginFault,
        error_type: Some("plugin_fault".to_string()),
        culprit: BROKEN_PLUGIN.to_string(),
        error_pattern: None,
        commands: vec![
            "wp plugin deactivate broken-plugin --path={path} --skip-plugins --skip-themes"
                .to_string(),
            "wp cache flush --path={path}".to_string(),
        ],
        description: "deactivate and flush".to_string(),
        success_count: 5,
        failure_count: 0,
        confidence: 0.0,
        auto_approve: false,
        verified: false,
        created_at: h.engine.now(),
        last_used_at: None,
        last_success_at: None,
        last_failure_at: None,
    };
    pattern.recompute();
    assert!(pattern.auto_approve);
    pattern
}

#[tokio::test]
async fn test_auto_approved_pattern_replaces_default_remedy() {
    let h = broken_site(no_cooldown()).await;
    let pattern = auto_approved_pattern(&h);
    wpheal::store::Store::upsert_pattern(h.store.as_ref(), &pattern)
        .await
        .unwrap();

    let execution = h.diagnose().await;
    let suggestion = execution.learned_suggestion.clone().unwrap();
    assert!(suggestion.auto_approve);
    assert_eq!(suggestion.commands[1], "wp cache flush --path=/var/www/shop");

    h.site_recovers();
    let healed = h.heal_now(&execution.id).await;
    assert_eq!(healed.status, ExecutionStatus::Success);
    assert!(h.executor.ran("wp cache flush --path=/var/www/shop"));
    assert_eq!(healed.applied_pattern_id.as_deref(), Some("pat_cache_flush"));

    let credited = h.engine.patterns().get("pat_cache_flush").await.unwrap().unwrap();
    assert_eq!(credited.success_count, 6);
}

#[tokio::test]
async fn test_backup_failure_aborts_before_remediation() {
    let h = harness_with(no_cooldown(), MockBackupService::new().failing_create("no space left")).await;
    let execution = h.diagnose().await;
    h.site_recovers();

    let failed = h.heal_now(&execution.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("Backup"));
    assert!(!h.executor.ran("plugin deactivate"));
    assert!(failed.commands_executed.is_empty());
}

#[tokio::test]
async fn test_manual_override_continues_without_backup() {
    let h = harness_with(no_cooldown(), MockBackupService::new().failing_create("no space left")).await;
    let execution = h.diagnose().await;
    h.site_recovers();

    h.engine
        .heal(
            &execution.id,
            Some(vec!["wp plugin deactivate broken-plugin --path=/var/www/shop".to_string()]),
        )
        .await
        .unwrap();
    h.engine.run_pending().await.unwrap();

    let healed = h.execution(&execution.id).await;
    assert_eq!(healed.status, ExecutionStatus::Success);
    assert!(healed.backup.is_none());
    assert!(healed.log.iter().any(|e| e.message.contains("backup failed")));
    assert_eq!(
        healed.commands_executed,
        vec!["wp plugin deactivate broken-plugin --path=/var/www/shop".to_string()]
    );
}

#[tokio::test]
async fn test_unsafe_batch_rejected_before_anything_runs() {
    let h = broken_site(no_cooldown()).await;
    let execution = h.diagnose().await;
    let calls = h.executor.call_count();

    let err = h
        .engine
        .heal(
            &execution.id,
            Some(vec![
                "wp cache flush".to_string(),
                "rm -rf /var/www/shop".to_string(),
            ]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HealerError::Healing(HealingError::UnsafeCommand { .. })
    ));
    assert_eq!(h.executor.call_count(), calls);
    assert_eq!(h.engine.run_pending().await.unwrap(), 0);
    assert_eq!(h.execution(&execution.id).await.status, ExecutionStatus::Diagnosed);
}

#[tokio::test]
async fn test_blacklisted_plugin_is_refused() {
    let h = broken_site(HealingConfig {
        plugin_blacklist: vec![BROKEN_PLUGIN.to_string()],
        ..no_cooldown()
    })
    .await;
    let execution = h.diagnose().await;
    let err = h.engine.heal(&execution.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        HealerError::Healing(HealingError::Blacklisted { .. })
    ));
}

#[tokio::test]
async fn test_learned_pattern_cannot_bypass_blacklist() {
    let h = broken_site(HealingConfig {
        plugin_blacklist: vec![BROKEN_PLUGIN.to_string()],
        ..no_cooldown()
    })
    .await;
    let pattern = auto_approved_pattern(&h);
    wpheal::store::Store::upsert_pattern(h.store.as_ref(), &pattern)
        .await
        .unwrap();

    let execution = h.diagnose().await;
    assert!(execution.learned_suggestion.as_ref().unwrap().auto_approve);
    let calls = h.executor.call_count();

    let err = h.engine.heal(&execution.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        HealerError::Healing(HealingError::Blacklisted { ref name, .. }) if name == BROKEN_PLUGIN
    ));
    assert_eq!(h.engine.run_pending().await.unwrap(), 0);
    assert_eq!(h.executor.call_count(), calls);
    assert!(!h.executor.ran("plugin deactivate"));
    assert_eq!(h.execution(&execution.id).await.status, ExecutionStatus::Diagnosed);
}

#[tokio::test]
async fn test_rollback_restores_backup() {
    let h = broken_site(no_cooldown()).await;
    let execution = h.diagnose().await;

    let err = h.engine.rollback(&execution.id).await.unwrap_err();
    assert!(matches!(
        err,
        HealerError::Healing(HealingError::InvalidStateTransition { .. })
    ));

    h.site_recovers();
    let healed = h.heal_now(&execution.id).await;
    let backup_id = healed.backup.as_ref().unwrap().id.clone();

    let rolled = h.engine.rollback(&execution.id).await.unwrap();
    assert_eq!(rolled.status, ExecutionStatus::RolledBack);
    assert!(rolled.rolled_back_at.is_some());
    assert_eq!(h.backups.restored(), vec![backup_id]);
    assert_eq!(h.engine.stats().rollbacks, 1);
}

#[tokio::test]
async fn test_second_heal_rejected_while_first_in_flight() {
    let h = broken_site(no_cooldown()).await;
    let first = h.diagnose().await;
    let second = h.diagnose().await;

    h.engine.heal(&first.id, None).await.unwrap();
    let err = h.engine.heal(&second.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        HealerError::Healing(HealingError::HealingInProgress { ref execution_id, .. }) if *execution_id == first.id
    ));

    let again = h.engine.heal(&first.id, None).await.unwrap_err();
    assert!(matches!(
        again,
        HealerError::Healing(HealingError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn test_diagnosis_rate_limit() {
    let h = broken_site(HealingConfig::default()).await;
    h.diagnose().await;

    let err = h
        .engine
        .diagnose(SITE, wpheal::model::TriggerSource::Manual, &Default::default())
        .await
        .unwrap_err();
    match err {
        HealerError::Diagnosis(DiagnosisError::RateLimited { retry_after_secs, .. }) => {
            assert!(retry_after_secs > 0 && retry_after_secs <= 300);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }

    h.clock.advance(Duration::seconds(301));
    h.diagnose().await;
}

#[tokio::test]
async fn test_auto_heal_modes() {
    let auto = broken_site(HealingConfig {
        mode: HealingMode::Auto,
        ..no_cooldown()
    })
    .await;
    auto.site_recovers();
    // Log still shows the plugin fatal, so the diagnosis stays actionable.
    match auto.engine.auto_heal(SITE).await.unwrap() {
        AutoHealOutcome::Queued(response) => {
            auto.engine.run_pending().await.unwrap();
            let done = auto.execution(&response.execution_id).await;
            assert_eq!(done.status, ExecutionStatus::Success);
        }
        other => panic!("expected queued heal, got {other:?}"),
    }

    let supervised = broken_site(no_cooldown()).await;
    assert!(matches!(
        supervised.engine.auto_heal(SITE).await.unwrap(),
        AutoHealOutcome::AwaitingApproval { .. }
    ));

    let disabled = broken_site(HealingConfig {
        mode: HealingMode::Disabled,
        ..no_cooldown()
    })
    .await;
    assert!(matches!(
        disabled.engine.auto_heal(SITE).await.unwrap(),
        AutoHealOutcome::Disabled
    ));
    assert_eq!(disabled.executor.call_count(), 0);
}

#[tokio::test]
async fn test_history_and_trend() {
    let h = broken_site(no_cooldown()).await;
    let first = h.diagnose().await;
    h.clock.advance(Duration::minutes(5));
    h.site_recovers();
    h.heal_now(&first.id).await;
    h.clock.advance(Duration::minutes(5));
    h.diagnose().await;

    let executions = h
        .engine
        .orchestrator()
        .execution_history(SITE, None)
        .await
        .unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].id, first.id);

    let diagnoses = h
        .engine
        .orchestrator()
        .diagnosis_history(SITE, None)
        .await
        .unwrap();
    assert_eq!(diagnoses.len(), 2);

    let trend = h
        .engine
        .orchestrator()
        .health_trend(SITE, Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(trend.samples, 2);
    assert!(trend.min <= trend.max);
}

#[tokio::test]
async fn test_fatals_from_before_last_heal_are_ignored() {
    let stamped = |at: chrono::DateTime<chrono::Utc>| {
        format!(
            "[{}] PHP Fatal error:  Uncaught Error: boom in {}/wp-content/plugins/{}/init.php:7\n",
            at.format("%d-%b-%Y %H:%M:%S UTC"),
            PATH,
            BROKEN_PLUGIN
        )
    };
    // Inside the diagnosis window but older than the verification window.
    let logged_at = chrono::Utc::now() - Duration::minutes(10);
    let executor = MockExecutor::new()
        .on("tail -n", &stamped(logged_at).repeat(2))
        .on("else echo absent", "absent");
    let h = harness_from(
        HealingConfig {
            mode: HealingMode::Auto,
            ..no_cooldown()
        },
        executor,
        MockBackupService::new(),
    )
    .await;

    let execution = h.diagnose().await;
    assert_eq!(
        execution.diagnosis.diagnosis.diagnosis_type,
        DiagnosisType::PluginFault
    );
    h.site_recovers();
    let healed = h.heal_now(&execution.id).await;
    assert_eq!(healed.status, ExecutionStatus::Success);
    let pattern_id = fingerprint(&execution.diagnosis.diagnosis);
    assert_eq!(
        h.engine.patterns().get(&pattern_id).await.unwrap().unwrap().success_count,
        1
    );

    // The same fatals are still in the log tail, but they predate the heal.
    h.clock.advance(Duration::minutes(5));
    assert!(matches!(
        h.engine.auto_heal(SITE).await.unwrap(),
        AutoHealOutcome::Healthy { .. }
    ));
    assert_eq!(
        h.engine.patterns().get(&pattern_id).await.unwrap().unwrap().success_count,
        1
    );
}
