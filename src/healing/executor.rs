//! Background half of a heal: runs one approved execution to a terminal state.
//!
//! Backup, remediation and verification happen here. The outcome feeds the
//! circuit breaker, the learned patterns and the diagnosis cache, and a
//! transient failure schedules a linked retry execution.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::remediation::{RemediationPlan, Remediator};
use crate::backup::BackupService;
use crate::clock::Clock;
use crate::config::HealingSettings;
use crate::diagnosis::DiagnosisCache;
use crate::engine::EngineStats;
use crate::errors::{HealerError, HealingError, Result};
use crate::learning::PatternStore;
use crate::model::{CircuitState, Execution, ExecutionStatus, LogLevel, Target};
use crate::observability::telemetry::{record_state_transition, redact_secrets};
use crate::queue::{HealingJob, JobQueue, JobRunner};
use crate::store::Store;
use crate::supervision::{
    classify_failure, CircuitBreaker, FailureClass, FailureOutcome, RetryDecision, RetryPolicy,
};
use crate::verification::Verifier;

pub struct HealingJobExecutor {
    store: Arc<dyn Store>,
    backups: Arc<dyn BackupService>,
    remediator: Arc<Remediator>,
    verifier: Arc<Verifier>,
    patterns: Arc<PatternStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    queue: Arc<dyn JobQueue>,
    cache: Arc<DiagnosisCache>,
    clock: Arc<dyn Clock>,
    settings: HealingSettings,
    stats: Arc<EngineStats>,
}

impl HealingJobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        backups: Arc<dyn BackupService>,
        remediator: Arc<Remediator>,
        verifier: Arc<Verifier>,
        patterns: Arc<PatternStore>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        queue: Arc<dyn JobQueue>,
        cache: Arc<DiagnosisCache>,
        clock: Arc<dyn Clock>,
        settings: HealingSettings,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            store,
            backups,
            remediator,
            verifier,
            patterns,
            breaker,
            retry,
            queue,
            cache,
            clock,
            settings,
            stats,
        }
    }

    fn transition(&self, execution: &mut Execution, next: ExecutionStatus) -> Result<()> {
        let from = execution.status;
        execution.transition(next, self.clock.now())?;
        record_state_transition(&execution.id, from.as_str(), next.as_str());
        Ok(())
    }

    async fn load_target(&self, target_id: &str) -> Result<Target> {
        self.store.get_target(target_id).await?.ok_or_else(|| {
            crate::errors::DiagnosisError::TargetNotFound(target_id.to_string()).into()
        })
    }

    /// Run one job. Errors here are bookkeeping failures; remediation
    /// failures end up on the execution record instead.
    pub async fn execute(&self, job: &HealingJob) -> Result<ExecutionStatus> {
        let mut execution = self
            .store
            .get_execution(&job.execution_id)
            .await?
            .ok_or_else(|| HealingError::ExecutionNotFound(job.execution_id.clone()))?;
        if execution.status != ExecutionStatus::Approved {
            warn!(
                execution_id = %execution.id,
                status = %execution.status,
                "Skipping job for execution that is not approved"
            );
            return Ok(execution.status);
        }
        let target = self.load_target(&execution.target_id).await?;

        self.transition(&mut execution, ExecutionStatus::Healing)?;
        self.store.upsert_execution(&execution).await?;
        info!(
            execution_id = %execution.id,
            target_id = %target.id,
            attempt = execution.attempt,
            max_attempts = execution.max_attempts,
            "Healing started"
        );

        let limit = Duration::from_secs(self.settings.job_timeout_secs);
        let outcome = match tokio::time::timeout(limit, self.perform(&target, &mut execution)).await
        {
            Ok(result) => result,
            Err(_) => Err(HealingError::JobTimeout {
                secs: self.settings.job_timeout_secs,
            }
            .into()),
        };

        match outcome {
            Ok(()) => self.on_success(execution).await,
            Err(e) => self.on_failure(execution, e).await,
        }
    }

    /// Backup, remediate, verify.
    async fn perform(&self, target: &Target, execution: &mut Execution) -> Result<()> {
        let plan = RemediationPlan::for_execution(execution)?;

        match self
            .backups
            .create_backup(target, &execution.path, self.settings.backup_kind)
            .await
        {
            Ok(backup) => {
                execution.push_log(
                    self.clock.now(),
                    LogLevel::Info,
                    format!("backup {} at {}", backup.id, backup.location),
                );
                execution.backup = Some(backup);
            }
            Err(e) if plan.is_manual_override() => {
                let reason = redact_secrets(&e.to_string());
                warn!(execution_id = %execution.id, error = %reason, "Backup failed, continuing manual override");
                execution.push_log(
                    self.clock.now(),
                    LogLevel::Warn,
                    format!("backup failed, continuing without rollback: {}", reason),
                );
            }
            Err(e) => return Err(e.into()),
        }
        self.store.upsert_execution(execution).await?;

        let remediation = self.remediator.remediate(target, execution, &plan).await;
        self.store.upsert_execution(execution).await?;
        remediation?;

        let report = self
            .verifier
            .verify(
                target,
                &execution.path,
                &execution.domain,
                execution.diagnosis.diagnosis.diagnosis_type,
            )
            .await;
        execution.verification_score = Some(report.score);
        execution.verification_details = serde_json::to_value(&report).ok();
        execution.push_log(
            self.clock.now(),
            if report.passed { LogLevel::Info } else { LogLevel::Warn },
            format!("verification score {}/{}", report.score, report.threshold),
        );
        if !report.passed {
            return Err(HealingError::VerificationFailed {
                score: report.score,
            }
            .into());
        }
        Ok(())
    }

    async fn on_success(&self, mut execution: Execution) -> Result<ExecutionStatus> {
        self.transition(&mut execution, ExecutionStatus::Success)?;
        self.store.upsert_execution(&execution).await?;

        let mut target = self.load_target(&execution.target_id).await?;
        self.breaker.on_success(&mut target);
        target.last_healed_at = Some(self.clock.now());
        self.store.upsert_target(&target).await?;

        if let Err(e) = self.patterns.learn_from_success(&execution.id).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to record learned pattern");
        }
        self.cache.invalidate(&target.id, None).await?;
        self.stats.record_success();
        info!(
            execution_id = %execution.id,
            target_id = %target.id,
            score = execution.verification_score.unwrap_or_default(),
            "Healing succeeded"
        );
        Ok(ExecutionStatus::Success)
    }

    async fn on_failure(&self, mut execution: Execution, err: HealerError) -> Result<ExecutionStatus> {
        let message = redact_secrets(&err.to_string());
        error!(execution_id = %execution.id, error = %message, "Healing failed");
        execution.error = Some(message.clone());
        execution.push_log(self.clock.now(), LogLevel::Error, message.clone());
        self.transition(&mut execution, ExecutionStatus::Failed)?;
        self.store.upsert_execution(&execution).await?;
        self.stats.record_failure();

        if let Err(e) = self.patterns.record_failure(&execution.id).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to debit learned pattern");
        }

        let mut target = self.load_target(&execution.target_id).await?;
        let class = classify_failure(&message);
        let decision = self.retry.decide(
            &message,
            execution.attempt,
            execution.max_attempts,
            target.healing.retry_strategy,
            target.healing.retry_base_delay_ms,
        );
        self.breaker.on_failure(
            &mut target,
            FailureOutcome {
                attempt: execution.attempt,
                max_attempts: execution.max_attempts,
                non_retryable: class == FailureClass::NonRetryable,
            },
        );
        self.store.upsert_target(&target).await?;

        match decision {
            RetryDecision::Retry { delay_ms, .. } if target.breaker.state == CircuitState::Closed => {
                self.schedule_retry(&execution, delay_ms).await?;
            }
            RetryDecision::Retry { .. } => {
                info!(
                    execution_id = %execution.id,
                    breaker = ?target.breaker.state,
                    "Retry suppressed by circuit breaker"
                );
            }
            RetryDecision::GiveUp { reason, .. } => {
                info!(execution_id = %execution.id, reason = %reason, "Not retrying");
            }
        }
        Ok(ExecutionStatus::Failed)
    }

    async fn schedule_retry(&self, previous: &Execution, delay_ms: u64) -> Result<()> {
        let mut retry = Execution::retry_of(previous, self.clock.now());
        self.store.upsert_execution(&retry).await?;

        let job = HealingJob {
            execution_id: retry.id.clone(),
            target_id: retry.target_id.clone(),
            manual_override: retry.is_manual_override(),
        };
        match self.queue.enqueue(job, Duration::from_millis(delay_ms)).await {
            Ok(handle) => {
                retry.job_id = Some(handle.id.clone());
                self.store.upsert_execution(&retry).await?;
                self.stats.record_retry();
                info!(
                    execution_id = %retry.id,
                    previous = %previous.id,
                    attempt = retry.attempt,
                    delay_ms,
                    "Retry scheduled"
                );
            }
            Err(e) => {
                retry.error = Some(format!("failed to enqueue retry: {}", e));
                self.transition(&mut retry, ExecutionStatus::Failed)?;
                self.store.upsert_execution(&retry).await?;
                warn!(execution_id = %retry.id, error = %e, "Retry could not be queued");
            }
        }
        Ok(())
    }

    /// Close out an execution a job left APPROVED or HEALING after a
    /// bookkeeping error, so it no longer blocks the target.
    async fn fail_abandoned(&self, job: &HealingJob, err: &HealerError) -> Result<()> {
        let Some(mut execution) = self.store.get_execution(&job.execution_id).await? else {
            return Ok(());
        };
        if !matches!(
            execution.status,
            ExecutionStatus::Approved | ExecutionStatus::Healing
        ) {
            return Ok(());
        }

        let message = redact_secrets(&format!("healing job aborted: {}", err));
        execution.error = Some(message.clone());
        execution.push_log(self.clock.now(), LogLevel::Error, message);
        self.transition(&mut execution, ExecutionStatus::Failed)?;
        self.store.upsert_execution(&execution).await?;
        self.stats.record_failure();

        let mut target = self.load_target(&execution.target_id).await?;
        self.breaker.on_failure(
            &mut target,
            FailureOutcome {
                attempt: execution.attempt,
                max_attempts: execution.max_attempts,
                non_retryable: false,
            },
        );
        self.store.upsert_target(&target).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobRunner for HealingJobExecutor {
    async fn run(&self, job: HealingJob) {
        if let Err(e) = self.execute(&job).await {
            error!(
                execution_id = %job.execution_id,
                target_id = %job.target_id,
                error = %e,
                "Healing job aborted"
            );
            if let Err(cleanup) = self.fail_abandoned(&job, &e).await {
                error!(
                    execution_id = %job.execution_id,
                    error = %cleanup,
                    "Could not mark aborted execution failed"
                );
            }
        }
    }
}
