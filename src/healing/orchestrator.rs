//! Healing orchestrator: the synchronous request path of the state machine.
//!
//! `diagnose` creates an execution in DIAGNOSED, `heal` approves it and hands
//! it to the job queue, `rollback` restores its backup. Everything that runs
//! remote commands for a heal happens later in the job executor.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::remediation::{check_blacklists, RemediationPlan};
use super::safety::validate_batch;
use crate::backup::BackupService;
use crate::clock::Clock;
use crate::config::HealingSettings;
use crate::diagnosis::{DiagnosisAggregator, ProfileTable};
use crate::engine::EngineStats;
use crate::errors::{DiagnosisError, HealingError, Result};
use crate::learning::PatternStore;
use crate::model::{
    CheckType, DiagnosisProfile, DiagnosisRecord, Execution, ExecutionStatus, HealingMode,
    HealthStatus, LogLevel, Target, TriggerSource,
};
use crate::observability::telemetry::{record_state_transition, redact_secrets};
use crate::queue::{HealingJob, JobHandle, JobQueue};
use crate::store::Store;
use crate::supervision::{Admission, CircuitBreaker};

/// Returned by a successful `heal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealResponse {
    pub execution_id: String,
    pub job: JobHandle,
    pub status: ExecutionStatus,
}

/// Diagnosis request options.
#[derive(Debug, Clone, Default)]
pub struct DiagnoseOptions {
    pub subdomain: Option<String>,
    /// Defaults to the configured healing diagnosis profile
    pub profile: Option<DiagnosisProfile>,
    pub checks: Option<Vec<CheckType>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoHealOutcome {
    Disabled,
    Healthy { execution_id: String },
    AwaitingApproval { execution_id: String, reason: String },
    Queued(HealResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

/// Health score summary over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTrend {
    pub target_id: String,
    pub since: DateTime<Utc>,
    pub samples: usize,
    pub min: Option<u8>,
    pub max: Option<u8>,
    pub average: Option<f64>,
    pub direction: TrendDirection,
}

/// Points the second half of a window must differ by to count as a trend.
pub const TREND_THRESHOLD: f64 = 5.0;

/// Trend over scores ordered oldest first.
pub fn compute_trend(target_id: &str, since: DateTime<Utc>, scores: &[u8]) -> HealthTrend {
    let avg = |s: &[u8]| -> Option<f64> {
        if s.is_empty() {
            None
        } else {
            Some(s.iter().map(|&v| f64::from(v)).sum::<f64>() / s.len() as f64)
        }
    };

    let direction = if scores.len() < 2 {
        TrendDirection::Stable
    } else {
        let (first, second) = scores.split_at(scores.len() / 2);
        match (avg(first), avg(second)) {
            (Some(a), Some(b)) if b - a > TREND_THRESHOLD => TrendDirection::Improving,
            (Some(a), Some(b)) if a - b > TREND_THRESHOLD => TrendDirection::Declining,
            _ => TrendDirection::Stable,
        }
    };

    HealthTrend {
        target_id: target_id.to_string(),
        since,
        samples: scores.len(),
        min: scores.iter().copied().min(),
        max: scores.iter().copied().max(),
        average: avg(scores),
        direction,
    }
}

pub struct HealingOrchestrator {
    store: Arc<dyn Store>,
    aggregator: Arc<DiagnosisAggregator>,
    profiles: Arc<ProfileTable>,
    patterns: Arc<PatternStore>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<dyn JobQueue>,
    backups: Arc<dyn BackupService>,
    clock: Arc<dyn Clock>,
    settings: HealingSettings,
    stats: Arc<EngineStats>,
}

impl HealingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        aggregator: Arc<DiagnosisAggregator>,
        profiles: Arc<ProfileTable>,
        patterns: Arc<PatternStore>,
        breaker: Arc<CircuitBreaker>,
        queue: Arc<dyn JobQueue>,
        backups: Arc<dyn BackupService>,
        clock: Arc<dyn Clock>,
        settings: HealingSettings,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            store,
            aggregator,
            profiles,
            patterns,
            breaker,
            queue,
            backups,
            clock,
            settings,
            stats,
        }
    }

    async fn load_target(&self, target_id: &str) -> Result<Target> {
        self.store
            .get_target(target_id)
            .await?
            .ok_or_else(|| DiagnosisError::TargetNotFound(target_id.to_string()).into())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| HealingError::ExecutionNotFound(execution_id.to_string()).into())
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        self.store.upsert_execution(execution).await?;
        Ok(())
    }

    fn transition(&self, execution: &mut Execution, next: ExecutionStatus) -> Result<()> {
        let from = execution.status;
        execution.transition(next, self.clock.now())?;
        record_state_transition(&execution.id, from.as_str(), next.as_str());
        Ok(())
    }

    /// Fresh diagnosis of a target, persisted as a DIAGNOSED execution.
    pub async fn diagnose(
        &self,
        target_id: &str,
        triggered_by: TriggerSource,
        options: &DiagnoseOptions,
    ) -> Result<Execution> {
        let mut target = self.load_target(target_id).await?;
        let now = self.clock.now();

        if let Some(last) = target.last_diagnosed_at {
            let cooldown = ChronoDuration::seconds(target.healing.cooldown_secs as i64);
            let elapsed = now - last;
            if elapsed < cooldown {
                let retry_after_secs = (cooldown - elapsed).num_seconds().max(1);
                warn!(target_id, retry_after_secs, "Diagnosis rate limited");
                return Err(DiagnosisError::RateLimited {
                    target_id: target_id.to_string(),
                    retry_after_secs,
                }
                .into());
            }
        }

        let profile = self.profiles.resolve_profile(
            options.profile.unwrap_or(self.settings.diagnosis_profile),
            options.checks.as_deref(),
        )?;
        let (domain, path) = target.resolve_site(options.subdomain.as_deref());

        let record = self
            .aggregator
            .diagnose(&target, &path, &domain, &profile)
            .await?;
        self.stats.record_diagnosis();

        let suggestion = match self.patterns.best_suggestion(&record.diagnosis, &path).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target_id, error = %e, "Pattern lookup failed");
                None
            }
        };

        // A job may have moved the breaker while the checks ran.
        if !self
            .store
            .record_target_health(&target.id, record.health_score, now)
            .await?
        {
            return Err(DiagnosisError::TargetNotFound(target_id.to_string()).into());
        }
        target.last_diagnosed_at = Some(now);
        target.health_score = Some(record.health_score);
        target.health_status = HealthStatus::from_score(record.health_score);

        let execution = Execution::diagnosed(&target, record, suggestion, triggered_by, now);
        self.save(&execution).await?;
        info!(
            target_id,
            execution_id = %execution.id,
            diagnosis = %execution.diagnosis.diagnosis.diagnosis_type,
            learned = execution.learned_suggestion.is_some(),
            "Execution diagnosed"
        );
        Ok(execution)
    }

    /// Approve a diagnosed execution and queue its healing job.
    pub async fn heal(
        &self,
        execution_id: &str,
        custom_commands: Option<Vec<String>>,
    ) -> Result<HealResponse> {
        let mut execution = self.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Diagnosed {
            return Err(HealingError::InvalidStateTransition {
                from: execution.status.to_string(),
                to: ExecutionStatus::Approved.to_string(),
            }
            .into());
        }
        let mut target = self.load_target(&execution.target_id).await?;

        if let Some(active) = self
            .store
            .executions_for_target(&target.id, None)
            .await?
            .into_iter()
            .rev()
            .find(|e| e.id != execution.id && e.status.is_active())
        {
            return Err(HealingError::HealingInProgress {
                target_id: target.id.clone(),
                execution_id: active.id,
            }
            .into());
        }

        let custom_commands = custom_commands.filter(|c| !c.is_empty());
        let manual = custom_commands.is_some();
        if let Some(commands) = &custom_commands {
            validate_batch(commands)?;
        }
        execution.custom_commands = custom_commands;

        let plan = RemediationPlan::for_execution(&execution)?;
        check_blacklists(&plan, &target)?;
        if let RemediationPlan::Learned { commands, .. } = &plan {
            validate_batch(commands)?;
        }

        let admission = if manual {
            None
        } else {
            let admission = self.breaker.admit(&mut target)?;
            if admission == Admission::Trial {
                self.store.upsert_target(&target).await?;
            }
            Some(admission)
        };

        match self.approve_and_enqueue(&mut execution, &target, &plan, manual).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if admission == Some(Admission::Trial) {
                    self.release_trial(&target.id).await;
                }
                Err(e)
            }
        }
    }

    async fn approve_and_enqueue(
        &self,
        execution: &mut Execution,
        target: &Target,
        plan: &RemediationPlan,
        manual: bool,
    ) -> Result<HealResponse> {
        self.transition(execution, ExecutionStatus::Approved)?;
        if manual {
            execution.push_log(
                self.clock.now(),
                LogLevel::Warn,
                "Manual override: caller-supplied commands replace the default remediation",
            );
        }
        self.save(execution).await?;

        let job = HealingJob {
            execution_id: execution.id.clone(),
            target_id: target.id.clone(),
            manual_override: manual,
        };
        match self.queue.enqueue(job, Duration::ZERO).await {
            Ok(handle) => {
                execution.job_id = Some(handle.id.clone());
                self.save(execution).await?;
                self.stats.record_heal_queued();
                info!(
                    execution_id = %execution.id,
                    target_id = %target.id,
                    job_id = %handle.id,
                    plan = %plan.describe(),
                    "Healing job queued"
                );
                Ok(HealResponse {
                    execution_id: execution.id.clone(),
                    job: handle,
                    status: ExecutionStatus::Approved,
                })
            }
            Err(e) => {
                execution.error = Some(format!("failed to enqueue healing job: {}", e));
                self.transition(execution, ExecutionStatus::Failed)?;
                self.save(execution).await?;
                Err(e.into())
            }
        }
    }

    /// Give back a HALF_OPEN trial slot whose heal never got queued.
    async fn release_trial(&self, target_id: &str) {
        let released = match self.store.get_target(target_id).await {
            Ok(Some(mut target)) => {
                target.breaker.trial_in_flight = false;
                self.store.upsert_target(&target).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        match released {
            Ok(()) => info!(target_id, "Half-open trial slot released"),
            Err(e) => warn!(target_id, error = %e, "Failed to release half-open trial slot"),
        }
    }

    /// Restore the execution's backup and mark it ROLLED_BACK.
    pub async fn rollback(&self, execution_id: &str) -> Result<Execution> {
        let mut execution = self.get_execution(execution_id).await?;
        if !execution.status.can_transition_to(ExecutionStatus::RolledBack) {
            return Err(HealingError::InvalidStateTransition {
                from: execution.status.to_string(),
                to: ExecutionStatus::RolledBack.to_string(),
            }
            .into());
        }
        let backup = execution
            .backup
            .clone()
            .ok_or_else(|| HealingError::NoBackup(execution.id.clone()))?;

        if let Err(e) = self.backups.restore(&backup).await {
            let reason = redact_secrets(&e.to_string());
            execution.push_log(
                self.clock.now(),
                LogLevel::Error,
                format!("rollback failed: {}", reason),
            );
            self.save(&execution).await?;
            return Err(e.into());
        }

        execution.push_log(
            self.clock.now(),
            LogLevel::Info,
            format!("restored backup {}", backup.id),
        );
        self.transition(&mut execution, ExecutionStatus::RolledBack)?;
        self.save(&execution).await?;
        self.aggregator
            .cache()
            .invalidate(&execution.target_id, None)
            .await?;
        self.stats.record_rollback();
        info!(execution_id, backup_id = %backup.id, "Execution rolled back");
        Ok(execution)
    }

    pub async fn reset_circuit_breaker(&self, target_id: &str) -> Result<Target> {
        let mut target = self.load_target(target_id).await?;
        self.breaker.reset(&mut target);
        self.store.upsert_target(&target).await?;
        info!(target_id, "Circuit breaker manually reset");
        Ok(target)
    }

    /// Scheduled diagnosis that heals on its own when the target's mode
    /// allows it.
    pub async fn auto_heal(&self, target_id: &str) -> Result<AutoHealOutcome> {
        let target = self.load_target(target_id).await?;
        if target.healing.mode == HealingMode::Disabled {
            return Ok(AutoHealOutcome::Disabled);
        }

        let execution = self
            .diagnose(target_id, TriggerSource::Scheduled, &DiagnoseOptions::default())
            .await?;
        let diagnosis = &execution.diagnosis.diagnosis;
        if !diagnosis.diagnosis_type.is_actionable() {
            return Ok(AutoHealOutcome::Healthy {
                execution_id: execution.id,
            });
        }

        let learned_ok = execution
            .learned_suggestion
            .as_ref()
            .map(|s| s.auto_approve)
            .unwrap_or(false);
        let confident = diagnosis.confidence >= self.settings.auto_heal_confidence;
        let go = match target.healing.mode {
            HealingMode::Auto => confident || learned_ok,
            HealingMode::Supervised => learned_ok,
            HealingMode::Disabled => false,
        };
        if !go {
            let reason = format!(
                "{} at confidence {:.2} needs approval in {:?} mode",
                diagnosis.diagnosis_type, diagnosis.confidence, target.healing.mode
            );
            return Ok(AutoHealOutcome::AwaitingApproval {
                execution_id: execution.id,
                reason,
            });
        }
        Ok(AutoHealOutcome::Queued(self.heal(&execution.id, None).await?))
    }

    /// Drop every cached diagnosis of a target.
    pub async fn invalidate_cache(&self, target_id: &str) -> Result<usize> {
        Ok(self.aggregator.cache().invalidate(target_id, None).await?)
    }

    pub async fn execution_history(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Execution>> {
        Ok(self.store.executions_for_target(target_id, since).await?)
    }

    pub async fn diagnosis_history(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiagnosisRecord>> {
        Ok(self.store.diagnoses_for_target(target_id, since).await?)
    }

    pub async fn health_trend(&self, target_id: &str, window: ChronoDuration) -> Result<HealthTrend> {
        let since = self.clock.now() - window;
        let scores: Vec<u8> = self
            .store
            .diagnoses_for_target(target_id, Some(since))
            .await?
            .iter()
            .filter(|r| !r.from_cache)
            .map(|r| r.health_score)
            .collect();
        Ok(compute_trend(target_id, since, &scores))
    }
}
