//! Wiring: builds every service from a `Config` and a set of collaborators,
//! and exposes the operations callers use.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backup::{BackupService, RemoteBackupService};
use crate::checks::{register_builtin_checks, CheckRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::diagnosis::{
    CacheStats, DiagnosisAggregator, DiagnosisCache, ProfileTable, RemedyTemplates, SignalCollector,
};
use crate::errors::{DiagnosisError, HealerError, Result};
use crate::healing::{
    AutoHealOutcome, DiagnoseOptions, HealResponse, HealingJobExecutor, HealingOrchestrator,
    Remediator,
};
use crate::learning::PatternStore;
use crate::model::{DiagnosisRecord, Execution, ExecutionStatus, Target, TriggerSource};
use crate::queue::{run_worker, JobReceiver, JobRunner, LocalJobQueue};
use crate::remote::{HttpProber, ReqwestProber, RemoteExecutor, SshExecutor, WpCli};
use crate::store::{JsonFileStore, Store};
use crate::supervision::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use crate::verification::Verifier;

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    diagnoses: AtomicU64,
    cache_hits: AtomicU64,
    heals_queued: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries_scheduled: AtomicU64,
    rollbacks: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub diagnoses: u64,
    pub cache_hits: u64,
    pub heals_queued: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries_scheduled: u64,
    pub rollbacks: u64,
}

impl EngineStats {
    pub fn record_diagnosis(&self) {
        self.diagnoses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heal_queued(&self) {
        self.heals_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            diagnoses: self.diagnoses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            heals_queued: self.heals_queued.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// External systems the engine talks to.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub prober: Arc<dyn HttpProber>,
    /// Defaults to `RemoteBackupService` over `executor`
    pub backups: Option<Arc<dyn BackupService>>,
    pub clock: Arc<dyn Clock>,
}

pub struct Engine {
    config: Config,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    profiles: Arc<ProfileTable>,
    aggregator: Arc<DiagnosisAggregator>,
    patterns: Arc<PatternStore>,
    orchestrator: Arc<HealingOrchestrator>,
    job_executor: Arc<HealingJobExecutor>,
    receiver: parking_lot::Mutex<Option<JobReceiver>>,
    stats: Arc<EngineStats>,
}

impl Engine {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            store,
            executor,
            prober,
            backups,
            clock,
        } = collaborators;

        let settings = config.healing.clone();
        let wp = WpCli::new(settings.wp_cli.clone());
        let command_timeout = Duration::from_secs(settings.command_timeout_secs);
        let backups: Arc<dyn BackupService> = backups.unwrap_or_else(|| {
            Arc::new(RemoteBackupService::new(
                executor.clone(),
                wp.clone(),
                settings.backup_dir.clone(),
                command_timeout,
            ))
        });

        let mut registry = CheckRegistry::new();
        register_builtin_checks(
            &mut registry,
            executor.clone(),
            prober.clone(),
            wp.clone(),
            &settings.backup_dir,
            clock.clone(),
        );
        let templates = RemedyTemplates {
            wp: wp.clone(),
            memory_limit: settings.memory_limit.clone(),
            fallback_themes: settings.fallback_themes.clone(),
        };

        let cache = Arc::new(DiagnosisCache::new(store.clone(), clock.clone()));
        let aggregator = Arc::new(DiagnosisAggregator::new(
            Arc::new(registry),
            SignalCollector::new(executor.clone(), prober.clone(), wp.clone()),
            config.diagnosis.weights.clone(),
            templates.clone(),
            store.clone(),
            cache.clone(),
            clock.clone(),
            chrono::Duration::seconds(config.diagnosis.log_window_secs as i64),
        ));
        let profiles = Arc::new(ProfileTable::from_config(&config));
        let patterns = Arc::new(PatternStore::new(store.clone(), clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::from_secs(config.retry.circuit_reset_secs),
            clock.clone(),
        ));
        let stats = Arc::new(EngineStats::default());

        let (queue, receiver) = LocalJobQueue::new(clock.clone());
        let queue = Arc::new(queue);

        let orchestrator = Arc::new(HealingOrchestrator::new(
            store.clone(),
            aggregator.clone(),
            profiles.clone(),
            patterns.clone(),
            breaker.clone(),
            queue.clone(),
            backups.clone(),
            clock.clone(),
            settings.clone(),
            stats.clone(),
        ));
        let remediator = Arc::new(Remediator::new(
            executor.clone(),
            templates,
            command_timeout,
            clock.clone(),
        ));
        let verifier = Arc::new(Verifier::new(
            executor,
            prober,
            wp,
            config.verification.clone(),
            clock.clone(),
        ));
        let job_executor = Arc::new(HealingJobExecutor::new(
            store.clone(),
            backups,
            remediator,
            verifier,
            patterns.clone(),
            breaker,
            RetryPolicy::new(config.retry.max_delay_ms),
            queue,
            cache,
            clock.clone(),
            settings,
            stats.clone(),
        ));

        Ok(Self {
            config,
            store,
            clock,
            profiles,
            aggregator,
            patterns,
            orchestrator,
            job_executor,
            receiver: parking_lot::Mutex::new(Some(receiver)),
            stats,
        })
    }

    /// Production wiring: JSON file store, ssh, reqwest and the system clock.
    /// Seeds the store with the configured targets.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(JsonFileStore::open(config.store.path.clone()).await?);
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::from_config(&config));
        let prober: Arc<dyn HttpProber> = Arc::new(ReqwestProber::new()?);
        let engine = Self::new(
            config,
            Collaborators {
                store,
                executor,
                prober,
                backups: None,
                clock: Arc::new(SystemClock),
            },
        )?;
        engine.sync_targets().await?;
        Ok(engine)
    }

    /// Upsert configured targets. Existing targets keep their runtime state
    /// (health, breaker, counters) and take the configured settings.
    pub async fn sync_targets(&self) -> Result<usize> {
        for target_config in &self.config.targets {
            let configured = target_config.to_target();
            let target = match self.store.get_target(&target_config.id).await? {
                Some(mut existing) => {
                    existing.domain = configured.domain;
                    existing.path = configured.path;
                    existing.subdomains = configured.subdomains;
                    existing.healing = configured.healing;
                    existing
                }
                None => configured,
            };
            self.store.upsert_target(&target).await?;
        }
        debug!(count = self.config.targets.len(), "Targets synced from configuration");
        Ok(self.config.targets.len())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<HealingOrchestrator> {
        &self.orchestrator
    }

    pub fn patterns(&self) -> &Arc<PatternStore> {
        &self.patterns
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        Ok(self.aggregator.cache().stats().await?)
    }

    pub async fn add_target(&self, target: Target) -> Result<()> {
        self.store.upsert_target(&target).await?;
        Ok(())
    }

    pub async fn target(&self, target_id: &str) -> Result<Target> {
        self.store
            .get_target(target_id)
            .await?
            .ok_or_else(|| DiagnosisError::TargetNotFound(target_id.to_string()).into())
    }

    pub async fn diagnose(
        &self,
        target_id: &str,
        triggered_by: TriggerSource,
        options: &DiagnoseOptions,
    ) -> Result<Execution> {
        self.orchestrator
            .diagnose(target_id, triggered_by, options)
            .await
    }

    /// Health check that may be served from cache. Creates no execution and
    /// is not rate-limited.
    pub async fn check(&self, target_id: &str, options: &DiagnoseOptions) -> Result<DiagnosisRecord> {
        let target = self.target(target_id).await?;
        let profile = self.profiles.resolve_profile(
            options.profile.unwrap_or(self.config.diagnosis.default_profile),
            options.checks.as_deref(),
        )?;
        let (domain, path) = target.resolve_site(options.subdomain.as_deref());
        let record = self
            .aggregator
            .diagnose_cached(&target, &path, &domain, &profile)
            .await?;
        if record.from_cache {
            self.stats.record_cache_hit();
        } else {
            self.stats.record_diagnosis();
        }
        Ok(record)
    }

    pub async fn heal(
        &self,
        execution_id: &str,
        custom_commands: Option<Vec<String>>,
    ) -> Result<HealResponse> {
        self.orchestrator.heal(execution_id, custom_commands).await
    }

    pub async fn rollback(&self, execution_id: &str) -> Result<Execution> {
        self.orchestrator.rollback(execution_id).await
    }

    pub async fn reset_circuit_breaker(&self, target_id: &str) -> Result<Target> {
        self.orchestrator.reset_circuit_breaker(target_id).await
    }

    pub async fn auto_heal(&self, target_id: &str) -> Result<AutoHealOutcome> {
        self.orchestrator.auto_heal(target_id).await
    }

    /// Run queued jobs inline, ignoring their delays, until the queue is
    /// empty. Retries scheduled along the way run too. Returns the number of
    /// jobs run.
    pub async fn run_pending(&self) -> Result<usize> {
        let mut receiver = self.take_receiver()?;
        let mut ran = 0;
        while let Some(queued) = receiver.try_recv() {
            self.job_executor.run(queued.job).await;
            ran += 1;
        }
        *self.receiver.lock() = Some(receiver);
        Ok(ran)
    }

    /// Drain the queue with the bounded worker until `shutdown` resolves.
    pub async fn run_worker<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let receiver = self.take_receiver()?;
        info!(concurrency = self.config.worker.concurrency, "Starting healing worker");
        run_worker(
            receiver,
            self.job_executor.clone(),
            self.config.worker.concurrency,
            shutdown,
        )
        .await;
        Ok(())
    }

    fn take_receiver(&self) -> Result<JobReceiver> {
        self.receiver
            .lock()
            .take()
            .ok_or_else(|| HealerError::Internal("job worker already running".to_string()))
    }

    /// Latest execution of a target still waiting for or running a job.
    pub async fn active_execution(&self, target_id: &str) -> Result<Option<Execution>> {
        Ok(self
            .store
            .executions_for_target(target_id, None)
            .await?
            .into_iter()
            .rev()
            .find(|e| e.status.is_active() && e.status != ExecutionStatus::Diagnosed))
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{CheckType, DiagnosisProfile};
    use crate::store::MemoryStore;
    use crate::testing::{MockBackupService, MockExecutor, MockProber};

    fn engine() -> Engine {
        let clock = Arc::new(ManualClock::default());
        Engine::new(
            Config::default(),
            Collaborators {
                store: Arc::new(MemoryStore::new()),
                executor: Arc::new(MockExecutor::new()),
                prober: Arc::new(MockProber::new().respond("example.com", 200, &"<html>ok</html>".repeat(60))),
                backups: Some(Arc::new(MockBackupService::new())),
                clock,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = EngineStats::default();
        stats.record_diagnosis();
        stats.record_diagnosis();
        stats.record_rollback();
        let snap = stats.snapshot();
        assert_eq!(snap.diagnoses, 2);
        assert_eq!(snap.rollbacks, 1);
        assert_eq!(snap.successes, 0);
    }

    #[tokio::test]
    async fn test_check_is_served_from_cache() {
        let engine = engine();
        engine
            .add_target(Target::new("site", "example.com", "/var/www/site"))
            .await
            .unwrap();
        let options = DiagnoseOptions {
            profile: Some(DiagnosisProfile::Quick),
            ..Default::default()
        };

        let first = engine.check("site", &options).await.unwrap();
        assert!(!first.from_cache);
        let second = engine.check("site", &options).await.unwrap();
        assert!(second.from_cache);

        let stats = engine.stats();
        assert_eq!(stats.diagnoses, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_check_unknown_target() {
        let engine = engine();
        let err = engine
            .check(
                "missing",
                &DiagnoseOptions {
                    profile: Some(DiagnosisProfile::Custom),
                    checks: Some(vec![CheckType::HttpAvailability]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HealerError::Diagnosis(DiagnosisError::TargetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_receiver_taken_once() {
        let engine = engine();
        assert_eq!(engine.run_pending().await.unwrap(), 0);
        let _held = engine.take_receiver().unwrap();
        assert!(engine.run_pending().await.is_err());
    }
}
