//! Folds check results and structural signals into one diagnosis record.
//!
//! The health score comes from the weighted check results and the causal
//! verdict from the signals. Fresh records go to history and, when the
//! profile caches, to the diagnosis cache.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::cache::DiagnosisCache;
use super::causal::{diagnose_cause, RemedyTemplates};
use super::profile::ResolvedProfile;
use super::signals::{SignalCollector, SignalTarget};
use crate::checks::{CheckContext, CheckRegistry};
use crate::clock::Clock;
use crate::config::CheckWeights;
use crate::errors::Result;
use crate::model::{CheckResult, CheckStatus, DiagnosisRecord, Target};
use crate::store::Store;

/// Weighted mean of check scores by priority weight, rounded and clamped to
/// 0-100. Skipped checks do not count; with nothing to weigh the score is 0.
pub fn weighted_score(results: &[CheckResult], weights: &CheckWeights) -> u8 {
    let (mut sum, mut total) = (0.0_f64, 0.0_f64);
    for result in results.iter().filter(|r| r.status != CheckStatus::Skipped) {
        let weight = weights.weight(result.priority);
        sum += f64::from(result.score.min(100)) * weight;
        total += weight;
    }
    if total <= 0.0 {
        return 0;
    }
    (sum / total).round().clamp(0.0, 100.0) as u8
}

/// Runs checks and structural probes for one site and folds them into a
/// `DiagnosisRecord`.
pub struct DiagnosisAggregator {
    registry: Arc<CheckRegistry>,
    signals: SignalCollector,
    weights: CheckWeights,
    templates: RemedyTemplates,
    store: Arc<dyn Store>,
    cache: Arc<DiagnosisCache>,
    clock: Arc<dyn Clock>,
    log_window: ChronoDuration,
}

impl DiagnosisAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<CheckRegistry>,
        signals: SignalCollector,
        weights: CheckWeights,
        templates: RemedyTemplates,
        store: Arc<dyn Store>,
        cache: Arc<DiagnosisCache>,
        clock: Arc<dyn Clock>,
        log_window: ChronoDuration,
    ) -> Self {
        Self {
            registry,
            signals,
            weights,
            templates,
            store,
            cache,
            clock,
            log_window,
        }
    }

    /// Cutoff for log errors: the window start, or the last successful heal
    /// when that is later.
    pub fn log_since(&self, target: &Target) -> DateTime<Utc> {
        let window_start = self.clock.now() - self.log_window;
        target
            .last_healed_at
            .map_or(window_start, |healed| healed.max(window_start))
    }

    pub fn cache(&self) -> &Arc<DiagnosisCache> {
        &self.cache
    }

    /// Serve from cache when the profile allows it, else run fresh.
    pub async fn diagnose_cached(
        &self,
        target: &Target,
        path: &str,
        domain: &str,
        profile: &ResolvedProfile,
    ) -> Result<DiagnosisRecord> {
        if profile.use_cache {
            if let Some(record) = self.cache.get(&target.id, path, profile.profile).await? {
                debug!(target_id = %target.id, profile = %profile.profile, "Diagnosis served from cache");
                return Ok(record);
            }
        }
        self.diagnose(target, path, domain, profile).await
    }

    /// Run a fresh diagnosis, persist it to history and, when the profile
    /// caches, upsert its cache entry.
    pub async fn diagnose(
        &self,
        target: &Target,
        path: &str,
        domain: &str,
        profile: &ResolvedProfile,
    ) -> Result<DiagnosisRecord> {
        let start = Instant::now();
        let ctx = CheckContext {
            target_id: target.id.clone(),
            remote_handle: target.remote_handle.clone(),
            path: path.to_string(),
            domain: domain.to_string(),
            log_depth: profile.log_depth,
            timeout: profile.timeout,
        };
        let signal_target = SignalTarget {
            remote_handle: &target.remote_handle,
            path,
            domain,
            log_depth: profile.log_depth,
            log_since: Some(self.log_since(target)),
            timeout: profile.timeout,
        };

        let (results, signals) = tokio::join!(
            self.registry.run(&ctx, &profile.checks, profile.parallel),
            self.signals.collect(&signal_target),
        );

        let health_score = weighted_score(&results, &self.weights);
        let critical_count = results
            .iter()
            .filter(|r| matches!(r.status, CheckStatus::Fail | CheckStatus::Error))
            .count() as u32;
        let warning_count = results
            .iter()
            .filter(|r| r.status == CheckStatus::Warning)
            .count() as u32;

        let diagnosis = diagnose_cause(&signals, path, &self.templates);

        let mut recommendations: Vec<String> = Vec::new();
        for rec in results.iter().flat_map(|r| r.recommendations.iter()) {
            if !recommendations.contains(rec) {
                recommendations.push(rec.clone());
            }
        }
        if diagnosis.diagnosis_type.is_actionable()
            && !recommendations.contains(&diagnosis.suggested_action)
        {
            recommendations.insert(0, diagnosis.suggested_action.clone());
        }

        let record = DiagnosisRecord {
            id: format!("diag_{}", uuid::Uuid::new_v4().simple()),
            target_id: target.id.clone(),
            path: path.to_string(),
            domain: domain.to_string(),
            profile: profile.profile,
            checks_run: results.iter().map(|r| r.check_type).collect(),
            health_score,
            issues_count: critical_count + warning_count,
            critical_count,
            warning_count,
            diagnosis,
            results,
            recommendations,
            duration_ms: start.elapsed().as_millis() as u64,
            from_cache: false,
            created_at: self.clock.now(),
        };

        self.store.append_diagnosis(&record).await?;
        if profile.use_cache {
            self.cache.put(&record, profile.cache_ttl).await?;
        }

        info!(
            target_id = %target.id,
            profile = %profile.profile,
            score = health_score,
            diagnosis = %record.diagnosis.diagnosis_type,
            confidence = record.diagnosis.confidence,
            "Diagnosis complete"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckPriority, CheckType};

    fn result(priority: CheckPriority, status: CheckStatus, score: u8) -> CheckResult {
        CheckResult::new(CheckType::ErrorLog, priority, status, score, "")
    }

    #[test]
    fn test_weighted_score() {
        let weights = CheckWeights::default();
        let results = vec![
            result(CheckPriority::Critical, CheckStatus::Pass, 100),
            result(CheckPriority::Low, CheckStatus::Fail, 0),
        ];
        // 300 / 3.5 = 85.7
        assert_eq!(weighted_score(&results, &weights), 86);
    }

    #[test]
    fn test_skipped_checks_are_excluded() {
        let weights = CheckWeights::default();
        let results = vec![
            result(CheckPriority::High, CheckStatus::Pass, 80),
            result(CheckPriority::Critical, CheckStatus::Skipped, 0),
        ];
        assert_eq!(weighted_score(&results, &weights), 80);
    }

    #[test]
    fn test_empty_batch_scores_zero() {
        let weights = CheckWeights::default();
        assert_eq!(weighted_score(&[], &weights), 0);
        let skipped = vec![result(CheckPriority::Medium, CheckStatus::Skipped, 0)];
        assert_eq!(weighted_score(&skipped, &weights), 0);
    }
}
