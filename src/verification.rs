//! Post-remediation verification.
//!
//! After a healing job runs its commands the site is probed again, this time
//! without trusting the diagnosis that triggered the job. Five dimensions are
//! scored independently and summed:
//!
//! | Dimension   | Points | Probe                                      |
//! |-------------|--------|--------------------------------------------|
//! | http        | 20     | status after body-based downgrading        |
//! | content     | 25     | failure markers and HTML sanity            |
//! | log         | 20     | fatal errors logged inside the window      |
//! | functional  | 20     | wp-cli core, database and plugin probes    |
//! | performance | 15     | response time and payload size             |
//!
//! A probe that fails scores its dimension 0, except the log probe, which
//! keeps partial credit because a missing log is not a failure signal.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::VerificationSettings;
use crate::diagnosis::signals::{log_tail_command, parse_log_line, LogSeverity};
use crate::model::{DiagnosisType, Target};
use crate::observability::telemetry::redact_secrets;
use crate::remote::{
    assess_response, site_url, HttpAssessment, HttpProber, HttpResponse, RemoteExecutor, WpCli,
    BLANK_PAGE_BYTES, SUSPICIOUS_BODY_BYTES,
};

pub const HTTP_POINTS: u8 = 20;
pub const CONTENT_POINTS: u8 = 25;
pub const LOG_POINTS: u8 = 20;
pub const FUNCTIONAL_POINTS: u8 = 20;
pub const PERFORMANCE_POINTS: u8 = 15;

/// Credit given to the log dimension when the log cannot be read.
pub const LOG_PROBE_FAILURE_POINTS: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Http,
    Content,
    Log,
    Functional,
    Performance,
}

/// Score of one dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionResult {
    pub dimension: Dimension,
    pub score: u8,
    pub max_score: u8,
    pub message: String,
}

impl DimensionResult {
    fn new(dimension: Dimension, score: u8, max_score: u8, message: impl Into<String>) -> Self {
        Self {
            dimension,
            score: score.min(max_score),
            max_score,
            message: message.into(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.score == self.max_score
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationMetrics {
    pub http_status: Option<u16>,
    pub effective_status: Option<u16>,
    pub response_ms: Option<u64>,
    pub body_bytes: Option<usize>,
    pub recent_fatal_errors: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub score: u8,
    pub passed: bool,
    pub threshold: u8,
    pub diagnosis_type: DiagnosisType,
    pub checks: Vec<DimensionResult>,
    pub metrics: VerificationMetrics,
}

impl VerificationReport {
    pub fn dimension(&self, dimension: Dimension) -> Option<&DimensionResult> {
        self.checks.iter().find(|c| c.dimension == dimension)
    }

    /// Short human-readable list of the dimensions that lost points.
    pub fn shortfalls(&self) -> String {
        self.checks
            .iter()
            .filter(|c| !c.is_full())
            .map(|c| format!("{:?} {}/{}: {}", c.dimension, c.score, c.max_score, c.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct Verifier {
    executor: Arc<dyn RemoteExecutor>,
    prober: Arc<dyn HttpProber>,
    wp: WpCli,
    settings: VerificationSettings,
    clock: Arc<dyn Clock>,
}

impl Verifier {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        prober: Arc<dyn HttpProber>,
        wp: WpCli,
        settings: VerificationSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            prober,
            wp,
            settings,
            clock,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.probe_timeout_secs)
    }

    /// Re-probe the site at `path`/`domain` and score it.
    pub async fn verify(
        &self,
        target: &Target,
        path: &str,
        domain: &str,
        diagnosis_type: DiagnosisType,
    ) -> VerificationReport {
        let url = site_url(domain);
        let (page, (log, fatal_count), functional) = tokio::join!(
            self.prober.fetch(&url, self.timeout()),
            self.score_log(target, path),
            self.score_functional(target, path),
        );

        let mut metrics = VerificationMetrics {
            recent_fatal_errors: fatal_count,
            ..Default::default()
        };

        let (http, content, performance) = match page {
            Ok(response) => {
                let assessment = assess_response(&response);
                metrics.http_status = Some(assessment.status);
                metrics.effective_status = Some(assessment.effective_status);
                metrics.response_ms = Some(assessment.elapsed_ms);
                metrics.body_bytes = Some(assessment.body_bytes);
                (
                    score_http(&assessment),
                    score_content(&response, &assessment),
                    self.score_performance(&assessment),
                )
            }
            Err(e) => {
                let reason = redact_secrets(&e.to_string());
                warn!(target_id = %target.id, url = %url, error = %reason, "Verification probe failed");
                (
                    DimensionResult::new(Dimension::Http, 0, HTTP_POINTS, format!("probe failed: {}", reason)),
                    DimensionResult::new(Dimension::Content, 0, CONTENT_POINTS, "no body to inspect"),
                    DimensionResult::new(Dimension::Performance, 0, PERFORMANCE_POINTS, "no response"),
                )
            }
        };

        let checks = vec![http, content, log, functional, performance];
        let score: u8 = checks.iter().map(|c| c.score).sum::<u8>().min(100);
        let passed = score >= self.settings.pass_threshold;

        let report = VerificationReport {
            score,
            passed,
            threshold: self.settings.pass_threshold,
            diagnosis_type,
            checks,
            metrics,
        };
        info!(
            target_id = %target.id,
            score,
            passed,
            diagnosis = %diagnosis_type,
            "Verification complete"
        );
        if !passed {
            debug!(target_id = %target.id, shortfalls = %report.shortfalls(), "Verification shortfalls");
        }
        report
    }

    async fn score_log(&self, target: &Target, path: &str) -> (DimensionResult, Option<usize>) {
        let command = log_tail_command(path, self.settings.log_tail_lines);
        let output = match self
            .executor
            .exec(&target.remote_handle, &command, self.timeout())
            .await
        {
            Ok(out) if out.success() => out,
            Ok(out) => {
                return (
                    DimensionResult::new(
                        Dimension::Log,
                        LOG_PROBE_FAILURE_POINTS,
                        LOG_POINTS,
                        format!("log tail exited with {}", out.exit_code),
                    ),
                    None,
                )
            }
            Err(e) => {
                return (
                    DimensionResult::new(
                        Dimension::Log,
                        LOG_PROBE_FAILURE_POINTS,
                        LOG_POINTS,
                        format!("log unavailable: {}", redact_secrets(&e.to_string())),
                    ),
                    None,
                )
            }
        };

        let since = self.clock.now() - ChronoDuration::seconds(self.settings.log_window_secs as i64);
        let fatal = output
            .stdout
            .lines()
            .filter_map(parse_log_line)
            .filter(|l| l.severity == LogSeverity::Fatal)
            .filter(|l| l.timestamp.map(|t| t >= since).unwrap_or(false))
            .count();

        let score = match fatal {
            0 => LOG_POINTS,
            1..=2 => LOG_POINTS / 2,
            _ => 0,
        };
        let message = if fatal == 0 {
            "no recent fatal errors".to_string()
        } else {
            format!("{} fatal errors in the last {}s", fatal, self.settings.log_window_secs)
        };
        (
            DimensionResult::new(Dimension::Log, score, LOG_POINTS, message),
            Some(fatal),
        )
    }

    async fn score_functional(&self, target: &Target, path: &str) -> DimensionResult {
        let probes = [
            ("core", self.wp.command(path, "core is-installed"), 7u8),
            ("database", self.wp.command(path, "db query 'SELECT 1'"), 7),
            (
                "plugins",
                self.wp.command(path, "plugin list --status=active --format=count"),
                6,
            ),
        ];
        let timeout = self.timeout();
        let outcomes = futures::future::join_all(probes.iter().map(|(_, cmd, _)| {
            self.executor.exec(&target.remote_handle, cmd, timeout)
        }))
        .await;

        let mut score = 0u8;
        let mut failed = Vec::new();
        for ((name, _, points), outcome) in probes.iter().zip(outcomes) {
            match outcome {
                Ok(out) if out.success() => score += points,
                _ => failed.push(*name),
            }
        }
        let message = if failed.is_empty() {
            "core, database and plugin probes passed".to_string()
        } else {
            format!("failed probes: {}", failed.join(", "))
        };
        DimensionResult::new(Dimension::Functional, score, FUNCTIONAL_POINTS, message)
    }

    fn score_performance(&self, assessment: &HttpAssessment) -> DimensionResult {
        let elapsed = assessment.elapsed_ms;
        let timing = if elapsed <= self.settings.fast_response_ms {
            10
        } else if elapsed <= self.settings.slow_response_ms {
            6
        } else if elapsed <= self.settings.max_response_ms {
            3
        } else {
            0
        };
        let size = if assessment.body_bytes >= SUSPICIOUS_BODY_BYTES {
            5
        } else if assessment.body_bytes >= BLANK_PAGE_BYTES {
            2
        } else {
            0
        };
        DimensionResult::new(
            Dimension::Performance,
            timing + size,
            PERFORMANCE_POINTS,
            format!("{}ms, {} bytes", elapsed, assessment.body_bytes),
        )
    }
}

fn score_http(assessment: &HttpAssessment) -> DimensionResult {
    let score = match assessment.effective_status {
        200..=299 => HTTP_POINTS,
        300..=399 => HTTP_POINTS * 3 / 4,
        _ => 0,
    };
    DimensionResult::new(Dimension::Http, score, HTTP_POINTS, assessment.summary())
}

fn score_content(response: &HttpResponse, assessment: &HttpAssessment) -> DimensionResult {
    if assessment.has_markers() {
        return DimensionResult::new(
            Dimension::Content,
            0,
            CONTENT_POINTS,
            format!("failure markers: {}", assessment.markers.join(", ")),
        );
    }
    if assessment.blank_page {
        return DimensionResult::new(Dimension::Content, 0, CONTENT_POINTS, "blank page");
    }

    let lowered = response.body.to_lowercase();
    let mut score = CONTENT_POINTS;
    let mut problems = Vec::new();
    if !lowered.contains("<html") || !lowered.contains("</html>") {
        score = score.saturating_sub(10);
        problems.push("incomplete html document");
    }
    if !lowered.contains("<body") {
        score = score.saturating_sub(5);
        problems.push("no body element");
    }
    if assessment.suspicious_small {
        score = score.saturating_sub(10);
        problems.push("suspiciously small page");
    }
    let message = if problems.is_empty() {
        "page structure looks sane".to_string()
    } else {
        problems.join(", ")
    };
    DimensionResult::new(Dimension::Content, score, CONTENT_POINTS, message)
}
