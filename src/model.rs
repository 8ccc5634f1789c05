//! Core records shared by every subsystem.
//!
//! The store owns all of these; in-memory holders refer to each other by id
//! (`previous_attempt_id`, `backup.id`, `pattern_id`) rather than by pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{DiagnosisError, HealingError};

// ============================================================================
// Checks
// ============================================================================

/// Kinds of pluggable health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    HttpAvailability,
    DatabaseConnection,
    CoreIntegrity,
    ErrorLog,
    DiskSpace,
    PluginUpdates,
    BackupFreshness,
    SslCertificate,
    CoreUpdates,
}

impl CheckType {
    pub const ALL: [CheckType; 9] = [
        CheckType::HttpAvailability,
        CheckType::DatabaseConnection,
        CheckType::CoreIntegrity,
        CheckType::ErrorLog,
        CheckType::DiskSpace,
        CheckType::PluginUpdates,
        CheckType::BackupFreshness,
        CheckType::SslCertificate,
        CheckType::CoreUpdates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpAvailability => "http_availability",
            Self::DatabaseConnection => "database_connection",
            Self::CoreIntegrity => "core_integrity",
            Self::ErrorLog => "error_log",
            Self::DiskSpace => "disk_space",
            Self::PluginUpdates => "plugin_updates",
            Self::BackupFreshness => "backup_freshness",
            Self::SslCertificate => "ssl_certificate",
            Self::CoreUpdates => "core_updates",
        }
    }

    /// Priority a check of this type carries unless its implementation
    /// overrides it.
    pub fn default_priority(&self) -> CheckPriority {
        match self {
            Self::HttpAvailability | Self::DatabaseConnection | Self::CoreIntegrity => {
                CheckPriority::Critical
            }
            Self::ErrorLog | Self::DiskSpace => CheckPriority::High,
            Self::PluginUpdates | Self::BackupFreshness | Self::SslCertificate => {
                CheckPriority::Medium
            }
            Self::CoreUpdates => CheckPriority::Low,
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = DiagnosisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        CheckType::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| DiagnosisError::UnknownCheck(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckPriority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
    Skipped,
    Error,
}

/// One check's verdict. Created fresh per run and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_type: CheckType,
    pub status: CheckStatus,
    pub priority: CheckPriority,
    /// 0-100
    pub score: u8,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(
        check_type: CheckType,
        priority: CheckPriority,
        status: CheckStatus,
        score: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check_type,
            status,
            priority,
            score: score.min(100),
            message: message.into(),
            details: serde_json::Value::Null,
            recommendations: Vec::new(),
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn pass(check_type: CheckType, priority: CheckPriority, message: impl Into<String>) -> Self {
        Self::new(check_type, priority, CheckStatus::Pass, 100, message)
    }

    /// Synthetic result for a check that threw or timed out.
    pub fn error(check_type: CheckType, priority: CheckPriority, message: impl Into<String>) -> Self {
        Self::new(check_type, priority, CheckStatus::Error, 0, message)
    }

    pub fn skipped(check_type: CheckType, message: impl Into<String>) -> Self {
        Self::new(
            check_type,
            check_type.default_priority(),
            CheckStatus::Skipped,
            0,
            message,
        )
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_issue(&self) -> bool {
        matches!(
            self.status,
            CheckStatus::Fail | CheckStatus::Error | CheckStatus::Warning
        )
    }
}

// ============================================================================
// Diagnosis
// ============================================================================

/// Named diagnosis depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisProfile {
    Full,
    Light,
    Quick,
    Custom,
}

impl DiagnosisProfile {
    pub const ALL: [DiagnosisProfile; 4] = [
        DiagnosisProfile::Full,
        DiagnosisProfile::Light,
        DiagnosisProfile::Quick,
        DiagnosisProfile::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Light => "light",
            Self::Quick => "quick",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for DiagnosisProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagnosisProfile {
    type Err = DiagnosisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "light" => Ok(Self::Light),
            "quick" => Ok(Self::Quick),
            "custom" => Ok(Self::Custom),
            _ => Err(DiagnosisError::UnknownProfile(s.to_string())),
        }
    }
}

/// Primary failure classes produced by causal diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosisType {
    Healthy,
    Maintenance,
    DbError,
    Integrity,
    PluginFault,
    ThemeFault,
    MemoryExhaustion,
    SyntaxError,
    DbConnection,
    AccessDenied,
    Unknown,
}

impl DiagnosisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Maintenance => "MAINTENANCE",
            Self::DbError => "DB_ERROR",
            Self::Integrity => "INTEGRITY",
            Self::PluginFault => "PLUGIN_FAULT",
            Self::ThemeFault => "THEME_FAULT",
            Self::MemoryExhaustion => "MEMORY_EXHAUSTION",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::DbConnection => "DB_CONNECTION",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether a remediation can be attempted for this diagnosis.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl fmt::Display for DiagnosisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a culprit slug names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CulpritKind {
    Plugin,
    Theme,
}

/// Single causal verdict derived from the structural signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalDiagnosis {
    pub diagnosis_type: DiagnosisType,
    pub confidence: f64,
    /// Plugin/theme slug blamed for the failure, when known
    pub culprit: Option<String>,
    #[serde(default)]
    pub culprit_kind: Option<CulpritKind>,
    /// Structured log error class that won the tally
    pub error_type: Option<String>,
    /// Raw text of the first error of the winning class
    pub error_message: Option<String>,
    pub suggested_action: String,
    pub suggested_commands: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl CausalDiagnosis {
    pub fn unknown(evidence: Vec<String>) -> Self {
        Self {
            diagnosis_type: DiagnosisType::Unknown,
            confidence: 0.0,
            culprit: None,
            culprit_kind: None,
            error_type: None,
            error_message: None,
            suggested_action: "Investigate manually; no actionable cause found".to_string(),
            suggested_commands: Vec::new(),
            evidence,
        }
    }
}

/// Aggregated outcome of one diagnosis run. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    pub id: String,
    pub target_id: String,
    pub path: String,
    pub domain: String,
    pub profile: DiagnosisProfile,
    pub checks_run: Vec<CheckType>,
    pub health_score: u8,
    pub issues_count: u32,
    pub critical_count: u32,
    pub warning_count: u32,
    pub diagnosis: CausalDiagnosis,
    pub results: Vec<CheckResult>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

impl HealthStatus {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=100 => Self::Healthy,
            50..=79 => Self::Degraded,
            _ => Self::Critical,
        }
    }
}

// ============================================================================
// Targets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealingMode {
    /// Never heal without an explicit request
    Disabled,
    /// Heal automatically only with an auto-approved learned pattern
    #[default]
    Supervised,
    /// Heal automatically whenever the diagnosis is confident enough
    Auto,
}

/// Backoff applied between automatic retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Immediate,
    Linear,
    #[default]
    Exponential,
    Fibonacci,
}

/// Per-target healing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(default)]
    pub mode: HealingMode,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub plugin_blacklist: Vec<String>,
    #[serde(default)]
    pub theme_blacklist: Vec<String>,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_retry_base_delay_ms() -> u64 {
    60_000
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            mode: HealingMode::default(),
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown_secs(),
            plugin_blacklist: Vec::new(),
            theme_blacklist: Vec::new(),
            retry_strategy: RetryStrategy::default(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Persisted breaker state carried on the target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    /// Set while the single HALF_OPEN probe attempt is outstanding
    #[serde(default)]
    pub trial_in_flight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subdomain {
    pub domain: String,
    pub path: String,
}

/// A remediable site. Owned by the inventory; this engine only mutates its
/// health and breaker bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub domain: String,
    /// Filesystem root of the WordPress install
    pub path: String,
    /// Identifier handed to the remote executor
    pub remote_handle: String,
    #[serde(default)]
    pub subdomains: Vec<Subdomain>,
    pub health_score: Option<u8>,
    pub health_status: HealthStatus,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub breaker: BreakerState,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub total_failures: u32,
    pub last_diagnosed_at: Option<DateTime<Utc>>,
    pub last_healed_at: Option<DateTime<Utc>>,
}

impl Target {
    pub fn new(id: impl Into<String>, domain: impl Into<String>, path: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            remote_handle: id.clone(),
            id,
            domain: domain.into(),
            path: path.into(),
            subdomains: Vec::new(),
            health_score: None,
            health_status: HealthStatus::Unknown,
            healing: HealingConfig::default(),
            breaker: BreakerState::default(),
            consecutive_failures: 0,
            total_failures: 0,
            last_diagnosed_at: None,
            last_healed_at: None,
        }
    }

    pub fn with_healing(mut self, healing: HealingConfig) -> Self {
        self.healing = healing;
        self
    }

    pub fn with_subdomain(mut self, domain: impl Into<String>, path: impl Into<String>) -> Self {
        self.subdomains.push(Subdomain {
            domain: domain.into(),
            path: path.into(),
        });
        self
    }

    /// Resolve the (domain, path) pair to probe. Falls back to the main site
    /// when the subdomain is unknown.
    pub fn resolve_site(&self, subdomain: Option<&str>) -> (String, String) {
        subdomain
            .and_then(|wanted| {
                self.subdomains
                    .iter()
                    .find(|s| s.domain.eq_ignore_ascii_case(wanted))
            })
            .map(|s| (s.domain.clone(), s.path.clone()))
            .unwrap_or_else(|| (self.domain.clone(), self.path.clone()))
    }
}

// ============================================================================
// Executions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Scheduled,
    Api,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Diagnosed,
    Approved,
    Healing,
    Success,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnosed => "DIAGNOSED",
            Self::Approved => "APPROVED",
            Self::Healing => "HEALING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Diagnosed, Approved)
                | (Approved, Healing)
                | (Approved, Failed)
                | (Healing, Success)
                | (Healing, Failed)
                | (Failed, RolledBack)
                | (Success, RolledBack)
        )
    }

    /// Approved or healing: a job is queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Approved | Self::Healing)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Files,
    Database,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRef {
    pub id: String,
    pub target_id: String,
    /// Executor handle and site root the backup was taken from
    pub remote_handle: String,
    pub path: String,
    pub kind: BackupKind,
    /// Remote location of the archive(s)
    pub location: String,
    pub created_at: DateTime<Utc>,
}

/// Ranked remediation suggestion taken from a learned pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSuggestion {
    pub pattern_id: String,
    pub commands: Vec<String>,
    pub confidence: f64,
    pub match_score: f64,
    pub auto_approve: bool,
    pub reasoning: String,
}

/// One remediation lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub target_id: String,
    pub domain: String,
    pub path: String,
    pub triggered_by: TriggerSource,
    pub diagnosis: DiagnosisRecord,
    /// Best learned-pattern suggestion at diagnosis time
    pub learned_suggestion: Option<PatternSuggestion>,
    /// Pattern whose commands were run, when a learned remedy was applied
    #[serde(default)]
    pub applied_pattern_id: Option<String>,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub previous_attempt_id: Option<String>,
    pub custom_commands: Option<Vec<String>>,
    /// Commands that ran successfully, in order
    #[serde(default)]
    pub commands_executed: Vec<String>,
    pub action_taken: Option<String>,
    pub backup: Option<BackupRef>,
    pub verification_score: Option<u8>,
    pub verification_details: Option<serde_json::Value>,
    pub error: Option<String>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log: Vec<ExecutionLogEntry>,
}

impl Execution {
    pub fn diagnosed(
        target: &Target,
        diagnosis: DiagnosisRecord,
        learned_suggestion: Option<PatternSuggestion>,
        triggered_by: TriggerSource,
        now: DateTime<Utc>,
    ) -> Self {
        let mut execution = Self {
            id: format!("exec_{}", uuid::Uuid::new_v4().simple()),
            target_id: target.id.clone(),
            domain: diagnosis.domain.clone(),
            path: diagnosis.path.clone(),
            triggered_by,
            diagnosis,
            learned_suggestion,
            applied_pattern_id: None,
            status: ExecutionStatus::Diagnosed,
            attempt: 1,
            max_attempts: target.healing.max_attempts.max(1),
            previous_attempt_id: None,
            custom_commands: None,
            commands_executed: Vec::new(),
            action_taken: None,
            backup: None,
            verification_score: None,
            verification_details: None,
            error: None,
            job_id: None,
            created_at: now,
            approved_at: None,
            started_at: None,
            completed_at: None,
            rolled_back_at: None,
            log: Vec::new(),
        };
        let summary = format!(
            "Diagnosed {} (confidence {:.2}, health {})",
            execution.diagnosis.diagnosis.diagnosis_type,
            execution.diagnosis.diagnosis.confidence,
            execution.diagnosis.health_score
        );
        execution.push_log(now, LogLevel::Info, summary);
        execution
    }

    /// Fresh execution for an automatic retry, linked to the failed one.
    pub fn retry_of(previous: &Execution, now: DateTime<Utc>) -> Self {
        let mut execution = Self {
            id: format!("exec_{}", uuid::Uuid::new_v4().simple()),
            target_id: previous.target_id.clone(),
            domain: previous.domain.clone(),
            path: previous.path.clone(),
            triggered_by: TriggerSource::Retry,
            diagnosis: previous.diagnosis.clone(),
            learned_suggestion: previous.learned_suggestion.clone(),
            applied_pattern_id: None,
            status: ExecutionStatus::Approved,
            attempt: previous.attempt + 1,
            max_attempts: previous.max_attempts,
            previous_attempt_id: Some(previous.id.clone()),
            custom_commands: previous.custom_commands.clone(),
            commands_executed: Vec::new(),
            action_taken: None,
            backup: None,
            verification_score: None,
            verification_details: None,
            error: None,
            job_id: None,
            created_at: now,
            approved_at: Some(now),
            started_at: None,
            completed_at: None,
            rolled_back_at: None,
            log: Vec::new(),
        };
        execution.push_log(
            now,
            LogLevel::Info,
            format!(
                "Retry attempt {}/{} of {}",
                execution.attempt, execution.max_attempts, previous.id
            ),
        );
        execution
    }

    /// Move through the state machine, stamping the phase timestamp.
    pub fn transition(
        &mut self,
        next: ExecutionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), HealingError> {
        if !self.status.can_transition_to(next) {
            return Err(HealingError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.status;
        self.status = next;
        match next {
            ExecutionStatus::Approved => self.approved_at = Some(now),
            ExecutionStatus::Healing => self.started_at = Some(now),
            ExecutionStatus::Success | ExecutionStatus::Failed => self.completed_at = Some(now),
            ExecutionStatus::RolledBack => self.rolled_back_at = Some(now),
            ExecutionStatus::Diagnosed => {}
        }
        self.push_log(now, LogLevel::Info, format!("{} -> {}", previous, next));
        Ok(())
    }

    pub fn push_log(&mut self, at: DateTime<Utc>, level: LogLevel, message: impl Into<String>) {
        self.log.push(ExecutionLogEntry {
            at,
            level,
            message: message.into(),
        });
    }

    pub fn is_manual_override(&self) -> bool {
        self.custom_commands
            .as_ref()
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }
}

// ============================================================================
// Patterns and cache
// ============================================================================

/// Learned fingerprint -> remedy mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingPattern {
    pub id: String,
    pub diagnosis_type: DiagnosisType,
    pub error_type: Option<String>,
    /// Plugin/theme slug, or `*` for any
    pub culprit: String,
    /// Normalised error-message regex
    pub error_pattern: Option<String>,
    pub commands: Vec<String>,
    pub description: String,
    pub success_count: u32,
    pub failure_count: u32,
    pub confidence: f64,
    pub auto_approve: bool,
    /// Hand-verified rather than learned
    #[serde(default)]
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

pub const AUTO_APPROVE_CONFIDENCE: f64 = 0.9;
pub const AUTO_APPROVE_MIN_SUCCESSES: u32 = 5;

impl HealingPattern {
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.success_count += 1;
        self.last_used_at = Some(now);
        self.last_success_at = Some(now);
        self.recompute();
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count += 1;
        self.last_used_at = Some(now);
        self.last_failure_at = Some(now);
        self.recompute();
    }

    /// Derive confidence and auto-approval from the counters. Called after
    /// every counter change so the flag is never stale.
    pub fn recompute(&mut self) {
        let total = self.success_count + self.failure_count;
        self.confidence = if total == 0 {
            0.0
        } else {
            f64::from(self.success_count) / f64::from(total)
        };
        self.auto_approve = self.confidence > AUTO_APPROVE_CONFIDENCE
            && self.success_count >= AUTO_APPROVE_MIN_SUCCESSES;
    }
}

/// Cached diagnosis keyed by (target, path, profile).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub target_id: String,
    pub path: String,
    pub profile: DiagnosisProfile,
    pub record: DiagnosisRecord,
    pub health_score: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn key_for(target_id: &str, path: &str, profile: DiagnosisProfile) -> String {
        format!("{}|{}|{}", target_id, path, profile)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
