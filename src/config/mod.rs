//! Configuration Management
//!
//! Loads engine configuration from TOML files. Configuration includes:
//! - Logging (level, JSON output)
//! - Diagnosis defaults and check weights
//! - Per-profile overrides (checks, timeout, cache policy)
//! - Healing, retry and verification tuning
//! - Target inventory seed with SSH endpoints
//!
//! The loaded `Config` is turned once into immutable tables (`ProfileTable`,
//! `CheckWeights`) that are passed explicitly to the components that need them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::errors::HealerError;
use crate::model::{
    BackupKind, CheckPriority, CheckType, DiagnosisProfile, HealingConfig, Subdomain, Target,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub diagnosis: DiagnosisConfig,

    /// Overrides keyed by profile name (`full`, `light`, `quick`, `custom`)
    #[serde(default)]
    pub profiles: HashMap<String, ProfileSettings>,

    #[serde(default)]
    pub healing: HealingSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub verification: VerificationSettings,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisConfig {
    #[serde(default = "default_profile")]
    pub default_profile: DiagnosisProfile,
    #[serde(default)]
    pub weights: CheckWeights,
    /// Timestamped log errors older than this, or older than the target's
    /// last successful heal, no longer count as causes
    #[serde(default = "default_diagnosis_log_window")]
    pub log_window_secs: u64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            default_profile: default_profile(),
            weights: CheckWeights::default(),
            log_window_secs: default_diagnosis_log_window(),
        }
    }
}

/// Weight each check priority carries in the health score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckWeights {
    #[serde(default = "default_weight_critical")]
    pub critical: f64,
    #[serde(default = "default_weight_high")]
    pub high: f64,
    #[serde(default = "default_weight_medium")]
    pub medium: f64,
    #[serde(default = "default_weight_low")]
    pub low: f64,
}

impl CheckWeights {
    pub fn weight(&self, priority: CheckPriority) -> f64 {
        match priority {
            CheckPriority::Critical => self.critical,
            CheckPriority::High => self.high,
            CheckPriority::Medium => self.medium,
            CheckPriority::Low => self.low,
        }
    }
}

impl Default for CheckWeights {
    fn default() -> Self {
        Self {
            critical: default_weight_critical(),
            high: default_weight_high(),
            medium: default_weight_medium(),
            low: default_weight_low(),
        }
    }
}

/// Optional overrides for one built-in profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSettings {
    pub checks: Option<Vec<CheckType>>,
    pub timeout_secs: Option<u64>,
    pub log_depth: Option<usize>,
    pub parallel: Option<bool>,
    pub use_cache: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingSettings {
    /// Profile used by orchestrated (pre-heal) diagnoses
    #[serde(default = "default_healing_profile")]
    pub diagnosis_profile: DiagnosisProfile,
    /// Ordered fallback themes tried on THEME_FAULT
    #[serde(default = "default_fallback_themes")]
    pub fallback_themes: Vec<String>,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Minimum diagnosis confidence for `auto` mode healing
    #[serde(default = "default_auto_heal_confidence")]
    pub auto_heal_confidence: f64,
    #[serde(default = "default_backup_kind")]
    pub backup_kind: BackupKind,
    /// WP_MEMORY_LIMIT applied on memory exhaustion
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// wp-cli binary on the remote host
    #[serde(default = "default_wp_cli")]
    pub wp_cli: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
}

impl Default for HealingSettings {
    fn default() -> Self {
        Self {
            diagnosis_profile: default_healing_profile(),
            fallback_themes: default_fallback_themes(),
            job_timeout_secs: default_job_timeout(),
            command_timeout_secs: default_command_timeout(),
            auto_heal_confidence: default_auto_heal_confidence(),
            backup_kind: default_backup_kind(),
            memory_limit: default_memory_limit(),
            wp_cli: default_wp_cli(),
            backup_dir: default_backup_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Upper bound on any computed retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// How long an opened breaker stays open before a half-open trial
    #[serde(default = "default_circuit_reset_secs")]
    pub circuit_reset_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay_ms(),
            circuit_reset_secs: default_circuit_reset_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSettings {
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: u8,
    /// Only log entries newer than this count against verification
    #[serde(default = "default_log_window")]
    pub log_window_secs: u64,
    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
    #[serde(default = "default_fast_response")]
    pub fast_response_ms: u64,
    #[serde(default = "default_slow_response")]
    pub slow_response_ms: u64,
    #[serde(default = "default_max_response")]
    pub max_response_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            log_window_secs: default_log_window(),
            log_tail_lines: default_log_tail(),
            fast_response_ms: default_fast_response(),
            slow_response_ms: default_slow_response(),
            max_response_ms: default_max_response(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub identity_file: Option<PathBuf>,
}

/// Inventory seed for one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub subdomains: Vec<Subdomain>,
    pub ssh: Option<SshEndpoint>,
    #[serde(default)]
    pub healing: HealingConfig,
}

impl TargetConfig {
    pub fn to_target(&self) -> Target {
        let mut target = Target::new(&self.id, &self.domain, &self.path)
            .with_healing(self.healing.clone());
        target.subdomains = self.subdomains.clone();
        target
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_profile() -> DiagnosisProfile {
    DiagnosisProfile::Light
}
fn default_healing_profile() -> DiagnosisProfile {
    DiagnosisProfile::Full
}
fn default_weight_critical() -> f64 {
    3.0
}
fn default_weight_high() -> f64 {
    2.0
}
fn default_weight_medium() -> f64 {
    1.0
}
fn default_weight_low() -> f64 {
    0.5
}
fn default_fallback_themes() -> Vec<String> {
    vec![
        "twentytwentyfour".to_string(),
        "twentytwentythree".to_string(),
        "twentytwentytwo".to_string(),
        "twentytwentyone".to_string(),
    ]
}
fn default_job_timeout() -> u64 {
    600
}
fn default_command_timeout() -> u64 {
    120
}
fn default_auto_heal_confidence() -> f64 {
    0.8
}
fn default_backup_kind() -> BackupKind {
    BackupKind::Full
}
fn default_memory_limit() -> String {
    "256M".to_string()
}
fn default_wp_cli() -> String {
    "wp".to_string()
}
fn default_backup_dir() -> String {
    "~/.wpheal-backups".to_string()
}
fn default_max_delay_ms() -> u64 {
    3_600_000
}
fn default_circuit_reset_secs() -> u64 {
    1800
}
fn default_pass_threshold() -> u8 {
    80
}
fn default_diagnosis_log_window() -> u64 {
    3600
}
fn default_log_window() -> u64 {
    300
}
fn default_log_tail() -> usize {
    200
}
fn default_fast_response() -> u64 {
    1000
}
fn default_slow_response() -> u64 {
    3000
}
fn default_max_response() -> u64 {
    5000
}
fn default_probe_timeout() -> u64 {
    30
}
fn default_concurrency() -> usize {
    2
}
fn default_store_path() -> PathBuf {
    PathBuf::from("wpheal-state.json")
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_ssh_port() -> u16 {
    22
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                toml::from_str(&content).context("Failed to parse config")?
            }
            None => {
                let home_config = dirs::home_dir().map(|h| h.join(".config/wpheal/config.toml"));

                let mut candidates = vec![PathBuf::from("wpheal.toml")];
                if let Some(hc) = home_config {
                    candidates.push(hc);
                }

                let mut loaded = None;
                for p in &candidates {
                    if let Ok(content) = std::fs::read_to_string(p) {
                        loaded = Some(toml::from_str(&content).with_context(|| {
                            format!("Failed to parse config {}", p.display())
                        })?);
                        break;
                    }
                }
                loaded.unwrap_or_else(|| {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                })
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("WPHEAL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(path) = std::env::var("WPHEAL_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Ok(concurrency) = std::env::var("WPHEAL_WORKER_CONCURRENCY") {
            if let Ok(n) = concurrency.parse::<usize>() {
                self.worker.concurrency = n;
            }
        }
        if let Ok(cooldown) = std::env::var("WPHEAL_COOLDOWN_SECS") {
            if let Ok(secs) = cooldown.parse::<u64>() {
                for target in &mut self.targets {
                    target.healing.cooldown_secs = secs;
                }
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), HealerError> {
        if self.worker.concurrency == 0 {
            return Err(HealerError::Config(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.verification.pass_threshold > 100 {
            return Err(HealerError::Config(format!(
                "verification.pass_threshold must be 0-100, got {}",
                self.verification.pass_threshold
            )));
        }
        if self.diagnosis.log_window_secs == 0 {
            return Err(HealerError::Config(
                "diagnosis.log_window_secs must be at least 1".to_string(),
            ));
        }
        let w = &self.diagnosis.weights;
        if [w.critical, w.high, w.medium, w.low]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(HealerError::Config(
                "check weights must be finite and non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.healing.auto_heal_confidence) {
            return Err(HealerError::Config(
                "healing.auto_heal_confidence must be within 0.0-1.0".to_string(),
            ));
        }
        for name in self.profiles.keys() {
            name.parse::<DiagnosisProfile>()
                .map_err(|e| HealerError::Config(e.to_string()))?;
        }
        if let Some(custom) = self.profiles.get("custom") {
            if custom.checks.is_some() {
                return Err(HealerError::Config(
                    "the custom profile takes its checks from the caller; remove profiles.custom.checks"
                        .to_string(),
                ));
            }
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.id.as_str()) {
                return Err(HealerError::Config(format!(
                    "duplicate target id '{}'",
                    target.id
                )));
            }
            if target.healing.max_attempts == 0 {
                return Err(HealerError::Config(format!(
                    "target '{}' max_attempts must be at least 1",
                    target.id
                )));
            }
        }
        Ok(())
    }

    pub fn target(&self, id: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.id == id)
    }
}
