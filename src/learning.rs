//! Pattern learning: remember which commands healed which failure and
//! suggest them the next time the same failure shows up.
//!
//! A pattern is keyed by a fingerprint of the causal diagnosis (type, error
//! class, culprit and normalised error text). Commands are stored with the
//! site path replaced by a placeholder so a pattern learned on one site can
//! be replayed on another.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::{HealingError, Result};
use crate::model::{
    CausalDiagnosis, DiagnosisType, Execution, ExecutionStatus, HealingPattern, PatternSuggestion,
};
use crate::remote::shell_quote;
use crate::store::Store;

/// Culprit value that matches any culprit.
pub const ANY_CULPRIT: &str = "*";
/// Stands in for the quoted site path inside stored commands.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Match scores at or below this are never suggested.
pub const MATCH_FLOOR: f64 = 0.5;
const REGEX_MATCH_BOOST: f64 = 1.2;
const REGEX_MISS_PENALTY: f64 = 0.7;

static ABS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"/[^\s:'"()]+"#).expect("invalid regex"));
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("invalid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("invalid regex"));

/// Strip the volatile parts of an error message: absolute paths, numbers
/// and runs of whitespace.
pub fn normalize_error_message(message: &str) -> String {
    let text = ABS_PATH.replace_all(message.trim(), "<path>");
    let text = DIGITS.replace_all(&text, "<n>");
    WHITESPACE.replace_all(&text, " ").into_owned()
}

/// Anchored regex for a normalised message. It matches other normalised
/// messages that differ only in the stripped parts.
pub fn error_pattern_for(message: &str) -> String {
    let escaped = regex::escape(&normalize_error_message(message));
    let body = escaped
        .replace("<path>", r"[^\s]+")
        .replace("<n>", r"[^\s]+");
    format!("^{}$", body)
}

/// Deterministic pattern id for a diagnosis.
pub fn fingerprint(diagnosis: &CausalDiagnosis) -> String {
    let mut hasher = Sha256::new();
    hasher.update(diagnosis.diagnosis_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(diagnosis.error_type.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(diagnosis.culprit.as_deref().unwrap_or(ANY_CULPRIT).as_bytes());
    hasher.update(b"|");
    if let Some(message) = &diagnosis.error_message {
        hasher.update(normalize_error_message(message).as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("pat_{}", &digest[..16])
}

/// Replace the quoted site path with the placeholder.
pub fn templatize_command(command: &str, path: &str) -> String {
    command.replace(&shell_quote(path), PATH_PLACEHOLDER)
}

/// Substitute the placeholder with the quoted site path.
pub fn render_command(command: &str, path: &str) -> String {
    command.replace(PATH_PLACEHOLDER, &shell_quote(path))
}

/// Match score of a stored pattern against a live diagnosis, before the
/// floor is applied.
pub fn match_score(pattern: &HealingPattern, diagnosis: &CausalDiagnosis) -> f64 {
    if pattern.diagnosis_type != diagnosis.diagnosis_type {
        return 0.0;
    }
    if let (Some(want), Some(have)) = (&pattern.error_type, &diagnosis.error_type) {
        if want != have {
            return 0.0;
        }
    }

    let mut score = 1.0;
    if let Some(expr) = &pattern.error_pattern {
        let matched = match (Regex::new(expr), &diagnosis.error_message) {
            (Ok(re), Some(message)) => re.is_match(&normalize_error_message(message)),
            (Err(e), _) => {
                warn!(pattern_id = %pattern.id, error = %e, "Stored error pattern does not compile");
                false
            }
            (Ok(_), None) => false,
        };
        score *= if matched {
            REGEX_MATCH_BOOST
        } else {
            REGEX_MISS_PENALTY
        };
    }

    if let Some(culprit) = &diagnosis.culprit {
        if pattern.culprit != ANY_CULPRIT && &pattern.culprit != culprit {
            score = MATCH_FLOOR;
        }
    }
    score
}

/// Learned patterns on top of the record store.
pub struct PatternStore {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl PatternStore {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn list(&self) -> Result<Vec<HealingPattern>> {
        Ok(self.store.list_patterns().await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<HealingPattern>> {
        Ok(self.store.get_pattern(id).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.store.delete_pattern(id).await?)
    }

    /// Add a hand-written pattern. It is marked verified so it is suggested
    /// before it has any observations.
    pub async fn add_verified(
        &self,
        diagnosis_type: DiagnosisType,
        culprit: Option<&str>,
        commands: Vec<String>,
        description: impl Into<String>,
    ) -> Result<HealingPattern> {
        let diagnosis = CausalDiagnosis {
            diagnosis_type,
            culprit: culprit.map(str::to_string),
            ..CausalDiagnosis::unknown(Vec::new())
        };
        let mut pattern = self.new_pattern(&diagnosis, commands, description.into());
        pattern.verified = true;
        self.store.upsert_pattern(&pattern).await?;
        info!(pattern_id = %pattern.id, diagnosis = %diagnosis_type, "Verified pattern added");
        Ok(pattern)
    }

    /// Ranked suggestions for a diagnosis at `path`, best first.
    pub async fn suggest(
        &self,
        diagnosis: &CausalDiagnosis,
        path: &str,
    ) -> Result<Vec<PatternSuggestion>> {
        if !diagnosis.diagnosis_type.is_actionable() {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<(f64, PatternSuggestion)> = Vec::new();
        for pattern in self.store.list_patterns().await? {
            if pattern.commands.is_empty() {
                continue;
            }
            let observations = pattern.success_count + pattern.failure_count;
            if observations == 0 && !pattern.verified {
                continue;
            }
            let score = match_score(&pattern, diagnosis);
            if score <= MATCH_FLOOR {
                continue;
            }
            // Verified patterns without history rank as if fully confident.
            let confidence = if observations == 0 {
                1.0
            } else {
                pattern.confidence
            };
            let suggestion = PatternSuggestion {
                pattern_id: pattern.id.clone(),
                commands: pattern
                    .commands
                    .iter()
                    .map(|c| render_command(c, path))
                    .collect(),
                confidence: pattern.confidence,
                match_score: score,
                auto_approve: pattern.auto_approve && score >= 1.0,
                reasoning: format!(
                    "{} ({} ok / {} failed, match {:.2})",
                    pattern.description, pattern.success_count, pattern.failure_count, score
                ),
            };
            ranked.push((score * confidence, suggestion));
        }

        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        debug!(
            diagnosis = %diagnosis.diagnosis_type,
            suggestions = ranked.len(),
            "Pattern suggestions ranked"
        );
        Ok(ranked.into_iter().map(|(_, s)| s).collect())
    }

    /// Best suggestion, if any.
    pub async fn best_suggestion(
        &self,
        diagnosis: &CausalDiagnosis,
        path: &str,
    ) -> Result<Option<PatternSuggestion>> {
        Ok(self.suggest(diagnosis, path).await?.into_iter().next())
    }

    /// Credit a successful execution. Creates the pattern from the executed
    /// commands when none exists yet.
    pub async fn learn_from_success(&self, execution_id: &str) -> Result<Option<HealingPattern>> {
        let execution = self.load(execution_id).await?;
        if execution.status != ExecutionStatus::Success {
            debug!(execution_id, status = %execution.status, "Not learning from unsuccessful execution");
            return Ok(None);
        }
        let diagnosis = &execution.diagnosis.diagnosis;
        if !diagnosis.diagnosis_type.is_actionable() {
            return Ok(None);
        }

        let now = self.clock.now();
        let id = self.pattern_id_for(&execution);
        let pattern = match self.store.get_pattern(&id).await? {
            Some(mut pattern) => {
                pattern.record_success(now);
                if pattern.commands.is_empty() {
                    pattern.commands = self.template_commands(&execution);
                }
                pattern
            }
            None => {
                let commands = self.template_commands(&execution);
                if commands.is_empty() {
                    return Ok(None);
                }
                let description = execution
                    .action_taken
                    .clone()
                    .unwrap_or_else(|| diagnosis.suggested_action.clone());
                let mut pattern = self.new_pattern(diagnosis, commands, description);
                pattern.record_success(now);
                pattern
            }
        };
        self.store.upsert_pattern(&pattern).await?;
        info!(
            pattern_id = %pattern.id,
            successes = pattern.success_count,
            confidence = pattern.confidence,
            auto_approve = pattern.auto_approve,
            "Pattern credited"
        );
        Ok(Some(pattern))
    }

    /// Debit the pattern behind a failed execution. Failures never create
    /// patterns.
    pub async fn record_failure(&self, execution_id: &str) -> Result<Option<HealingPattern>> {
        let execution = self.load(execution_id).await?;
        let id = self.pattern_id_for(&execution);
        let Some(mut pattern) = self.store.get_pattern(&id).await? else {
            return Ok(None);
        };
        pattern.record_failure(self.clock.now());
        self.store.upsert_pattern(&pattern).await?;
        info!(
            pattern_id = %pattern.id,
            failures = pattern.failure_count,
            confidence = pattern.confidence,
            "Pattern debited"
        );
        Ok(Some(pattern))
    }

    async fn load(&self, execution_id: &str) -> Result<Execution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| HealingError::ExecutionNotFound(execution_id.to_string()).into())
    }

    fn pattern_id_for(&self, execution: &Execution) -> String {
        execution
            .applied_pattern_id
            .clone()
            .unwrap_or_else(|| fingerprint(&execution.diagnosis.diagnosis))
    }

    fn template_commands(&self, execution: &Execution) -> Vec<String> {
        execution
            .commands_executed
            .iter()
            .map(|c| templatize_command(c, &execution.path))
            .collect()
    }

    fn new_pattern(
        &self,
        diagnosis: &CausalDiagnosis,
        commands: Vec<String>,
        description: String,
    ) -> HealingPattern {
        HealingPattern {
            id: fingerprint(diagnosis),
            diagnosis_type: diagnosis.diagnosis_type,
            error_type: diagnosis.error_type.clone(),
            culprit: diagnosis
                .culprit
                .clone()
                .unwrap_or_else(|| ANY_CULPRIT.to_string()),
            error_pattern: diagnosis.error_message.as_deref().map(error_pattern_for),
            commands,
            description,
            success_count: 0,
            failure_count: 0,
            confidence: 0.0,
            auto_approve: false,
            verified: false,
            created_at: self.clock.now(),
            last_used_at: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }
}

impl std::fmt::Debug for PatternStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternStore").finish_non_exhaustive()
    }
}
