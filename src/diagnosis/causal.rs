//! Causal diagnosis: one primary failure class from the structural signals.
//!
//! Rules are evaluated in precedence order and the first that fires wins:
//! stuck maintenance, unreachable database, core checksum mismatch, healthy,
//! dominant log error class, and finally unknown.

use crate::model::{CausalDiagnosis, CulpritKind, DiagnosisType};
use crate::remote::{remote_path_expr, shell_quote, WpCli};

use super::signals::{
    tally_errors, DatabaseSignal, IntegritySignal, LogErrorType, MaintenanceSignal,
    StructuralSignals,
};

pub const CONFIDENCE_CERTAIN: f64 = 1.0;
pub const CONFIDENCE_DB_ERROR: f64 = 0.90;
pub const CONFIDENCE_INTEGRITY: f64 = 0.85;
pub const CONFIDENCE_PLUGIN_FAULT: f64 = 0.95;
pub const CONFIDENCE_THEME_FAULT: f64 = 0.90;
pub const CONFIDENCE_MEMORY: f64 = 0.85;
pub const CONFIDENCE_SYNTAX: f64 = 0.90;
pub const CONFIDENCE_DB_CONNECTION: f64 = 0.80;
pub const CONFIDENCE_ACCESS_DENIED: f64 = 0.85;

/// Command templates for every remedy, shared by diagnosis suggestions and
/// remediation dispatch.
#[derive(Debug, Clone)]
pub struct RemedyTemplates {
    pub wp: WpCli,
    pub memory_limit: String,
    pub fallback_themes: Vec<String>,
}

impl RemedyTemplates {
    pub fn deactivate_plugin(&self, path: &str, slug: &str) -> String {
        self.wp
            .command(path, &format!("plugin deactivate {}", shell_quote(slug)))
    }

    pub fn activate_theme(&self, path: &str, slug: &str) -> String {
        self.wp
            .command(path, &format!("theme activate {}", shell_quote(slug)))
    }

    pub fn safe_mode(&self, path: &str) -> String {
        self.wp.command(path, "plugin deactivate --all")
    }

    pub fn clear_maintenance(&self, path: &str) -> String {
        format!(
            "rm -f {}",
            remote_path_expr(&format!("{}/.maintenance", path.trim_end_matches('/')))
        )
    }

    pub fn raise_memory_limit(&self, path: &str) -> String {
        self.wp.command(
            path,
            &format!(
                "config set WP_MEMORY_LIMIT {} --type=constant",
                shell_quote(&self.memory_limit)
            ),
        )
    }

    pub fn reinstall_core(&self, path: &str) -> String {
        self.wp.command(path, "core download --skip-content --force")
    }

    pub fn repair_database(&self, path: &str) -> String {
        self.wp.command(path, "db repair")
    }

    /// First fallback theme that is not the culprit.
    pub fn first_fallback_theme(&self, culprit: Option<&str>) -> Option<&str> {
        self.fallback_themes
            .iter()
            .map(String::as_str)
            .find(|t| Some(*t) != culprit)
    }
}

fn verdict(
    diagnosis_type: DiagnosisType,
    confidence: f64,
    action: &str,
    commands: Vec<String>,
    evidence: Vec<String>,
) -> CausalDiagnosis {
    CausalDiagnosis {
        diagnosis_type,
        confidence,
        culprit: None,
        culprit_kind: None,
        error_type: None,
        error_message: None,
        suggested_action: action.to_string(),
        suggested_commands: commands,
        evidence,
    }
}

/// Derive the primary cause for the site rooted at `path`.
pub fn diagnose_cause(
    signals: &StructuralSignals,
    path: &str,
    templates: &RemedyTemplates,
) -> CausalDiagnosis {
    let mut evidence = Vec::new();
    if let Some(http) = &signals.http {
        evidence.push(format!("http: {}", http.summary()));
    }
    if let Some(err) = &signals.http_error {
        evidence.push(format!("http probe failed: {}", err));
    }

    if signals.maintenance.is_stuck() {
        if let MaintenanceSignal::Present { age_secs: Some(age) } = signals.maintenance {
            evidence.push(format!(".maintenance present for {}s", age));
        }
        return verdict(
            DiagnosisType::Maintenance,
            CONFIDENCE_CERTAIN,
            "Remove the stuck maintenance lock file",
            vec![templates.clear_maintenance(path)],
            evidence,
        );
    }

    if let DatabaseSignal::Unreachable { reason } = &signals.database {
        evidence.push(format!("database unreachable: {}", reason));
        return verdict(
            DiagnosisType::DbError,
            CONFIDENCE_DB_ERROR,
            "Check the database server and credentials, then repair tables",
            vec![templates.repair_database(path)],
            evidence,
        );
    }

    if let IntegritySignal::Mismatch { files } = &signals.integrity {
        evidence.push(format!(
            "{} core file(s) fail checksum: {}",
            files.len(),
            files.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
        ));
        return verdict(
            DiagnosisType::Integrity,
            CONFIDENCE_INTEGRITY,
            "Reinstall WordPress core files",
            vec![templates.reinstall_core(path)],
            evidence,
        );
    }

    if signals.is_clean() && signals.http_healthy() {
        return verdict(
            DiagnosisType::Healthy,
            CONFIDENCE_CERTAIN,
            "No action needed",
            Vec::new(),
            evidence,
        );
    }

    if let Some(tally) = tally_errors(&signals.log_errors) {
        evidence.push(format!(
            "{} x {} in error log",
            tally.count,
            tally.error_type.as_str()
        ));
        let culprit = tally.culprit.clone();
        let slug = culprit.as_ref().map(|(_, s)| s.as_str());

        let (diagnosis_type, confidence, action, commands) = match tally.error_type {
            LogErrorType::PluginFault => (
                DiagnosisType::PluginFault,
                CONFIDENCE_PLUGIN_FAULT,
                format!("Deactivate plugin '{}'", slug.unwrap_or("unknown")),
                slug.map(|s| vec![templates.deactivate_plugin(path, s)])
                    .unwrap_or_default(),
            ),
            LogErrorType::ThemeFault => (
                DiagnosisType::ThemeFault,
                CONFIDENCE_THEME_FAULT,
                "Switch to a default fallback theme".to_string(),
                templates
                    .first_fallback_theme(slug)
                    .map(|t| vec![templates.activate_theme(path, t)])
                    .unwrap_or_default(),
            ),
            LogErrorType::MemoryExhaustion => (
                DiagnosisType::MemoryExhaustion,
                CONFIDENCE_MEMORY,
                format!("Raise WP_MEMORY_LIMIT to {}", templates.memory_limit),
                vec![templates.raise_memory_limit(path)],
            ),
            LogErrorType::SyntaxError => (
                DiagnosisType::SyntaxError,
                CONFIDENCE_SYNTAX,
                match &culprit {
                    Some((CulpritKind::Plugin, s)) => format!("Deactivate plugin '{}' with the syntax error", s),
                    Some((CulpritKind::Theme, s)) => format!("Switch away from theme '{}' with the syntax error", s),
                    None => "Enter safe mode by deactivating all plugins".to_string(),
                },
                match &culprit {
                    Some((CulpritKind::Plugin, s)) => vec![templates.deactivate_plugin(path, s)],
                    Some((CulpritKind::Theme, s)) => templates
                        .first_fallback_theme(Some(s))
                        .map(|t| vec![templates.activate_theme(path, t)])
                        .unwrap_or_default(),
                    None => vec![templates.safe_mode(path)],
                },
            ),
            LogErrorType::DbConnection => (
                DiagnosisType::DbConnection,
                CONFIDENCE_DB_CONNECTION,
                "Check database connectivity and repair tables".to_string(),
                vec![templates.repair_database(path)],
            ),
            LogErrorType::AccessDenied => (
                DiagnosisType::AccessDenied,
                CONFIDENCE_ACCESS_DENIED,
                "Database credentials rejected; fix wp-config.php manually".to_string(),
                Vec::new(),
            ),
        };

        return CausalDiagnosis {
            diagnosis_type,
            confidence,
            culprit: culprit.as_ref().map(|(_, s)| s.clone()),
            culprit_kind: culprit.as_ref().map(|(k, _)| *k),
            error_type: Some(tally.error_type.as_str().to_string()),
            error_message: Some(tally.first.message.clone()),
            suggested_action: action,
            suggested_commands: commands,
            evidence,
        };
    }

    CausalDiagnosis::unknown(evidence)
}
