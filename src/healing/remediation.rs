//! Remediation dispatch: turn an approved execution into remote commands.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::safety::validate_batch;
use crate::clock::Clock;
use crate::diagnosis::RemedyTemplates;
use crate::errors::HealingError;
use crate::model::{CulpritKind, DiagnosisType, Execution, LogLevel, Target};
use crate::observability::telemetry::{redact_secrets, track_remote_command};
use crate::remote::{shell_quote, RemoteExecutor};

/// What the job will do, decided before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationPlan {
    /// Caller-supplied commands; replaces the default dispatch
    Custom { commands: Vec<String> },
    /// Auto-approved learned pattern
    Learned {
        pattern_id: String,
        commands: Vec<String>,
    },
    DeactivatePlugin { slug: String },
    SwitchTheme { culprit: Option<String> },
    SafeMode,
    ClearMaintenance,
    RaiseMemoryLimit,
    ReinstallCore,
    RepairDatabase,
}

impl RemediationPlan {
    /// Pick the plan for an execution.
    pub fn for_execution(execution: &Execution) -> Result<Self, HealingError> {
        if let Some(commands) = execution.custom_commands.as_ref().filter(|c| !c.is_empty()) {
            return Ok(Self::Custom {
                commands: commands.clone(),
            });
        }
        if let Some(suggestion) = execution
            .learned_suggestion
            .as_ref()
            .filter(|s| s.auto_approve && !s.commands.is_empty())
        {
            return Ok(Self::Learned {
                pattern_id: suggestion.pattern_id.clone(),
                commands: suggestion.commands.clone(),
            });
        }

        let diagnosis = &execution.diagnosis.diagnosis;
        let culprit = diagnosis.culprit.clone();
        let plan = match diagnosis.diagnosis_type {
            DiagnosisType::PluginFault => match culprit {
                Some(slug) => Self::DeactivatePlugin { slug },
                None => Self::SafeMode,
            },
            DiagnosisType::ThemeFault => Self::SwitchTheme { culprit },
            DiagnosisType::SyntaxError => match (diagnosis.culprit_kind, culprit) {
                (Some(CulpritKind::Plugin), Some(slug)) => Self::DeactivatePlugin { slug },
                (Some(CulpritKind::Theme), culprit) => Self::SwitchTheme { culprit },
                _ => Self::SafeMode,
            },
            DiagnosisType::MemoryExhaustion => Self::RaiseMemoryLimit,
            DiagnosisType::Maintenance => Self::ClearMaintenance,
            DiagnosisType::Integrity => Self::ReinstallCore,
            DiagnosisType::DbError | DiagnosisType::DbConnection => Self::RepairDatabase,
            DiagnosisType::AccessDenied => {
                return Err(HealingError::ManualInterventionRequired(
                    "access denied errors need credential or permission fixes".to_string(),
                ))
            }
            DiagnosisType::Unknown => Self::SafeMode,
            DiagnosisType::Healthy => {
                return Err(HealingError::NotActionable("site is healthy".to_string()))
            }
        };
        Ok(plan)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Custom { commands } => format!("custom commands ({})", commands.len()),
            Self::Learned { pattern_id, .. } => format!("learned pattern {}", pattern_id),
            Self::DeactivatePlugin { slug } => format!("deactivate plugin {}", slug),
            Self::SwitchTheme { culprit: Some(c) } => format!("switch away from theme {}", c),
            Self::SwitchTheme { culprit: None } => "switch to a fallback theme".to_string(),
            Self::SafeMode => "safe mode (deactivate all plugins)".to_string(),
            Self::ClearMaintenance => "remove stuck maintenance lock".to_string(),
            Self::RaiseMemoryLimit => "raise WP_MEMORY_LIMIT".to_string(),
            Self::ReinstallCore => "reinstall core files".to_string(),
            Self::RepairDatabase => "repair database tables".to_string(),
        }
    }

    pub fn is_manual_override(&self) -> bool {
        matches!(self, Self::Custom { .. })
    }
}

/// Reject a plan that would touch a blacklisted plugin or theme.
///
/// Learned commands were recorded before the current blacklists, so their
/// `wp plugin` and `wp theme` invocations are re-read against them.
pub fn check_blacklists(plan: &RemediationPlan, target: &Target) -> Result<(), HealingError> {
    let hit = match plan {
        RemediationPlan::DeactivatePlugin { slug }
            if target.healing.plugin_blacklist.contains(slug) =>
        {
            Some(("plugin", slug.clone()))
        }
        RemediationPlan::Learned { commands, .. } => commands
            .iter()
            .find_map(|cmd| blacklisted_in_command(cmd, target)),
        _ => None,
    };
    match hit {
        Some((kind, name)) => {
            warn!(target_id = %target.id, kind, name = %name, plan = %plan.describe(), "Refusing remediation on blacklisted {}", kind);
            Err(HealingError::Blacklisted {
                kind: kind.to_string(),
                name,
            })
        }
        None => Ok(()),
    }
}

/// First blacklisted plugin or theme a wp-cli command would act on.
fn blacklisted_in_command(command: &str, target: &Target) -> Option<(&'static str, String)> {
    let tokens = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
    let healing = &target.healing;

    for (i, pair) in tokens.windows(2).enumerate() {
        let rest = &tokens[i + 2..];
        let names: Vec<&str> = rest
            .iter()
            .map(String::as_str)
            .filter(|t| !t.starts_with('-'))
            .collect();
        let (kind, blacklist) = match (pair[0].as_str(), pair[1].as_str()) {
            ("plugin", "deactivate" | "delete" | "uninstall") => ("plugin", &healing.plugin_blacklist),
            ("theme", "activate" | "delete") => ("theme", &healing.theme_blacklist),
            _ => continue,
        };
        if let Some(name) = blacklist.iter().find(|b| names.contains(&b.as_str())) {
            return Some((kind, name.clone()));
        }
        if kind == "plugin" && rest.iter().any(|t| t == "--all") {
            // `--all` spares only what `--exclude` lists.
            let excluded: Vec<&str> = rest
                .iter()
                .filter_map(|t| t.strip_prefix("--exclude="))
                .flat_map(|list| list.split(','))
                .collect();
            if let Some(name) = blacklist.iter().find(|b| !excluded.contains(&b.as_str())) {
                return Some((kind, name.clone()));
            }
        }
    }
    None
}

/// Runs remediation plans against a target.
pub struct Remediator {
    executor: Arc<dyn RemoteExecutor>,
    templates: RemedyTemplates,
    command_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl Remediator {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        templates: RemedyTemplates,
        command_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            templates,
            command_timeout,
            clock,
        }
    }

    pub fn templates(&self) -> &RemedyTemplates {
        &self.templates
    }

    /// Execute `plan`, recording every command and outcome on `execution`.
    pub async fn remediate(
        &self,
        target: &Target,
        execution: &mut Execution,
        plan: &RemediationPlan,
    ) -> Result<(), HealingError> {
        check_blacklists(plan, target)?;
        let path = execution.path.clone();
        execution.action_taken = Some(plan.describe());
        if let RemediationPlan::Learned { pattern_id, .. } = plan {
            execution.applied_pattern_id = Some(pattern_id.clone());
        }

        match plan {
            RemediationPlan::Custom { commands } | RemediationPlan::Learned { commands, .. } => {
                validate_batch(commands)?;
                self.run_all(target, execution, commands).await
            }
            RemediationPlan::DeactivatePlugin { slug } => {
                let cmd = self.templates.deactivate_plugin(&path, slug);
                self.run(target, execution, &cmd).await
            }
            RemediationPlan::SwitchTheme { culprit } => {
                self.switch_theme(target, execution, culprit.as_deref()).await
            }
            RemediationPlan::SafeMode => {
                let cmd = self.safe_mode_command(target, &path);
                self.run(target, execution, &cmd).await
            }
            RemediationPlan::ClearMaintenance => {
                let cmd = self.templates.clear_maintenance(&path);
                self.run(target, execution, &cmd).await
            }
            RemediationPlan::RaiseMemoryLimit => {
                let cmd = self.templates.raise_memory_limit(&path);
                self.run(target, execution, &cmd).await
            }
            RemediationPlan::ReinstallCore => {
                let cmd = self.templates.reinstall_core(&path);
                self.run(target, execution, &cmd).await
            }
            RemediationPlan::RepairDatabase => {
                let cmd = self.templates.repair_database(&path);
                self.run(target, execution, &cmd).await
            }
        }
    }

    /// Deactivate all plugins except the blacklisted ones.
    fn safe_mode_command(&self, target: &Target, path: &str) -> String {
        if target.healing.plugin_blacklist.is_empty() {
            return self.templates.safe_mode(path);
        }
        let exclude = target.healing.plugin_blacklist.join(",");
        self.templates.wp.command(
            path,
            &format!("plugin deactivate --all --exclude={}", shell_quote(&exclude)),
        )
    }

    /// Try each eligible fallback theme in order until one activates.
    async fn switch_theme(
        &self,
        target: &Target,
        execution: &mut Execution,
        culprit: Option<&str>,
    ) -> Result<(), HealingError> {
        let candidates: Vec<String> = self
            .templates
            .fallback_themes
            .iter()
            .filter(|t| Some(t.as_str()) != culprit)
            .filter(|t| !target.healing.theme_blacklist.contains(t))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(HealingError::AllFallbacksFailed(
                "no eligible fallback theme configured".to_string(),
            ));
        }

        let mut failures = Vec::new();
        for theme in &candidates {
            let cmd = self.templates.activate_theme(&execution.path, theme);
            match self.run(target, execution, &cmd).await {
                Ok(()) => {
                    info!(target_id = %target.id, theme = %theme, "Fallback theme activated");
                    execution.action_taken = Some(format!("activated fallback theme {}", theme));
                    return Ok(());
                }
                Err(e) => failures.push(format!("{}: {}", theme, e)),
            }
        }
        Err(HealingError::AllFallbacksFailed(failures.join("; ")))
    }

    async fn run_all(
        &self,
        target: &Target,
        execution: &mut Execution,
        commands: &[String],
    ) -> Result<(), HealingError> {
        for cmd in commands {
            self.run(target, execution, cmd).await?;
        }
        Ok(())
    }

    async fn run(
        &self,
        target: &Target,
        execution: &mut Execution,
        command: &str,
    ) -> Result<(), HealingError> {
        let executor = self.executor.clone();
        let handle = target.remote_handle.clone();
        let timeout = self.command_timeout;
        let outcome = track_remote_command(&target.id, "remediation", || async move {
            executor
                .exec(&handle, command, timeout)
                .await
                .and_then(|out| out.into_result())
        })
        .await;

        let now = self.clock.now();
        match outcome {
            Ok(output) => {
                execution.commands_executed.push(command.to_string());
                let mut message = format!("ran: {}", redact_secrets(command));
                let stdout = output.stdout_trimmed();
                if !stdout.is_empty() {
                    message.push_str(&format!(" -> {}", redact_secrets(stdout)));
                }
                execution.push_log(now, LogLevel::Info, message);
                Ok(())
            }
            Err(e) => {
                let reason = redact_secrets(&e.to_string());
                execution.push_log(
                    now,
                    LogLevel::Error,
                    format!("failed: {} ({})", redact_secrets(command), reason),
                );
                Err(HealingError::Remediation(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{
        CausalDiagnosis, DiagnosisProfile, DiagnosisRecord, HealingConfig, PatternSuggestion,
        TriggerSource,
    };
    use crate::remote::WpCli;
    use crate::testing::MockExecutor;
    use chrono::Utc;

    fn templates() -> RemedyTemplates {
        RemedyTemplates {
            wp: WpCli::default(),
            memory_limit: "256M".into(),
            fallback_themes: vec!["twentytwentyfour".into(), "twentytwentythree".into()],
        }
    }

    fn execution(diagnosis_type: DiagnosisType, culprit: Option<(&str, CulpritKind)>) -> Execution {
        let target = Target::new("site", "example.com", "/var/www/site");
        let diagnosis = CausalDiagnosis {
            diagnosis_type,
            confidence: 0.9,
            culprit: culprit.map(|(c, _)| c.to_string()),
            culprit_kind: culprit.map(|(_, k)| k),
            ..CausalDiagnosis::unknown(Vec::new())
        };
        let record = DiagnosisRecord {
            id: "diag".into(),
            target_id: "site".into(),
            path: "/var/www/site".into(),
            domain: "example.com".into(),
            profile: DiagnosisProfile::Full,
            checks_run: Vec::new(),
            health_score: 10,
            issues_count: 1,
            critical_count: 1,
            warning_count: 0,
            diagnosis,
            results: Vec::new(),
            recommendations: Vec::new(),
            duration_ms: 1,
            from_cache: false,
            created_at: Utc::now(),
        };
        Execution::diagnosed(&target, record, None, TriggerSource::Manual, Utc::now())
    }

    fn remediator(executor: Arc<MockExecutor>) -> Remediator {
        Remediator::new(
            executor,
            templates(),
            Duration::from_secs(5),
            Arc::new(ManualClock::default()),
        )
    }

    #[test]
    fn test_plan_dispatch() {
        let exec = execution(DiagnosisType::PluginFault, Some(("shop", CulpritKind::Plugin)));
        assert_eq!(
            RemediationPlan::for_execution(&exec).unwrap(),
            RemediationPlan::DeactivatePlugin { slug: "shop".into() }
        );

        let exec = execution(DiagnosisType::SyntaxError, Some(("astra", CulpritKind::Theme)));
        assert_eq!(
            RemediationPlan::for_execution(&exec).unwrap(),
            RemediationPlan::SwitchTheme {
                culprit: Some("astra".into())
            }
        );

        let exec = execution(DiagnosisType::Unknown, None);
        assert_eq!(RemediationPlan::for_execution(&exec).unwrap(), RemediationPlan::SafeMode);

        let exec = execution(DiagnosisType::AccessDenied, None);
        assert!(matches!(
            RemediationPlan::for_execution(&exec),
            Err(HealingError::ManualInterventionRequired(_))
        ));
    }

    #[test]
    fn test_custom_and_learned_plans_take_precedence() {
        let mut exec = execution(DiagnosisType::PluginFault, Some(("shop", CulpritKind::Plugin)));
        exec.learned_suggestion = Some(PatternSuggestion {
            pattern_id: "pat_1".into(),
            commands: vec!["wp plugin deactivate shop".into()],
            confidence: 1.0,
            match_score: 1.2,
            auto_approve: true,
            reasoning: String::new(),
        });
        assert!(matches!(
            RemediationPlan::for_execution(&exec).unwrap(),
            RemediationPlan::Learned { .. }
        ));

        exec.custom_commands = Some(vec!["wp cache flush".into()]);
        assert!(RemediationPlan::for_execution(&exec).unwrap().is_manual_override());
    }

    #[tokio::test]
    async fn test_deactivates_culprit_plugin() {
        let executor = Arc::new(MockExecutor::new());
        let target = Target::new("site", "example.com", "/var/www/site");
        let mut exec = execution(DiagnosisType::PluginFault, Some(("shop", CulpritKind::Plugin)));
        let plan = RemediationPlan::for_execution(&exec).unwrap();

        remediator(executor.clone())
            .remediate(&target, &mut exec, &plan)
            .await
            .unwrap();
        assert_eq!(exec.commands_executed.len(), 1);
        assert!(executor.ran("plugin deactivate shop"));
    }

    #[tokio::test]
    async fn test_blacklisted_plugin_is_refused() {
        let executor = Arc::new(MockExecutor::new());
        let target = Target::new("site", "example.com", "/var/www/site").with_healing(HealingConfig {
            plugin_blacklist: vec!["shop".into()],
            ..HealingConfig::default()
        });
        let mut exec = execution(DiagnosisType::PluginFault, Some(("shop", CulpritKind::Plugin)));
        let plan = RemediationPlan::for_execution(&exec).unwrap();

        let err = remediator(executor.clone())
            .remediate(&target, &mut exec, &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, HealingError::Blacklisted { .. }));
        assert_eq!(executor.call_count(), 0);
    }

    #[test]
    fn test_learned_commands_checked_against_blacklists() {
        let target = Target::new("site", "example.com", "/var/www/site").with_healing(HealingConfig {
            plugin_blacklist: vec!["woocommerce".into()],
            theme_blacklist: vec!["astra".into()],
            ..HealingConfig::default()
        });
        let learned = |cmd: &str| RemediationPlan::Learned {
            pattern_id: "pat_1".into(),
            commands: vec!["wp cache flush".into(), cmd.to_string()],
        };

        for (cmd, kind, name) in [
            ("wp plugin deactivate woocommerce --path=/var/www/site", "plugin", "woocommerce"),
            ("wp plugin deactivate shop woocommerce", "plugin", "woocommerce"),
            ("wp plugin deactivate --all --path=/var/www/site", "plugin", "woocommerce"),
            ("wp plugin deactivate --all --exclude=akismet", "plugin", "woocommerce"),
            ("wp theme activate astra --path=/var/www/site", "theme", "astra"),
        ] {
            let err = check_blacklists(&learned(cmd), &target).unwrap_err();
            assert!(
                matches!(err, HealingError::Blacklisted { kind: ref k, name: ref n } if k == kind && n == name),
                "{}: {:?}",
                cmd,
                err
            );
        }
        for cmd in [
            "wp plugin deactivate shop --path=/var/www/site",
            "wp plugin deactivate --all --exclude=akismet,woocommerce",
            "wp plugin activate woocommerce",
            "wp theme activate twentytwentyfour",
        ] {
            assert!(check_blacklists(&learned(cmd), &target).is_ok(), "{}", cmd);
        }
    }

    #[tokio::test]
    async fn test_theme_fallback_skips_culprit_and_failures() {
        let executor = Arc::new(MockExecutor::new().fail_on(
            "theme activate twentytwentyfour",
            1,
            "Error: broken theme",
        ));
        let target = Target::new("site", "example.com", "/var/www/site");
        let mut exec = execution(DiagnosisType::ThemeFault, Some(("astra", CulpritKind::Theme)));
        let plan = RemediationPlan::for_execution(&exec).unwrap();

        remediator(executor.clone())
            .remediate(&target, &mut exec, &plan)
            .await
            .unwrap();
        assert!(executor.ran("theme activate twentytwentythree"));
        assert_eq!(exec.commands_executed.len(), 1);
        assert_eq!(
            exec.action_taken.as_deref(),
            Some("activated fallback theme twentytwentythree")
        );
    }

    #[tokio::test]
    async fn test_all_fallbacks_failing() {
        let executor = Arc::new(MockExecutor::new().fail_on("theme activate", 1, "Error: nope"));
        let target = Target::new("site", "example.com", "/var/www/site").with_healing(HealingConfig {
            theme_blacklist: vec!["twentytwentythree".into()],
            ..HealingConfig::default()
        });
        let mut exec = execution(DiagnosisType::ThemeFault, None);
        let plan = RemediationPlan::for_execution(&exec).unwrap();

        let err = remediator(executor.clone())
            .remediate(&target, &mut exec, &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, HealingError::AllFallbacksFailed(_)));
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_safe_mode_keeps_blacklisted_plugins() {
        let executor = Arc::new(MockExecutor::new());
        let target = Target::new("site", "example.com", "/var/www/site").with_healing(HealingConfig {
            plugin_blacklist: vec!["woocommerce".into()],
            ..HealingConfig::default()
        });
        let mut exec = execution(DiagnosisType::Unknown, None);

        remediator(executor.clone())
            .remediate(&target, &mut exec, &RemediationPlan::SafeMode)
            .await
            .unwrap();
        assert!(executor.ran("--exclude=woocommerce"));
    }

    #[tokio::test]
    async fn test_unsafe_custom_batch_runs_nothing() {
        let executor = Arc::new(MockExecutor::new());
        let target = Target::new("site", "example.com", "/var/www/site");
        let mut exec = execution(DiagnosisType::Unknown, None);
        let plan = RemediationPlan::Custom {
            commands: vec!["wp cache flush".into(), "rm -rf /var/www".into()],
        };

        let err = remediator(executor.clone())
            .remediate(&target, &mut exec, &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, HealingError::UnsafeCommand { .. }));
        assert_eq!(executor.call_count(), 0);
    }
}
