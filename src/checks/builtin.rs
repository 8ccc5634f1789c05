//! Default check implementations, built on remote commands and HTTP.
//!
//! Staleness checks treat a missing or unparseable timestamp as its own
//! signal: `WARNING`, score 50, `details.age = "unknown"`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::json;
use std::sync::Arc;

use super::{Check, CheckContext, CheckRegistry};
use crate::clock::Clock;
use crate::diagnosis::signals::{
    checksum_mismatches, host_arg, log_tail_command, parse_log_line, LogSeverity,
};
use crate::errors::Result;
use crate::model::{CheckResult, CheckStatus, CheckType};
use crate::observability::telemetry::redact_secrets;
use crate::remote::{
    assess_response, remote_path_expr, shell_quote, site_url, CommandOutput, HttpProber,
    RemoteExecutor, WpCli,
};

/// Score used whenever the age of something cannot be determined.
pub const UNKNOWN_AGE_SCORE: u8 = 50;

async fn run(executor: &dyn RemoteExecutor, ctx: &CheckContext, command: &str) -> Result<CommandOutput> {
    Ok(executor.exec(&ctx.remote_handle, command, ctx.timeout).await?)
}

fn unknown_age(check_type: CheckType, priority: crate::model::CheckPriority, what: &str) -> CheckResult {
    CheckResult::new(
        check_type,
        priority,
        CheckStatus::Warning,
        UNKNOWN_AGE_SCORE,
        format!("Could not determine {}", what),
    )
    .with_details(json!({ "age": "unknown" }))
}

/// Register every built-in check.
pub fn register_builtin_checks(
    registry: &mut CheckRegistry,
    executor: Arc<dyn RemoteExecutor>,
    prober: Arc<dyn HttpProber>,
    wp: WpCli,
    backup_dir: &str,
    clock: Arc<dyn Clock>,
) {
    registry.register(Arc::new(HttpAvailabilityCheck { prober }));
    registry.register(Arc::new(DatabaseConnectionCheck {
        executor: executor.clone(),
        wp: wp.clone(),
    }));
    registry.register(Arc::new(CoreIntegrityCheck {
        executor: executor.clone(),
        wp: wp.clone(),
    }));
    registry.register(Arc::new(ErrorLogCheck {
        executor: executor.clone(),
    }));
    registry.register(Arc::new(DiskSpaceCheck {
        executor: executor.clone(),
    }));
    registry.register(Arc::new(PluginUpdatesCheck {
        executor: executor.clone(),
        wp: wp.clone(),
    }));
    registry.register(Arc::new(BackupFreshnessCheck {
        executor: executor.clone(),
        backup_dir: backup_dir.to_string(),
        clock: clock.clone(),
    }));
    registry.register(Arc::new(SslCertificateCheck {
        executor: executor.clone(),
        clock,
    }));
    registry.register(Arc::new(CoreUpdatesCheck { executor, wp }));
}

pub struct HttpAvailabilityCheck {
    prober: Arc<dyn HttpProber>,
}

#[async_trait::async_trait]
impl Check for HttpAvailabilityCheck {
    fn check_type(&self) -> CheckType {
        CheckType::HttpAvailability
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let url = site_url(&ctx.domain);
        let response = match self.prober.fetch(&url, ctx.timeout).await {
            Ok(r) => r,
            Err(e) => {
                return Ok(CheckResult::new(
                    self.check_type(),
                    self.priority(),
                    CheckStatus::Fail,
                    0,
                    format!("Site unreachable: {}", e),
                )
                .with_recommendation("Check web server and DNS for the site"));
            }
        };

        let assessment = assess_response(&response);
        let details = serde_json::to_value(&assessment).unwrap_or_default();
        let result = if assessment.is_healthy() {
            if assessment.elapsed_ms > 3000 {
                CheckResult::new(
                    self.check_type(),
                    self.priority(),
                    CheckStatus::Warning,
                    70,
                    format!("Site slow to respond ({}ms)", assessment.elapsed_ms),
                )
                .with_recommendation("Investigate page caching and slow queries")
            } else {
                CheckResult::pass(self.check_type(), self.priority(), assessment.summary())
            }
        } else {
            let mut failed = CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Fail,
                0,
                format!("Site unhealthy: {}", assessment.summary()),
            );
            if assessment.has_markers() || assessment.blank_page {
                failed = failed.with_recommendation("Inspect the PHP error log for the fatal error");
            }
            failed
        };
        Ok(result.with_details(details))
    }
}

pub struct DatabaseConnectionCheck {
    executor: Arc<dyn RemoteExecutor>,
    wp: WpCli,
}

#[async_trait::async_trait]
impl Check for DatabaseConnectionCheck {
    fn check_type(&self) -> CheckType {
        CheckType::DatabaseConnection
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let out = run(
            self.executor.as_ref(),
            ctx,
            &self.wp.command(&ctx.path, "db query 'SELECT 1'"),
        )
        .await?;
        if out.success() {
            return Ok(CheckResult::pass(
                self.check_type(),
                self.priority(),
                "Database reachable",
            ));
        }
        Ok(CheckResult::new(
            self.check_type(),
            self.priority(),
            CheckStatus::Fail,
            0,
            format!(
                "Database query failed: {}",
                redact_secrets(out.stderr.trim())
            ),
        )
        .with_recommendation("Verify DB credentials in wp-config.php and the database server"))
    }
}

pub struct CoreIntegrityCheck {
    executor: Arc<dyn RemoteExecutor>,
    wp: WpCli,
}

#[async_trait::async_trait]
impl Check for CoreIntegrityCheck {
    fn check_type(&self) -> CheckType {
        CheckType::CoreIntegrity
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let out = run(
            self.executor.as_ref(),
            ctx,
            &self.wp.command(&ctx.path, "core verify-checksums"),
        )
        .await?;
        if out.success() {
            return Ok(CheckResult::pass(
                self.check_type(),
                self.priority(),
                "Core files verify against checksums",
            ));
        }

        let files = checksum_mismatches(&format!("{}\n{}", out.stdout, out.stderr));
        if files.is_empty() {
            return Ok(CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                70,
                "Checksum verification reported problems without modified files",
            )
            .with_details(json!({ "output": redact_secrets(out.stderr.trim()) })));
        }

        Ok(CheckResult::new(
            self.check_type(),
            self.priority(),
            CheckStatus::Fail,
            0,
            format!("{} core file(s) modified", files.len()),
        )
        .with_details(json!({ "files": files.iter().take(20).collect::<Vec<_>>() }))
        .with_recommendation("Reinstall core files with `wp core download --skip-content --force`"))
    }
}

pub struct ErrorLogCheck {
    executor: Arc<dyn RemoteExecutor>,
}

#[async_trait::async_trait]
impl Check for ErrorLogCheck {
    fn check_type(&self) -> CheckType {
        CheckType::ErrorLog
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let out = run(
            self.executor.as_ref(),
            ctx,
            &log_tail_command(&ctx.path, ctx.log_depth),
        )
        .await?;

        let (mut fatals, mut warnings) = (0usize, 0usize);
        let mut samples = Vec::new();
        for line in out.stdout.lines().filter_map(parse_log_line) {
            match line.severity {
                LogSeverity::Fatal => {
                    fatals += 1;
                    if samples.len() < 5 {
                        samples.push(redact_secrets(&line.text));
                    }
                }
                LogSeverity::Warning => warnings += 1,
                _ => {}
            }
        }

        let details = json!({ "fatal": fatals, "warnings": warnings, "samples": samples });
        let result = match (fatals, warnings) {
            (0, 0) => CheckResult::pass(self.check_type(), self.priority(), "No recent errors logged"),
            (0, w) => CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                75,
                format!("{} PHP warning(s) logged", w),
            ),
            (f, _) => CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Fail,
                if f > 5 { 10 } else { 40 },
                format!("{} fatal error(s) logged", f),
            )
            .with_recommendation("Review the fatal errors in wp-content/debug.log"),
        };
        Ok(result.with_details(details))
    }
}

pub struct DiskSpaceCheck {
    executor: Arc<dyn RemoteExecutor>,
}

/// Use% column of the last `df -P` line.
pub fn parse_df_usage(output: &str) -> Option<u8> {
    output
        .lines()
        .last()?
        .split_whitespace()
        .find(|col| col.ends_with('%'))?
        .trim_end_matches('%')
        .parse()
        .ok()
}

#[async_trait::async_trait]
impl Check for DiskSpaceCheck {
    fn check_type(&self) -> CheckType {
        CheckType::DiskSpace
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let out = run(
            self.executor.as_ref(),
            ctx,
            &format!("df -P {}", shell_quote(&ctx.path)),
        )
        .await?;
        let Some(used) = parse_df_usage(&out.stdout).filter(|_| out.success()) else {
            return Ok(CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                UNKNOWN_AGE_SCORE,
                "Could not determine disk usage",
            )
            .with_details(json!({ "usage": "unknown" })));
        };

        let details = json!({ "used_percent": used });
        let result = if used >= 95 {
            CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Fail,
                10,
                format!("Disk {}% full", used),
            )
            .with_recommendation("Free disk space: rotate logs and prune old backups")
        } else if used >= 85 {
            CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                60,
                format!("Disk {}% full", used),
            )
        } else {
            CheckResult::pass(self.check_type(), self.priority(), format!("Disk {}% full", used))
        };
        Ok(result.with_details(details))
    }
}

fn parse_count(out: &CommandOutput) -> Option<u32> {
    if !out.success() {
        return None;
    }
    out.stdout_trimmed().lines().last()?.trim().parse().ok()
}

pub struct PluginUpdatesCheck {
    executor: Arc<dyn RemoteExecutor>,
    wp: WpCli,
}

#[async_trait::async_trait]
impl Check for PluginUpdatesCheck {
    fn check_type(&self) -> CheckType {
        CheckType::PluginUpdates
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let out = run(
            self.executor.as_ref(),
            ctx,
            &self
                .wp
                .command(&ctx.path, "plugin list --update=available --format=count"),
        )
        .await?;
        let Some(pending) = parse_count(&out) else {
            return Ok(CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                UNKNOWN_AGE_SCORE,
                "Could not list plugin updates",
            ));
        };
        let details = json!({ "pending": pending });
        let result = match pending {
            0 => CheckResult::pass(self.check_type(), self.priority(), "All plugins up to date"),
            1..=3 => CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                80,
                format!("{} plugin update(s) available", pending),
            ),
            _ => CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                60,
                format!("{} plugin update(s) available", pending),
            )
            .with_recommendation("Schedule plugin updates after a backup"),
        };
        Ok(result.with_details(details))
    }
}

pub struct BackupFreshnessCheck {
    executor: Arc<dyn RemoteExecutor>,
    backup_dir: String,
    clock: Arc<dyn Clock>,
}

#[async_trait::async_trait]
impl Check for BackupFreshnessCheck {
    fn check_type(&self) -> CheckType {
        CheckType::BackupFreshness
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -printf '%T@\\n' 2>/dev/null | sort -n | tail -1",
            remote_path_expr(&self.backup_dir)
        );
        let out = run(self.executor.as_ref(), ctx, &command).await?;

        let newest = out
            .stdout_trimmed()
            .split('.')
            .next()
            .and_then(|secs| secs.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        let Some(newest) = newest else {
            return Ok(unknown_age(self.check_type(), self.priority(), "last backup age")
                .with_recommendation("Verify that backups are being created"));
        };

        let age_days = (self.clock.now() - newest).num_hours() as f64 / 24.0;
        let details = json!({ "age_days": age_days, "last_backup": newest.to_rfc3339() });
        let result = if age_days <= 1.0 {
            CheckResult::pass(self.check_type(), self.priority(), "Recent backup available")
        } else if age_days <= 7.0 {
            CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                70,
                format!("Last backup {:.1} days old", age_days),
            )
        } else {
            CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Fail,
                30,
                format!("Last backup {:.1} days old", age_days),
            )
            .with_recommendation("Take a fresh backup")
        };
        Ok(result.with_details(details))
    }
}

pub struct SslCertificateCheck {
    executor: Arc<dyn RemoteExecutor>,
    clock: Arc<dyn Clock>,
}

/// Parse openssl's `notAfter=Mar  1 12:00:00 2027 GMT`.
pub fn parse_not_after(output: &str) -> Option<DateTime<Utc>> {
    let value = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("notAfter="))?;
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait::async_trait]
impl Check for SslCertificateCheck {
    fn check_type(&self) -> CheckType {
        CheckType::SslCertificate
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let host = host_arg(&ctx.domain);
        let command = format!(
            "echo | openssl s_client -servername {host} -connect {host}:443 2>/dev/null | openssl x509 -noout -enddate",
            host = host
        );
        let out = run(self.executor.as_ref(), ctx, &command).await?;
        let Some(expires) = parse_not_after(&out.stdout) else {
            return Ok(unknown_age(self.check_type(), self.priority(), "certificate expiry"));
        };

        let days_left = (expires - self.clock.now()).num_days();
        let details = json!({ "expires_at": expires.to_rfc3339(), "days_left": days_left });
        let result = if days_left < 0 {
            CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Fail,
                0,
                "Certificate expired",
            )
            .with_recommendation("Renew the TLS certificate")
        } else if days_left < 7 {
            CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Fail,
                20,
                format!("Certificate expires in {} day(s)", days_left),
            )
            .with_recommendation("Renew the TLS certificate")
        } else if days_left < 30 {
            CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                70,
                format!("Certificate expires in {} days", days_left),
            )
        } else {
            CheckResult::pass(
                self.check_type(),
                self.priority(),
                format!("Certificate valid for {} days", days_left),
            )
        };
        Ok(result.with_details(details))
    }
}

pub struct CoreUpdatesCheck {
    executor: Arc<dyn RemoteExecutor>,
    wp: WpCli,
}

#[async_trait::async_trait]
impl Check for CoreUpdatesCheck {
    fn check_type(&self) -> CheckType {
        CheckType::CoreUpdates
    }

    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let out = run(
            self.executor.as_ref(),
            ctx,
            &self.wp.command(&ctx.path, "core check-update --format=count"),
        )
        .await?;
        let result = match parse_count(&out) {
            Some(0) => CheckResult::pass(self.check_type(), self.priority(), "WordPress core up to date"),
            Some(n) => CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                70,
                format!("{} core update(s) available", n),
            )
            .with_recommendation("Update WordPress core after a backup"),
            None => CheckResult::new(
                self.check_type(),
                self.priority(),
                CheckStatus::Warning,
                UNKNOWN_AGE_SCORE,
                "Could not check for core updates",
            ),
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::CheckPriority;
    use crate::testing::{MockExecutor, MockProber};
    use chrono::TimeZone;
    use std::time::Duration;

    fn ctx() -> CheckContext {
        CheckContext {
            target_id: "site".into(),
            remote_handle: "site".into(),
            path: "/var/www/site".into(),
            domain: "example.com".into(),
            log_depth: 100,
            timeout: Duration::from_secs(5),
        }
    }

    fn clock_at(y: i32, m: u32, d: u32) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()))
    }

    #[test]
    fn test_parse_df_usage() {
        let out = "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 100 91 9 91% /";
        assert_eq!(parse_df_usage(out), Some(91));
        assert_eq!(parse_df_usage("garbage"), None);
    }

    #[test]
    fn test_parse_not_after() {
        let parsed = parse_not_after("notAfter=Mar  1 12:00:00 2027 GMT\n").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2027, 3, 1, 12, 0, 0).unwrap());
        assert!(parse_not_after("unable to load certificate").is_none());
    }

    #[tokio::test]
    async fn test_http_check_flags_fatal_error_page() {
        let prober = Arc::new(MockProber::new().respond(
            "example.com",
            200,
            &format!("<html><body>{}<b>Fatal error</b>: boom</body></html>", "x".repeat(600)),
        ));
        let check = HttpAvailabilityCheck { prober };
        let result = check.check(&ctx()).await.unwrap();
        assert_eq!(result.status, CheckStatus::Fail);
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn test_error_log_check_counts_fatals() {
        let executor = Arc::new(MockExecutor::new().on(
            "tail -n",
            "[18-Oct-2026 10:00:00 UTC] PHP Fatal error: x in /w/wp-content/plugins/a/b.php\n\
             [18-Oct-2026 10:00:01 UTC] PHP Warning: y\n",
        ));
        let check = ErrorLogCheck { executor };
        let result = check.check(&ctx()).await.unwrap();
        assert_eq!(result.status, CheckStatus::Fail);
        assert_eq!(result.score, 40);
        assert_eq!(result.details["fatal"], 1);
        assert_eq!(result.details["warnings"], 1);
    }

    #[tokio::test]
    async fn test_backup_freshness_unknown_age_is_warning() {
        let executor = Arc::new(MockExecutor::new().on("find", ""));
        let check = BackupFreshnessCheck {
            executor,
            backup_dir: "~/.wpheal-backups".into(),
            clock: clock_at(2026, 10, 18),
        };
        let result = check.check(&ctx()).await.unwrap();
        assert_eq!(result.status, CheckStatus::Warning);
        assert_eq!(result.score, UNKNOWN_AGE_SCORE);
        assert_eq!(result.details["age"], "unknown");
    }

    #[tokio::test]
    async fn test_backup_freshness_stale() {
        let ten_days_ago = Utc.with_ymd_and_hms(2026, 10, 8, 12, 0, 0).unwrap().timestamp();
        let executor = Arc::new(MockExecutor::new().on("find", &format!("{}.5\n", ten_days_ago)));
        let check = BackupFreshnessCheck {
            executor,
            backup_dir: "/srv/backups".into(),
            clock: clock_at(2026, 10, 18),
        };
        let result = check.check(&ctx()).await.unwrap();
        assert_eq!(result.status, CheckStatus::Fail);
        assert_eq!(result.score, 30);
    }

    #[tokio::test]
    async fn test_ssl_check_expiring_soon() {
        let executor = Arc::new(MockExecutor::new().on("openssl", "notAfter=Oct 21 12:00:00 2026 GMT"));
        let check = SslCertificateCheck {
            executor,
            clock: clock_at(2026, 10, 18),
        };
        let result = check.check(&ctx()).await.unwrap();
        assert_eq!(result.status, CheckStatus::Fail);
        assert_eq!(result.score, 20);
        assert_eq!(result.priority, CheckPriority::Medium);
    }

    #[tokio::test]
    async fn test_database_check_failure_redacts_secrets() {
        let executor = Arc::new(MockExecutor::new().fail_on(
            "db query",
            1,
            "ERROR 1045: Access denied for user 'wp' (using password=hunter2)",
        ));
        let check = DatabaseConnectionCheck {
            executor,
            wp: WpCli::default(),
        };
        let result = check.check(&ctx()).await.unwrap();
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(!result.message.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_remote_error_propagates_as_err() {
        let executor = Arc::new(MockExecutor::new().error_on("df -P", "connection reset"));
        let check = DiskSpaceCheck { executor };
        assert!(check.check(&ctx()).await.is_err());
    }
}
