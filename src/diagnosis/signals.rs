//! Structural signal collectors feeding causal diagnosis.
//!
//! These are not scored checks. They answer narrow yes/no questions (is
//! the database reachable, do core files verify, what do the logs blame)
//! and every probe failure degrades to an "unavailable" signal.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::CulpritKind;
use crate::observability::telemetry::redact_secrets;
use crate::remote::{
    assess_response, remote_path_expr, shell_quote, site_url, CommandOutput, HttpAssessment,
    HttpProber, RemoteExecutor, WpCli,
};

/// WordPress debug log, relative to the install root.
pub const DEBUG_LOG_RELATIVE: &str = "wp-content/debug.log";

/// A maintenance lock older than this is considered stuck.
pub const MAINTENANCE_STALE_SECS: i64 = 600;

static LOG_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{1,2}-[A-Za-z]{3}-\d{4} \d{2}:\d{2}:\d{2})(?: ([A-Za-z_/+\-0-9]+))?\]\s*(.*)$")
        .expect("invalid regex")
});

static PLUGIN_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"wp-content/plugins/([A-Za-z0-9_.\-]+)/").expect("invalid regex")
});

static THEME_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"wp-content/themes/([A-Za-z0-9_.\-]+)/").expect("invalid regex")
});

const MEMORY_MARKERS: &[&str] = &["allowed memory size of", "out of memory"];
const ACCESS_DENIED_MARKERS: &[&str] = &["access denied for user"];
const DB_CONNECTION_MARKERS: &[&str] = &[
    "error establishing a database connection",
    "can't connect to mysql",
    "mysqli_real_connect",
    "mysql server has gone away",
    "connection refused",
];
const SYNTAX_MARKERS: &[&str] = &["parse error", "syntax error, unexpected"];
const FATAL_MARKERS: &[&str] = &["fatal error", "uncaught"];

/// Classes of structured log errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogErrorType {
    PluginFault,
    ThemeFault,
    MemoryExhaustion,
    SyntaxError,
    DbConnection,
    AccessDenied,
}

impl LogErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PluginFault => "plugin_fault",
            Self::ThemeFault => "theme_fault",
            Self::MemoryExhaustion => "memory_exhaustion",
            Self::SyntaxError => "syntax_error",
            Self::DbConnection => "db_connection",
            Self::AccessDenied => "access_denied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Fatal,
    Warning,
    Notice,
    Other,
}

/// One debug-log line with its prefix parsed off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub severity: LogSeverity,
    pub text: String,
}

/// A classified error line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogError {
    pub error_type: LogErrorType,
    pub culprit: Option<(CulpritKind, String)>,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Parse one line. Timestamps in any zone but UTC are left unknown.
pub fn parse_log_line(line: &str) -> Option<LogLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (timestamp, text) = match LOG_PREFIX.captures(line) {
        Some(caps) => {
            let zone = caps.get(2).map(|m| m.as_str()).unwrap_or("UTC");
            let ts = if zone.eq_ignore_ascii_case("UTC") {
                NaiveDateTime::parse_from_str(&caps[1], "%d-%b-%Y %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            } else {
                None
            };
            (ts, caps[3].to_string())
        }
        None => (None, line.to_string()),
    };

    let lowered = text.to_lowercase();
    let severity = if contains_any(&lowered, FATAL_MARKERS)
        || contains_any(&lowered, SYNTAX_MARKERS)
        || contains_any(&lowered, DB_CONNECTION_MARKERS)
        || contains_any(&lowered, ACCESS_DENIED_MARKERS)
    {
        LogSeverity::Fatal
    } else if lowered.contains("warning") {
        LogSeverity::Warning
    } else if lowered.contains("notice") || lowered.contains("deprecated") {
        LogSeverity::Notice
    } else {
        LogSeverity::Other
    };

    Some(LogLine {
        timestamp,
        severity,
        text,
    })
}

/// Plugin or theme whose files appear in the text, plugins first.
pub fn culprit_of(text: &str) -> Option<(CulpritKind, String)> {
    if let Some(c) = PLUGIN_PATH.captures(text) {
        return Some((CulpritKind::Plugin, c[1].to_string()));
    }
    THEME_PATH
        .captures(text)
        .map(|c| (CulpritKind::Theme, c[1].to_string()))
}

/// Classify an error text.
pub fn classify_error(text: &str) -> Option<(LogErrorType, Option<(CulpritKind, String)>)> {
    let lowered = text.to_lowercase();
    let culprit = culprit_of(text);

    if contains_any(&lowered, MEMORY_MARKERS) {
        return Some((LogErrorType::MemoryExhaustion, culprit));
    }
    if contains_any(&lowered, ACCESS_DENIED_MARKERS) {
        return Some((LogErrorType::AccessDenied, None));
    }
    if contains_any(&lowered, DB_CONNECTION_MARKERS) {
        return Some((LogErrorType::DbConnection, None));
    }
    if contains_any(&lowered, SYNTAX_MARKERS) {
        return Some((LogErrorType::SyntaxError, culprit));
    }
    if contains_any(&lowered, FATAL_MARKERS) {
        return match culprit {
            Some((CulpritKind::Plugin, slug)) => {
                Some((LogErrorType::PluginFault, Some((CulpritKind::Plugin, slug))))
            }
            Some((CulpritKind::Theme, slug)) => {
                Some((LogErrorType::ThemeFault, Some((CulpritKind::Theme, slug))))
            }
            None => None,
        };
    }
    None
}

/// Classified errors among `lines`, in log order.
pub fn collect_log_errors<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<LogError> {
    lines
        .into_iter()
        .filter_map(parse_log_line)
        .filter(|l| l.severity == LogSeverity::Fatal)
        .filter_map(|l| {
            classify_error(&l.text).map(|(error_type, culprit)| LogError {
                error_type,
                culprit,
                message: l.text,
                timestamp: l.timestamp,
            })
        })
        .collect()
}

/// Drop errors timestamped at or before `since`. Lines without a usable
/// timestamp cannot be dated and are kept.
pub fn recent_log_errors(errors: Vec<LogError>, since: Option<DateTime<Utc>>) -> Vec<LogError> {
    let Some(since) = since else {
        return errors;
    };
    errors
        .into_iter()
        .filter(|e| e.timestamp.map(|t| t > since).unwrap_or(true))
        .collect()
}

/// Winning class of a log tally.
#[derive(Debug, Clone)]
pub struct LogTally {
    pub error_type: LogErrorType,
    pub count: usize,
    /// Most frequent culprit within the class, ties to the first seen
    pub culprit: Option<(CulpritKind, String)>,
    /// First error of the winning class
    pub first: LogError,
}

/// Pick the most frequent error class; ties go to the class seen first.
pub fn tally_errors(errors: &[LogError]) -> Option<LogTally> {
    let mut order: Vec<LogErrorType> = Vec::new();
    let mut counts: HashMap<LogErrorType, usize> = HashMap::new();
    for error in errors {
        let count = counts.entry(error.error_type).or_insert(0);
        if *count == 0 {
            order.push(error.error_type);
        }
        *count += 1;
    }

    let mut winner: Option<(LogErrorType, usize)> = None;
    for error_type in order {
        let count = counts[&error_type];
        if winner.map(|(_, best)| count > best).unwrap_or(true) {
            winner = Some((error_type, count));
        }
    }
    let (error_type, count) = winner?;

    let of_type: Vec<&LogError> = errors.iter().filter(|e| e.error_type == error_type).collect();
    let first = of_type.first().map(|e| (*e).clone())?;

    let mut culprit_order: Vec<&(CulpritKind, String)> = Vec::new();
    let mut culprit_counts: HashMap<&(CulpritKind, String), usize> = HashMap::new();
    for e in &of_type {
        if let Some(c) = e.culprit.as_ref() {
            let n = culprit_counts.entry(c).or_insert(0);
            if *n == 0 {
                culprit_order.push(c);
            }
            *n += 1;
        }
    }
    let mut culprit: Option<(&(CulpritKind, String), usize)> = None;
    for c in culprit_order {
        let n = culprit_counts[c];
        if culprit.map(|(_, best)| n > best).unwrap_or(true) {
            culprit = Some((c, n));
        }
    }

    Some(LogTally {
        error_type,
        count,
        culprit: culprit.map(|(c, _)| c.clone()),
        first,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MaintenanceSignal {
    Absent,
    /// Lock present; age unknown when the host could not stat it
    Present { age_secs: Option<i64> },
    Unavailable,
}

impl MaintenanceSignal {
    pub fn is_stuck(&self) -> bool {
        matches!(self, Self::Present { age_secs: Some(age) } if *age > MAINTENANCE_STALE_SECS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DatabaseSignal {
    Reachable,
    Unreachable { reason: String },
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IntegritySignal {
    Verified,
    Mismatch { files: Vec<String> },
    Unavailable { reason: String },
}

/// Everything causal diagnosis looks at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralSignals {
    pub maintenance: MaintenanceSignal,
    pub database: DatabaseSignal,
    pub integrity: IntegritySignal,
    pub log_errors: Vec<LogError>,
    pub http: Option<HttpAssessment>,
    pub http_error: Option<String>,
}

impl StructuralSignals {
    /// No structural error of any kind.
    pub fn is_clean(&self) -> bool {
        !self.maintenance.is_stuck()
            && !matches!(self.database, DatabaseSignal::Unreachable { .. })
            && !matches!(self.integrity, IntegritySignal::Mismatch { .. })
            && self.log_errors.is_empty()
    }

    pub fn http_healthy(&self) -> bool {
        self.http.as_ref().map(|h| h.is_healthy()).unwrap_or(false)
    }
}

/// Where the signals are collected from.
#[derive(Debug, Clone)]
pub struct SignalTarget<'a> {
    pub remote_handle: &'a str,
    pub path: &'a str,
    pub domain: &'a str,
    pub log_depth: usize,
    /// Timestamped log errors at or before this are ignored
    pub log_since: Option<DateTime<Utc>>,
    pub timeout: Duration,
}

/// Runs the structural probes.
#[derive(Clone)]
pub struct SignalCollector {
    executor: Arc<dyn RemoteExecutor>,
    prober: Arc<dyn HttpProber>,
    wp: WpCli,
}

const CHECKSUM_MISMATCH: &str = "File doesn't verify against checksum";

pub fn log_file_expr(path: &str) -> String {
    remote_path_expr(&format!("{}/{}", path.trim_end_matches('/'), DEBUG_LOG_RELATIVE))
}

pub fn log_tail_command(path: &str, lines: usize) -> String {
    format!("tail -n {} {} 2>/dev/null || true", lines, log_file_expr(path))
}

impl SignalCollector {
    pub fn new(executor: Arc<dyn RemoteExecutor>, prober: Arc<dyn HttpProber>, wp: WpCli) -> Self {
        Self {
            executor,
            prober,
            wp,
        }
    }

    /// Collect every signal concurrently.
    pub async fn collect(&self, target: &SignalTarget<'_>) -> StructuralSignals {
        let (maintenance, database, integrity, log_errors, http) = tokio::join!(
            self.maintenance(target),
            self.database(target),
            self.integrity(target),
            self.log_errors(target),
            self.http(target),
        );
        let (http, http_error) = match http {
            Ok(assessment) => (Some(assessment), None),
            Err(e) => (None, Some(e)),
        };
        StructuralSignals {
            maintenance,
            database,
            integrity,
            log_errors,
            http,
            http_error,
        }
    }

    async fn exec(&self, target: &SignalTarget<'_>, command: &str) -> Result<CommandOutput, String> {
        self.executor
            .exec(target.remote_handle, command, target.timeout)
            .await
            .map_err(|e| redact_secrets(&e.to_string()))
    }

    pub async fn maintenance(&self, target: &SignalTarget<'_>) -> MaintenanceSignal {
        let lock = remote_path_expr(&format!("{}/.maintenance", target.path.trim_end_matches('/')));
        let command = format!(
            "if [ -f {lock} ]; then echo $(( $(date +%s) - $(stat -c %Y {lock}) )); else echo absent; fi",
            lock = lock
        );
        match self.exec(target, &command).await {
            Ok(out) if out.success() => {
                let text = out.stdout_trimmed();
                if text == "absent" {
                    MaintenanceSignal::Absent
                } else {
                    MaintenanceSignal::Present {
                        age_secs: text.parse::<i64>().ok(),
                    }
                }
            }
            Ok(out) => {
                debug!(exit_code = out.exit_code, "Maintenance probe failed");
                MaintenanceSignal::Unavailable
            }
            Err(e) => {
                warn!(error = %e, "Maintenance probe failed");
                MaintenanceSignal::Unavailable
            }
        }
    }

    pub async fn database(&self, target: &SignalTarget<'_>) -> DatabaseSignal {
        let command = self.wp.command(target.path, "db query 'SELECT 1'");
        match self.exec(target, &command).await {
            Ok(out) if out.success() => DatabaseSignal::Reachable,
            Ok(out) => {
                let reason = redact_secrets(format!("{} {}", out.stderr, out.stdout).trim());
                let lowered = reason.to_lowercase();
                if contains_any(&lowered, DB_CONNECTION_MARKERS)
                    || contains_any(&lowered, ACCESS_DENIED_MARKERS)
                    || lowered.contains("unknown database")
                {
                    DatabaseSignal::Unreachable { reason }
                } else {
                    DatabaseSignal::Unavailable { reason }
                }
            }
            Err(reason) => DatabaseSignal::Unavailable { reason },
        }
    }

    pub async fn integrity(&self, target: &SignalTarget<'_>) -> IntegritySignal {
        let command = self.wp.command(target.path, "core verify-checksums");
        match self.exec(target, &command).await {
            Ok(out) if out.success() => IntegritySignal::Verified,
            Ok(out) => {
                let files = checksum_mismatches(&format!("{}\n{}", out.stdout, out.stderr));
                if files.is_empty() {
                    IntegritySignal::Unavailable {
                        reason: redact_secrets(out.stderr.trim()),
                    }
                } else {
                    IntegritySignal::Mismatch { files }
                }
            }
            Err(reason) => IntegritySignal::Unavailable { reason },
        }
    }

    pub async fn log_errors(&self, target: &SignalTarget<'_>) -> Vec<LogError> {
        match self
            .exec(target, &log_tail_command(target.path, target.log_depth))
            .await
        {
            Ok(out) => recent_log_errors(collect_log_errors(out.stdout.lines()), target.log_since),
            Err(e) => {
                warn!(error = %e, "Log probe failed");
                Vec::new()
            }
        }
    }

    pub async fn http(&self, target: &SignalTarget<'_>) -> Result<HttpAssessment, String> {
        self.prober
            .fetch(&site_url(target.domain), target.timeout)
            .await
            .map(|resp| assess_response(&resp))
            .map_err(|e| e.to_string())
    }
}

/// Files reported by `wp core verify-checksums` as modified.
pub fn checksum_mismatches(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| l.contains(CHECKSUM_MISMATCH))
        .filter_map(|l| l.rsplit(':').next())
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

/// Shell-quoted domain without scheme, for commands that take a host name.
pub fn host_arg(domain: &str) -> String {
    let host = domain
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(domain);
    shell_quote(host)
}
