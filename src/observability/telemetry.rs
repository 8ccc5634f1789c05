//! Tracing setup and log hygiene
//!
//! Provides structured logging and tracing for engine operations.
//! Features:
//! - Remote command spans with timing
//! - Execution and breaker state transition logging
//! - Configurable log level via RUST_LOG or the config file
//! - Optional JSON output for log shippers

use regex::Regex;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Sanitize a string for safe log output by escaping control characters.
/// Prevents log injection where remote output embeds newlines to forge entries.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)(sk-|key-|token-)[A-Za-z0-9_\-]{8,}").expect("invalid secret regex"),
            Regex::new(r"(?i)Bearer\s+[A-Za-z0-9_\-\.]{8,}").expect("invalid bearer regex"),
            Regex::new(r"(?i)(password|passwd|pwd)\s*=\s*\S+").expect("invalid password regex"),
            // wp-config style: define( 'DB_PASSWORD', '...' )
            Regex::new(r#"(?i)(DB_PASSWORD['"]?\s*,\s*)['"][^'"]*['"]"#)
                .expect("invalid wp-config regex"),
            // mysql -p<secret>
            Regex::new(r"(\s-p)\S+").expect("invalid mysql regex"),
        ]
    })
}

/// Redact credentials from a string before it is logged or persisted.
pub fn redact_secrets(input: &str) -> String {
    let mut result = input.to_string();
    for (i, pattern) in secret_patterns().iter().enumerate() {
        result = match i {
            3 | 4 => pattern.replace_all(&result, "${1}[REDACTED]").to_string(),
            _ => pattern.replace_all(&result, "[REDACTED]").to_string(),
        };
    }
    result
}

/// Sanitize and redact in one go; the form remote output is logged in.
pub fn safe_log_text(input: &str) -> String {
    redact_secrets(&sanitize_for_log(input))
}

/// Initialize global tracing from the logging config.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    init_tracing_with_filter(&filter, config.json);
}

/// Initialize with custom filter string. Only the first call has an effect.
pub fn init_tracing_with_filter(filter: &str, json: bool) {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));

        if json {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init();
        } else {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .compact()
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init();
        }
    });
}

/// Run a remote operation inside a span that records its duration and outcome.
pub async fn track_remote_command<F, Fut, T, E>(target_id: &str, label: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let span = info_span!(
        "remote.exec",
        target_id = %sanitize_for_log(target_id),
        command = %safe_log_text(label),
        duration_ms = tracing::field::Empty,
        success = tracing::field::Empty,
    );
    match f().instrument(span.clone()).await {
        Ok(result) => {
            let duration = start.elapsed().as_millis() as u64;
            span.record("duration_ms", duration);
            span.record("success", true);
            Ok(result)
        }
        Err(e) => {
            let duration = start.elapsed().as_millis() as u64;
            let safe_err = safe_log_text(&e.to_string());
            span.record("duration_ms", duration);
            span.record("success", false);
            span.in_scope(|| {
                error!(duration_ms = duration, error = safe_err.as_str(), "Remote command failed")
            });
            Err(e)
        }
    }
}

/// Record an execution state transition.
pub fn record_state_transition(execution_id: &str, from: &str, to: &str) {
    info!(
        execution_id = %sanitize_for_log(execution_id),
        from = from,
        to = to,
        "Execution state transition"
    );
}

/// Debug-level subscriber for tests. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
