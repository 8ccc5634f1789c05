//! Remote access to hosted sites.
//!
//! Two seams: `RemoteExecutor` runs shell commands on the host of a target,
//! `HttpProber` fetches pages over HTTP. Both convert their own timeouts into
//! errors instead of hanging the caller.

pub mod http;
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::RemoteError;

pub use http::{
    assess_response, site_url, HttpAssessment, HttpProber, HttpResponse, ReqwestProber,
    BLANK_PAGE_BYTES, SUSPICIOUS_BODY_BYTES,
};
pub use ssh::SshExecutor;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Converts a non-zero exit into an error carrying stderr.
    pub fn into_result(self) -> Result<CommandOutput, RemoteError> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(RemoteError::CommandFailed {
                code: self.exit_code,
                stderr,
            })
        }
    }
}

/// Executes shell commands on the host behind a target's remote handle.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn exec(
        &self,
        target_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    match shlex::try_quote(value) {
        Ok(quoted) => quoted.into_owned(),
        Err(_) => format!("'{}'", value.replace('\0', "").replace('\'', r"'\''")),
    }
}

/// Shell expression for a remote path. A leading `~/` stays outside the
/// quotes so the remote shell still expands it.
pub fn remote_path_expr(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

/// Builds wp-cli invocations that bypass plugins and themes, so they still
/// work while either is crashing the site.
#[derive(Debug, Clone)]
pub struct WpCli {
    binary: String,
}

impl WpCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn command(&self, path: &str, args: &str) -> String {
        format!(
            "{} {} --path={} --skip-plugins --skip-themes",
            self.binary,
            args,
            shell_quote(path)
        )
    }
}

impl Default for WpCli {
    fn default() -> Self {
        Self::new("wp")
    }
}
