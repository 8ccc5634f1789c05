//! `RemoteExecutor` over the system `ssh` client.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, RemoteExecutor};
use crate::config::{Config, SshEndpoint};
use crate::errors::RemoteError;

/// ssh reserves exit status 255 for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

pub struct SshExecutor {
    endpoints: HashMap<String, SshEndpoint>,
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new(endpoints: HashMap<String, SshEndpoint>) -> Self {
        Self {
            endpoints,
            connect_timeout_secs: 10,
        }
    }

    /// Endpoints for every configured target that has an `[targets.ssh]` table.
    pub fn from_config(config: &Config) -> Self {
        let endpoints = config
            .targets
            .iter()
            .filter_map(|t| t.ssh.clone().map(|ssh| (t.id.clone(), ssh)))
            .collect();
        Self::new(endpoints)
    }

    fn build_command(&self, endpoint: &SshEndpoint, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg("-p")
            .arg(endpoint.port.to_string());
        if let Some(identity) = &endpoint.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", endpoint.user, endpoint.host))
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(
        &self,
        target_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let endpoint = self
            .endpoints
            .get(target_id)
            .ok_or_else(|| RemoteError::UnknownTarget(target_id.to_string()))?;

        debug!(target_id = %target_id, host = %endpoint.host, "Running remote command");

        let start = Instant::now();
        let child = self
            .build_command(endpoint, command)
            .spawn()
            .map_err(|e| RemoteError::Spawn(e.to_string()))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout {
                secs: timeout.as_secs(),
            })?
            .map_err(|e| RemoteError::Connection(e.to_string()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if exit_code == SSH_CONNECTION_FAILURE {
            return Err(RemoteError::Connection(stderr.trim().to_string()));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
