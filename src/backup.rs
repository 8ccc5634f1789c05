//! Backup and restore of a site before remediation touches it.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::BackupError;
use crate::model::{BackupKind, BackupRef, Target};
use crate::remote::{remote_path_expr, shell_quote, RemoteExecutor, WpCli};

#[async_trait]
pub trait BackupService: Send + Sync {
    /// Snapshot `path` of the target. `path` may be a subdomain root.
    async fn create_backup(
        &self,
        target: &Target,
        path: &str,
        kind: BackupKind,
    ) -> Result<BackupRef, BackupError>;

    async fn restore(&self, backup: &BackupRef) -> Result<(), BackupError>;
}

const FILES_ARCHIVE: &str = "files.tar.gz";
const DATABASE_DUMP: &str = "database.sql";

/// Keeps backups on the target host itself: a tarball of the install and a
/// wp-cli database dump under `backup_dir/<backup id>/`.
pub struct RemoteBackupService {
    executor: Arc<dyn RemoteExecutor>,
    wp: WpCli,
    backup_dir: String,
    timeout: Duration,
}

impl RemoteBackupService {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        wp: WpCli,
        backup_dir: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            wp,
            backup_dir: backup_dir.into(),
            timeout,
        }
    }

    /// Shell-safe directory for a backup id.
    fn backup_location(&self, id: &str) -> String {
        remote_path_expr(&format!("{}/{}", self.backup_dir.trim_end_matches('/'), id))
    }

    async fn run(&self, handle: &str, command: &str) -> Result<(), String> {
        self.executor
            .exec(handle, command, self.timeout)
            .await
            .map_err(|e| e.to_string())?
            .into_result()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl BackupService for RemoteBackupService {
    async fn create_backup(
        &self,
        target: &Target,
        path: &str,
        kind: BackupKind,
    ) -> Result<BackupRef, BackupError> {
        let id = format!("bk_{}", uuid::Uuid::new_v4().simple());
        let location = self.backup_location(&id);
        let handle = target.remote_handle.as_str();

        self.run(handle, &format!("mkdir -p {}", location))
            .await
            .map_err(BackupError::Create)?;

        if matches!(kind, BackupKind::Files | BackupKind::Full) {
            let cmd = format!(
                "tar -czf {}/{} -C {} .",
                location,
                FILES_ARCHIVE,
                shell_quote(path)
            );
            self.run(handle, &cmd).await.map_err(BackupError::Create)?;
        }
        if matches!(kind, BackupKind::Database | BackupKind::Full) {
            let cmd = self
                .wp
                .command(path, &format!("db export {}/{}", location, DATABASE_DUMP));
            self.run(handle, &cmd).await.map_err(BackupError::Create)?;
        }

        info!(target_id = %target.id, backup_id = %id, kind = ?kind, "Backup created");
        Ok(BackupRef {
            id,
            target_id: target.id.clone(),
            remote_handle: target.remote_handle.clone(),
            path: path.to_string(),
            kind,
            location,
            created_at: Utc::now(),
        })
    }

    async fn restore(&self, backup: &BackupRef) -> Result<(), BackupError> {
        let handle = backup.remote_handle.as_str();
        if self
            .run(handle, &format!("test -d {}", backup.location))
            .await
            .is_err()
        {
            warn!(backup_id = %backup.id, "Backup directory missing on host");
            return Err(BackupError::NotFound(backup.id.clone()));
        }

        if matches!(backup.kind, BackupKind::Files | BackupKind::Full) {
            let cmd = format!(
                "tar -xzf {}/{} -C {}",
                backup.location,
                FILES_ARCHIVE,
                shell_quote(&backup.path)
            );
            self.run(handle, &cmd).await.map_err(BackupError::Restore)?;
        }
        if matches!(backup.kind, BackupKind::Database | BackupKind::Full) {
            let cmd = self.wp.command(
                &backup.path,
                &format!("db import {}/{}", backup.location, DATABASE_DUMP),
            );
            self.run(handle, &cmd).await.map_err(BackupError::Restore)?;
        }

        info!(target_id = %backup.target_id, backup_id = %backup.id, "Backup restored");
        Ok(())
    }
}
