//! In-process doubles for the remote and storage seams.
//!
//! `MockExecutor` answers shell commands by substring rules, `MockProber`
//! answers HTTP fetches by URL substring and `MockBackupService` records
//! backups without touching a host. All of them record what they were asked
//! so tests can assert on it. `MockStore` wraps a `MemoryStore` with one-shot
//! write failures and a hook for simulating concurrent writers.
//!
//! # Example
//! ```ignore
//! let executor = MockExecutor::new()
//!     .on("plugin list", "akismet\nshop")
//!     .fail_on("theme activate", 1, "Error: theme not found");
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::Duration;

use crate::backup::BackupService;
use crate::errors::{BackupError, RemoteError, StoreError};
use crate::model::{
    BackupKind, BackupRef, CacheEntry, DiagnosisRecord, Execution, ExecutionStatus,
    HealingPattern, Target,
};
use crate::remote::{CommandOutput, HttpProber, HttpResponse, RemoteExecutor};
use crate::store::{MemoryStore, Store};

/// Latency reported by `MockProber` responses.
pub const MOCK_ELAPSED_MS: u64 = 25;

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Error(String),
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    reply: Reply,
}

/// Scripted `RemoteExecutor`. Rules are matched by substring; the most
/// recently added matching rule wins. Unmatched commands succeed with empty
/// output.
#[derive(Debug, Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, stdout: &str) -> Self {
        self.add_output(needle, stdout);
        self
    }

    pub fn fail_on(self, needle: &str, code: i32, stderr: &str) -> Self {
        self.add_failure(needle, code, stderr);
        self
    }

    /// Transport error (connection, spawn) instead of a command result.
    pub fn error_on(self, needle: &str, message: &str) -> Self {
        self.push(needle, Reply::Error(message.to_string()));
        self
    }

    pub fn timeout_on(self, needle: &str) -> Self {
        self.push(needle, Reply::Timeout);
        self
    }

    pub fn add_output(&self, needle: &str, stdout: &str) {
        self.push(
            needle,
            Reply::Output(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
        );
    }

    pub fn add_failure(&self, needle: &str, code: i32, stderr: &str) {
        self.push(
            needle,
            Reply::Output(CommandOutput {
                stderr: stderr.to_string(),
                exit_code: code,
                ..Default::default()
            }),
        );
    }

    /// Drop every rule; recorded calls are kept.
    pub fn clear(&self) {
        self.rules.lock().clear();
    }

    fn push(&self, needle: &str, reply: Reply) {
        self.rules.lock().push(Rule {
            needle: needle.to_string(),
            reply,
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Whether any executed command contains `needle`.
    pub fn ran(&self, needle: &str) -> bool {
        self.calls.lock().iter().any(|c| c.contains(needle))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn exec(
        &self,
        _target_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.calls.lock().push(command.to_string());
        let reply = self
            .rules
            .lock()
            .iter()
            .rev()
            .find(|r| command.contains(&r.needle))
            .map(|r| r.reply.clone());
        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Error(message)) => Err(RemoteError::Connection(message)),
            Some(Reply::Timeout) => Err(RemoteError::Timeout {
                secs: timeout.as_secs(),
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

/// Scripted `HttpProber`. Unmatched URLs are unreachable.
#[derive(Debug, Default)]
pub struct MockProber {
    responses: Mutex<Vec<(String, u16, String)>>,
    fetched: Mutex<Vec<String>>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url_needle: &str, status: u16, body: &str) -> Self {
        self.set_response(url_needle, status, body);
        self
    }

    /// Later responses for the same needle replace earlier ones.
    pub fn set_response(&self, url_needle: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .push((url_needle.to_string(), status, body.to_string()));
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl HttpProber for MockProber {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, RemoteError> {
        self.fetched.lock().push(url.to_string());
        self.responses
            .lock()
            .iter()
            .rev()
            .find(|(needle, _, _)| url.contains(needle.as_str()))
            .map(|(_, status, body)| HttpResponse {
                status: *status,
                body: body.clone(),
                elapsed_ms: MOCK_ELAPSED_MS,
            })
            .ok_or_else(|| RemoteError::Http(format!("connection refused: {}", url)))
    }
}

/// `BackupService` that only records. Creation and restore can be made to
/// fail.
#[derive(Debug, Default)]
pub struct MockBackupService {
    created: Mutex<Vec<BackupRef>>,
    restored: Mutex<Vec<String>>,
    fail_create: Mutex<Option<String>>,
    fail_restore: Mutex<Option<String>>,
}

impl MockBackupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_create(self, message: &str) -> Self {
        *self.fail_create.lock() = Some(message.to_string());
        self
    }

    pub fn failing_restore(self, message: &str) -> Self {
        *self.fail_restore.lock() = Some(message.to_string());
        self
    }

    pub fn created(&self) -> Vec<BackupRef> {
        self.created.lock().clone()
    }

    /// Ids of restored backups, in order.
    pub fn restored(&self) -> Vec<String> {
        self.restored.lock().clone()
    }
}

#[async_trait]
impl BackupService for MockBackupService {
    async fn create_backup(
        &self,
        target: &Target,
        path: &str,
        kind: BackupKind,
    ) -> Result<BackupRef, BackupError> {
        if let Some(message) = self.fail_create.lock().clone() {
            return Err(BackupError::Create(message));
        }
        let id = format!("bk_{}", uuid::Uuid::new_v4().simple());
        let backup = BackupRef {
            location: format!("/backups/{}", id),
            id,
            target_id: target.id.clone(),
            remote_handle: target.remote_handle.clone(),
            path: path.to_string(),
            kind,
            created_at: Utc::now(),
        };
        self.created.lock().push(backup.clone());
        Ok(backup)
    }

    async fn restore(&self, backup: &BackupRef) -> Result<(), BackupError> {
        if let Some(message) = self.fail_restore.lock().clone() {
            return Err(BackupError::Restore(message));
        }
        self.restored.lock().push(backup.id.clone());
        Ok(())
    }
}

type StoreHook = Box<dyn FnOnce(&MemoryStore) + Send>;

/// `Store` over a `MemoryStore`. The next write of an execution in a given
/// status can be made to fail, and a hook can run right after the next
/// diagnosis is appended, which is while a diagnose call is in flight.
#[derive(Default)]
pub struct MockStore {
    inner: MemoryStore,
    fail_execution_write: Mutex<Option<(ExecutionStatus, String)>>,
    after_diagnosis: Mutex<Option<StoreHook>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail the next `upsert_execution` whose record is in `status`.
    pub fn fail_next_execution_write(&self, status: ExecutionStatus, message: &str) {
        *self.fail_execution_write.lock() = Some((status, message.to_string()));
    }

    pub fn after_next_diagnosis(&self, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.after_diagnosis.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get_target(&self, id: &str) -> Result<Option<Target>, StoreError> {
        self.inner.get_target(id).await
    }

    async fn upsert_target(&self, target: &Target) -> Result<(), StoreError> {
        self.inner.upsert_target(target).await
    }

    async fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
        self.inner.list_targets().await
    }

    async fn record_target_health(
        &self,
        id: &str,
        score: u8,
        diagnosed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.record_target_health(id, score, diagnosed_at).await
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let injected = {
            let mut armed = self.fail_execution_write.lock();
            if armed
                .as_ref()
                .is_some_and(|(status, _)| *status == execution.status)
            {
                armed.take()
            } else {
                None
            }
        };
        if let Some((_, message)) = injected {
            return Err(StoreError::Io {
                path: PathBuf::from("mock-store"),
                message,
            });
        }
        self.inner.upsert_execution(execution).await
    }

    async fn executions_for_target(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Execution>, StoreError> {
        self.inner.executions_for_target(target_id, since).await
    }

    async fn get_pattern(&self, id: &str) -> Result<Option<HealingPattern>, StoreError> {
        self.inner.get_pattern(id).await
    }

    async fn upsert_pattern(&self, pattern: &HealingPattern) -> Result<(), StoreError> {
        self.inner.upsert_pattern(pattern).await
    }

    async fn list_patterns(&self) -> Result<Vec<HealingPattern>, StoreError> {
        self.inner.list_patterns().await
    }

    async fn delete_pattern(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_pattern(id).await
    }

    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.get_cache_entry(key).await
    }

    async fn upsert_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.inner.upsert_cache_entry(entry).await
    }

    async fn delete_cache_entry(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_cache_entry(key).await
    }

    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.inner.list_cache_entries().await
    }

    async fn append_diagnosis(&self, record: &DiagnosisRecord) -> Result<(), StoreError> {
        self.inner.append_diagnosis(record).await?;
        let hook = self.after_diagnosis.lock().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        Ok(())
    }

    async fn diagnoses_for_target(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiagnosisRecord>, StoreError> {
        self.inner.diagnoses_for_target(target_id, since).await
    }
}
