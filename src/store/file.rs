use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{MemoryStore, Store, StoreDocument};
use crate::errors::StoreError;
use crate::model::{CacheEntry, DiagnosisRecord, Execution, HealingPattern, Target};

/// Store persisted as one JSON document. Every write rewrites the document
/// through a temporary file and an atomic rename.
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    persist_lock: Mutex<()>,
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => StoreDocument::default(),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| StoreError::Corrupted(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(io_error(&path, e)),
        };
        Ok(Self {
            path,
            inner: MemoryStore::from_document(doc),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        // Serialize under the lock so an older snapshot never lands last.
        let _guard = self.persist_lock.lock().await;
        let json = serde_json::to_string_pretty(&self.inner.snapshot())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        debug!(path = %self.path.display(), "Store persisted");
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn get_target(&self, id: &str) -> Result<Option<Target>, StoreError> {
        self.inner.get_target(id).await
    }

    async fn upsert_target(&self, target: &Target) -> Result<(), StoreError> {
        self.inner.upsert_target(target).await?;
        self.persist().await
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
        let updated = self.inner.record_target_health(id, score, diagnosed_at).await?;
        if updated {
            self.persist().await?;
        }
        Ok(updated)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.inner.upsert_execution(execution).await?;
        self.persist().await
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
        self.inner.upsert_pattern(pattern).await?;
        self.persist().await
    }

    async fn list_patterns(&self) -> Result<Vec<HealingPattern>, StoreError> {
        self.inner.list_patterns().await
    }

    async fn delete_pattern(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.inner.delete_pattern(id).await?;
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.get_cache_entry(key).await
    }

    async fn upsert_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.inner.upsert_cache_entry(entry).await?;
        self.persist().await
    }

    async fn delete_cache_entry(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.inner.delete_cache_entry(key).await?;
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.inner.list_cache_entries().await
    }

    async fn append_diagnosis(&self, record: &DiagnosisRecord) -> Result<(), StoreError> {
        self.inner.append_diagnosis(record).await?;
        self.persist().await
    }

    async fn diagnoses_for_target(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiagnosisRecord>, StoreError> {
        self.inner.diagnoses_for_target(target_id, since).await
    }
}
