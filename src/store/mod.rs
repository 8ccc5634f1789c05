//! Record store for targets, executions, patterns, cache entries and
//! diagnosis history.
//!
//! Every write is a single-record upsert keyed by a natural id, so
//! concurrent writers race only as last-write-wins on one record. Diagnosis
//! results reach a target through `record_target_health`, which cannot undo
//! a concurrent breaker update.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::StoreError;
use crate::model::{CacheEntry, DiagnosisRecord, Execution, HealingPattern, Target};

/// Diagnosis records kept per target before the oldest are dropped.
pub const HISTORY_LIMIT_PER_TARGET: usize = 1000;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_target(&self, id: &str) -> Result<Option<Target>, StoreError>;
    async fn upsert_target(&self, target: &Target) -> Result<(), StoreError>;
    async fn list_targets(&self) -> Result<Vec<Target>, StoreError>;
    /// Write only the health fields of a stored target, leaving breaker and
    /// failure counters as they are. False when the target does not exist.
    async fn record_target_health(
        &self,
        id: &str,
        score: u8,
        diagnosed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError>;
    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError>;
    /// Executions of a target, oldest first, optionally only those created
    /// at or after `since`.
    async fn executions_for_target(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Execution>, StoreError>;

    async fn get_pattern(&self, id: &str) -> Result<Option<HealingPattern>, StoreError>;
    async fn upsert_pattern(&self, pattern: &HealingPattern) -> Result<(), StoreError>;
    async fn list_patterns(&self) -> Result<Vec<HealingPattern>, StoreError>;
    async fn delete_pattern(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;
    async fn upsert_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError>;
    async fn delete_cache_entry(&self, key: &str) -> Result<bool, StoreError>;
    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>, StoreError>;

    async fn append_diagnosis(&self, record: &DiagnosisRecord) -> Result<(), StoreError>;
    /// Diagnosis history of a target, oldest first.
    async fn diagnoses_for_target(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiagnosisRecord>, StoreError>;

    /// Most recently created execution of a target.
    async fn latest_execution(&self, target_id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self
            .executions_for_target(target_id, None)
            .await?
            .into_iter()
            .last())
    }
}

/// Whole-store document. This is also the on-disk format of `JsonFileStore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub targets: BTreeMap<String, Target>,
    #[serde(default)]
    pub executions: BTreeMap<String, Execution>,
    #[serde(default)]
    pub patterns: BTreeMap<String, HealingPattern>,
    #[serde(default)]
    pub cache: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    pub diagnoses: Vec<DiagnosisRecord>,
}
