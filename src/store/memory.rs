use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{Store, StoreDocument, HISTORY_LIMIT_PER_TARGET};
use crate::errors::StoreError;
use crate::model::{CacheEntry, DiagnosisRecord, Execution, HealingPattern, HealthStatus, Target};

/// Store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: RwLock<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: StoreDocument) -> Self {
        Self {
            doc: RwLock::new(doc),
        }
    }

    pub fn snapshot(&self) -> StoreDocument {
        self.doc.read().clone()
    }

    /// Apply `f` to a stored target under the write lock.
    pub fn update_target(&self, id: &str, f: impl FnOnce(&mut Target)) -> bool {
        match self.doc.write().targets.get_mut(id) {
            Some(target) => {
                f(target);
                true
            }
            None => false,
        }
    }
}

fn since_filter(at: DateTime<Utc>, since: Option<DateTime<Utc>>) -> bool {
    since.map(|s| at >= s).unwrap_or(true)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_target(&self, id: &str) -> Result<Option<Target>, StoreError> {
        Ok(self.doc.read().targets.get(id).cloned())
    }

    async fn upsert_target(&self, target: &Target) -> Result<(), StoreError> {
        self.doc
            .write()
            .targets
            .insert(target.id.clone(), target.clone());
        Ok(())
    }

    async fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
        Ok(self.doc.read().targets.values().cloned().collect())
    }

    async fn record_target_health(
        &self,
        id: &str,
        score: u8,
        diagnosed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.update_target(id, |target| {
            target.health_score = Some(score);
            target.health_status = HealthStatus::from_score(score);
            target.last_diagnosed_at = Some(diagnosed_at);
        }))
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.doc.read().executions.get(id).cloned())
    }

    async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.doc
            .write()
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn executions_for_target(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut out: Vec<Execution> = self
            .doc
            .read()
            .executions
            .values()
            .filter(|e| e.target_id == target_id && since_filter(e.created_at, since))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn get_pattern(&self, id: &str) -> Result<Option<HealingPattern>, StoreError> {
        Ok(self.doc.read().patterns.get(id).cloned())
    }

    async fn upsert_pattern(&self, pattern: &HealingPattern) -> Result<(), StoreError> {
        self.doc
            .write()
            .patterns
            .insert(pattern.id.clone(), pattern.clone());
        Ok(())
    }

    async fn list_patterns(&self) -> Result<Vec<HealingPattern>, StoreError> {
        Ok(self.doc.read().patterns.values().cloned().collect())
    }

    async fn delete_pattern(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.doc.write().patterns.remove(id).is_some())
    }

    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.doc.read().cache.get(key).cloned())
    }

    async fn upsert_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.doc
            .write()
            .cache
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.doc.write().cache.remove(key).is_some())
    }

    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self.doc.read().cache.values().cloned().collect())
    }

    async fn append_diagnosis(&self, record: &DiagnosisRecord) -> Result<(), StoreError> {
        let mut doc = self.doc.write();
        doc.diagnoses.push(record.clone());

        let count = doc
            .diagnoses
            .iter()
            .filter(|d| d.target_id == record.target_id)
            .count();
        if count > HISTORY_LIMIT_PER_TARGET {
            let mut excess = count - HISTORY_LIMIT_PER_TARGET;
            doc.diagnoses.retain(|d| {
                if excess > 0 && d.target_id == record.target_id {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
        Ok(())
    }

    async fn diagnoses_for_target(
        &self,
        target_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiagnosisRecord>, StoreError> {
        let mut out: Vec<DiagnosisRecord> = self
            .doc
            .read()
            .diagnoses
            .iter()
            .filter(|d| d.target_id == target_id && since_filter(d.created_at, since))
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        Ok(out)
    }
}
