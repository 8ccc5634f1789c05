//! TTL cache of diagnosis records keyed by (target, path, profile).
//!
//! Entries live in the store so they survive restarts. Expired entries are
//! evicted lazily on read: nothing past `expires_at` is ever returned.

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::errors::StoreError;
use crate::model::{CacheEntry, DiagnosisProfile, DiagnosisRecord};
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Stored entries already past their expiry
    pub expired: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired_evictions: u64,
}

pub struct DiagnosisCache {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_evictions: AtomicU64,
}

impl DiagnosisCache {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_evictions: AtomicU64::new(0),
        }
    }

    /// Cached record, marked `from_cache`, or `None` on miss or expiry.
    pub async fn get(
        &self,
        target_id: &str,
        path: &str,
        profile: DiagnosisProfile,
    ) -> Result<Option<DiagnosisRecord>, StoreError> {
        let key = CacheEntry::key_for(target_id, path, profile);
        let Some(mut entry) = self.store.get_cache_entry(&key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if entry.is_expired(self.clock.now()) {
            self.store.delete_cache_entry(&key).await?;
            self.expired_evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Evicted expired diagnosis");
            return Ok(None);
        }

        entry.hit_count += 1;
        self.store.upsert_cache_entry(&entry).await?;
        self.hits.fetch_add(1, Ordering::Relaxed);

        let mut record = entry.record;
        record.from_cache = true;
        Ok(Some(record))
    }

    /// Insert or overwrite the entry for the record's key.
    pub async fn put(
        &self,
        record: &DiagnosisRecord,
        ttl: Duration,
    ) -> Result<CacheEntry, StoreError> {
        let now = self.clock.now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());
        let entry = CacheEntry {
            key: CacheEntry::key_for(&record.target_id, &record.path, record.profile),
            target_id: record.target_id.clone(),
            path: record.path.clone(),
            profile: record.profile,
            record: record.clone(),
            health_score: record.health_score,
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
        };
        self.store.upsert_cache_entry(&entry).await?;
        Ok(entry)
    }

    /// Drop every entry of a target, or only those for `path`.
    pub async fn invalidate(&self, target_id: &str, path: Option<&str>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for entry in self.store.list_cache_entries().await? {
            let path_matches = path.map(|p| entry.path == p).unwrap_or(true);
            if entry.target_id == target_id && path_matches && self.store.delete_cache_entry(&entry.key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(target_id = %target_id, removed, "Invalidated cached diagnoses");
        }
        Ok(removed)
    }

    /// Delete every expired entry.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut removed = 0;
        for entry in self.store.list_cache_entries().await? {
            if entry.is_expired(now) && self.store.delete_cache_entry(&entry.key).await? {
                removed += 1;
            }
        }
        self.expired_evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let now = self.clock.now();
        let entries = self.store.list_cache_entries().await?;
        Ok(CacheStats {
            entries: entries.len(),
            expired: entries.iter().filter(|e| e.is_expired(now)).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
        })
    }
}
