//! Incremental sync of external records.
//!
//! Each fetched record is fingerprinted from stable fields (entity id,
//! external code, external timestamp). Only fingerprints not already stored
//! for the entity are inserted, and the store skips any collision on insert,
//! so two concurrent syncs of the same entity cannot produce duplicate rows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use caseflow_core::{EntityId, TenantId};

use crate::error::{JobError, StoreError};

/// Content-addressed record identity (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(entity_id: EntityId, code: &str, occurred_at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(entity_id.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(code.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(occurred_at.timestamp_millis().to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a fingerprint read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record as returned by an external data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    /// Source-side code identifying the kind of record (e.g. movement code)
    pub code: String,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
    /// Full source document, kept for audit
    pub raw: serde_json::Value,
}

/// A persisted, fingerprinted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub fingerprint: Fingerprint,
    pub code: String,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
    pub raw: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}

/// Fingerprinted record persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fingerprints(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<HashSet<Fingerprint>, StoreError>;

    /// Bulk insert; rows whose fingerprint already exists are skipped
    /// silently. Returns rows actually inserted.
    async fn insert_ignoring_conflicts(&self, records: &[StoredRecord]) -> Result<u64, StoreError>;

    /// Delete every record of the entity, then insert `records`.
    async fn replace_all(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        records: &[StoredRecord],
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Insert only unseen fingerprints; idempotent
    #[default]
    Incremental,
    /// Legacy delete-all-then-reinsert
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub inserted: u64,
    pub skipped: u64,
    pub mode: SyncMode,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("record store failed: {0}")]
    Store(#[from] StoreError),
}

impl From<SyncError> for JobError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Store(e) => JobError::Store(e),
        }
    }
}

/// Reconciles fetched records against stored fingerprints.
#[derive(Clone)]
pub struct IncrementalSync {
    store: Arc<dyn RecordStore>,
    mode: SyncMode,
}

impl std::fmt::Debug for IncrementalSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalSync")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl IncrementalSync {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            mode: SyncMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub async fn reconcile(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        fetched: Vec<ExternalRecord>,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, SyncError> {
        let fetched_count = fetched.len();

        // Same triple twice in one upstream response collapses to one row.
        let mut seen = HashSet::with_capacity(fetched_count);
        let candidates: Vec<StoredRecord> = fetched
            .into_iter()
            .filter_map(|r| {
                let fingerprint = Fingerprint::compute(entity_id, &r.code, r.occurred_at);
                seen.insert(fingerprint.clone()).then(|| StoredRecord {
                    tenant_id,
                    entity_id,
                    fingerprint,
                    code: r.code,
                    occurred_at: r.occurred_at,
                    description: r.description,
                    raw: r.raw,
                    ingested_at: now,
                })
            })
            .collect();

        let inserted = match self.mode {
            SyncMode::Incremental => {
                let known = self.store.fingerprints(tenant_id, entity_id).await?;
                let fresh: Vec<StoredRecord> = candidates
                    .into_iter()
                    .filter(|r| !known.contains(&r.fingerprint))
                    .collect();
                debug!(
                    %tenant_id,
                    %entity_id,
                    known = known.len(),
                    fresh = fresh.len(),
                    "computed sync delta"
                );
                if fresh.is_empty() {
                    0
                } else {
                    self.store.insert_ignoring_conflicts(&fresh).await?
                }
            }
            SyncMode::Replace => {
                self.store
                    .replace_all(tenant_id, entity_id, &candidates)
                    .await?
            }
        };

        let report = SyncReport {
            fetched: fetched_count,
            inserted,
            skipped: (fetched_count as u64).saturating_sub(inserted),
            mode: self.mode,
        };
        info!(
            %tenant_id,
            %entity_id,
            fetched = report.fetched,
            inserted = report.inserted,
            skipped = report.skipped,
            mode = ?report.mode,
            "entity synced"
        );
        Ok(report)
    }
}

type EntityKey = (TenantId, EntityId);

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<EntityKey, BTreeMap<Fingerprint, StoredRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Stored records of one entity, ordered by occurrence.
    pub fn records(&self, tenant_id: TenantId, entity_id: EntityId) -> Vec<StoredRecord> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .get(&(tenant_id, entity_id))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|r| r.occurred_at);
        out
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn fingerprints(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<HashSet<Fingerprint>, StoreError> {
        Ok(self
            .records
            .lock()
            .get(&(tenant_id, entity_id))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_ignoring_conflicts(&self, records: &[StoredRecord]) -> Result<u64, StoreError> {
        let mut all = self.records.lock();
        let mut inserted = 0;
        for record in records {
            let entity = all.entry((record.tenant_id, record.entity_id)).or_default();
            if !entity.contains_key(&record.fingerprint) {
                entity.insert(record.fingerprint.clone(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn replace_all(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        records: &[StoredRecord],
    ) -> Result<u64, StoreError> {
        let mut all = self.records.lock();
        let entity = all.entry((tenant_id, entity_id)).or_default();
        entity.clear();
        for record in records {
            entity.insert(record.fingerprint.clone(), record.clone());
        }
        Ok(entity.len() as u64)
    }
}
