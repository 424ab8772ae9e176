//! Dead-letter capture, inspection and replay.
//!
//! A record is created exactly once, when a job's retry budget is exhausted,
//! and lives until an explicit retry or retention cleanup removes it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use caseflow_core::TenantId;

use crate::error::{JobError, QueueError, StoreError};
use crate::payload::JobPayload;
use crate::queue::{EnqueueOptions, JobHandle, QueueClient};
use crate::types::{Job, JobId, QueueName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for DeadLetterId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Immutable snapshot of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: DeadLetterId,
    pub original_queue: QueueName,
    pub original_job_name: String,
    pub original_job_id: JobId,
    pub payload: JobPayload,
    pub failure_reason: String,
    pub attempts_made: u32,
    /// Error message plus its cause chain.
    pub stack_trace: String,
    pub failed_at: DateTime<Utc>,
    pub tenant_id: Option<TenantId>,
}

/// Aggregate view over the dead-letter store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_queue: BTreeMap<String, usize>,
    pub by_tenant: BTreeMap<String, usize>,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
}

impl DeadLetterStats {
    fn from_records<'a>(records: impl IntoIterator<Item = &'a DeadLetterRecord>) -> Self {
        let mut stats = DeadLetterStats::default();
        for record in records {
            stats.total += 1;
            *stats
                .by_queue
                .entry(record.original_queue.as_str().to_string())
                .or_default() += 1;
            if let Some(tenant_id) = record.tenant_id {
                *stats.by_tenant.entry(tenant_id.to_string()).or_default() += 1;
            }
            stats.oldest_failure = Some(
                stats
                    .oldest_failure
                    .map_or(record.failed_at, |t| t.min(record.failed_at)),
            );
            stats.newest_failure = Some(
                stats
                    .newest_failure
                    .map_or(record.failed_at, |t| t.max(record.failed_at)),
            );
        }
        stats
    }
}

/// Dead-letter persistence.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), StoreError>;

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterRecord>, StoreError>;

    /// Newest first, optionally filtered by origin queue.
    async fn list(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, StoreError>;

    async fn all(&self) -> Result<Vec<DeadLetterRecord>, StoreError>;

    async fn remove(&self, id: DeadLetterId) -> Result<bool, StoreError>;

    /// Remove records that failed strictly before `cutoff`.
    async fn remove_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<HashMap<DeadLetterId, DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterRecord>, StoreError> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn list(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let records = self.records.read();
        let mut result: Vec<_> = records
            .values()
            .filter(|r| queue.is_none_or(|q| r.original_queue == q))
            .cloned()
            .collect();
        result.sort_by(|a, b| (b.failed_at, b.id.0).cmp(&(a.failed_at, a.id.0)));
        result.truncate(limit);
        Ok(result)
    }

    async fn all(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn remove(&self, id: DeadLetterId) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&id).is_some())
    }

    async fn remove_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.failed_at >= cutoff);
        Ok(before - records.len())
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter record not found: {0}")]
    NotFound(DeadLetterId),
    #[error("record {id} originated in {expected}, cannot replay into {actual}")]
    QueueMismatch {
        id: DeadLetterId,
        expected: QueueName,
        actual: QueueName,
    },
    #[error("replay enqueue failed: {0}")]
    Enqueue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Routes exhausted jobs into the dead-letter store and exposes the
/// operational surface over it.
#[derive(Clone)]
pub struct DeadLetterRouter {
    store: Arc<dyn DeadLetterStore>,
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter").finish_non_exhaustive()
    }
}

impl DeadLetterRouter {
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self { store }
    }

    /// Persist a record for a job whose retry budget is exhausted.
    pub async fn move_to_dead_letter(
        &self,
        original_queue: QueueName,
        job: &Job,
        error: &JobError,
        failed_at: DateTime<Utc>,
    ) -> Result<DeadLetterRecord, StoreError> {
        let record = DeadLetterRecord {
            id: DeadLetterId::new(),
            original_queue,
            original_job_name: job.name().to_string(),
            original_job_id: job.id.clone(),
            payload: job.payload.clone(),
            failure_reason: error.to_string(),
            attempts_made: job.attempts_made,
            stack_trace: error.chain(),
            failed_at,
            tenant_id: job.tenant_id(),
        };

        self.store.insert(&record).await?;

        warn!(
            queue = %original_queue,
            job = job.name(),
            job_id = %job.id,
            dead_letter_id = %record.id,
            attempts = job.attempts_made,
            tenant_id = ?record.tenant_id,
            reason = %record.failure_reason,
            "job dead-lettered"
        );
        Ok(record)
    }

    pub async fn stats(&self) -> Result<DeadLetterStats, StoreError> {
        let records = self.store.all().await?;
        Ok(DeadLetterStats::from_records(&records))
    }

    pub async fn list(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, StoreError> {
        self.store.list(queue, limit).await
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterRecord>, StoreError> {
        self.store.get(id).await
    }

    /// Re-enqueue the original payload into `target` with a fresh attempt
    /// counter, then remove the record.
    ///
    /// The record is only removed once a new job was actually created. A
    /// failed enqueue, or one that collided with a live job under the same
    /// id (`created: false`), leaves it in place.
    pub async fn retry(
        &self,
        id: DeadLetterId,
        target: &QueueClient,
    ) -> Result<JobHandle, DeadLetterError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(DeadLetterError::NotFound(id))?;

        if record.original_queue != target.name() {
            return Err(DeadLetterError::QueueMismatch {
                id,
                expected: record.original_queue,
                actual: target.name(),
            });
        }

        let handle = target
            .enqueue(
                record.payload.clone(),
                EnqueueOptions::default().job_id(record.original_job_id.clone()),
            )
            .await?;

        if !handle.created {
            warn!(
                queue = %record.original_queue,
                job_id = %handle.id,
                dead_letter_id = %id,
                "replay skipped, a live job holds the same id"
            );
            return Ok(handle);
        }
        self.store.remove(id).await?;

        info!(
            queue = %record.original_queue,
            job = %record.original_job_name,
            job_id = %handle.id,
            dead_letter_id = %id,
            "dead-letter record replayed"
        );
        Ok(handle)
    }

    /// Delete a single record without replaying it.
    pub async fn delete(&self, id: DeadLetterId) -> Result<bool, StoreError> {
        self.store.remove(id).await
    }

    /// Remove records older than the retention window.
    pub async fn cleanup(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
        let removed = self.store.remove_failed_before(cutoff).await?;
        if removed > 0 {
            info!(removed, retention_days, "dead-letter cleanup");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ExportCsv, ExportResource};
    use crate::queue::QueueConfig;
    use crate::store::{InMemoryJobStore, JobStore};
    use crate::types::JobState;

    fn export_job(tenant_id: TenantId, now: DateTime<Utc>) -> Job {
        Job::new(
            QueueName::CsvExport,
            JobPayload::ExportCsv(ExportCsv {
                tenant_id,
                export_id: Uuid::now_v7(),
                resource: ExportResource::Cases,
                requested_by: "ana".into(),
            }),
            now,
        )
    }

    fn router() -> DeadLetterRouter {
        DeadLetterRouter::new(InMemoryDeadLetterStore::arc())
    }

    #[tokio::test]
    async fn records_carry_provenance() {
        let router = router();
        let tenant_id = TenantId::new();
        let now = Utc::now();
        let mut job = export_job(tenant_id, now);
        job.attempts_made = 3;

        let record = router
            .move_to_dead_letter(
                QueueName::CsvExport,
                &job,
                &JobError::transient("storage timeout"),
                now,
            )
            .await
            .unwrap();

        assert_eq!(record.original_job_id, job.id);
        assert_eq!(record.original_job_name, "export-csv");
        assert_eq!(record.attempts_made, 3);
        assert_eq!(record.tenant_id, Some(tenant_id));
        assert_eq!(record.failure_reason, "transient failure: storage timeout");
    }

    #[tokio::test]
    async fn stats_group_by_queue_and_tenant() {
        let router = router();
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        let now = Utc::now();
        let err = JobError::permanent("nope");

        for (tenant, offset) in [(t1, 0), (t1, 1), (t2, 2)] {
            let at = now + chrono::Duration::minutes(offset);
            router
                .move_to_dead_letter(QueueName::CsvExport, &export_job(tenant, now), &err, at)
                .await
                .unwrap();
        }

        let stats = router.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_queue.get("csv-export"), Some(&3));
        assert_eq!(stats.by_tenant.get(&t1.to_string()), Some(&2));
        assert_eq!(stats.by_tenant.get(&t2.to_string()), Some(&1));
        assert_eq!(stats.oldest_failure, Some(now));
        assert_eq!(stats.newest_failure, Some(now + chrono::Duration::minutes(2)));
    }

    #[tokio::test]
    async fn retry_reenqueues_with_fresh_attempts() {
        let router = router();
        let store = InMemoryJobStore::arc();
        let queue = QueueClient::new(
            QueueName::CsvExport,
            QueueConfig::for_queue(QueueName::CsvExport),
            store.clone(),
            router.clone(),
        );
        let now = Utc::now();
        let mut job = export_job(TenantId::new(), now);
        job.attempts_made = 3;
        job.state = JobState::Failed;

        let record = router
            .move_to_dead_letter(QueueName::CsvExport, &job, &JobError::transient("x"), now)
            .await
            .unwrap();

        let handle = router.retry(record.id, &queue).await.unwrap();
        assert_eq!(handle.id, job.id);

        let replayed = store.get(QueueName::CsvExport, &handle.id).await.unwrap().unwrap();
        assert_eq!(replayed.attempts_made, 0);
        assert_eq!(replayed.state, JobState::Waiting);
        assert!(router.get(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_keeps_record_when_id_is_still_live() {
        let router = router();
        let queue = QueueClient::new(
            QueueName::CsvExport,
            QueueConfig::for_queue(QueueName::CsvExport),
            InMemoryJobStore::arc(),
            router.clone(),
        );
        let now = Utc::now();
        let job = export_job(TenantId::new(), now);
        let record = router
            .move_to_dead_letter(QueueName::CsvExport, &job, &JobError::transient("x"), now)
            .await
            .unwrap();

        // Same id enqueued again before the operator replays.
        queue
            .enqueue(job.payload.clone(), EnqueueOptions::default().job_id(job.id.clone()))
            .await
            .unwrap();

        let handle = router.retry(record.id, &queue).await.unwrap();
        assert!(!handle.created);
        assert!(router.get(record.id).await.unwrap().is_some());
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn retry_into_wrong_queue_is_rejected() {
        let router = router();
        let queue = QueueClient::new(
            QueueName::ChatNotification,
            QueueConfig::for_queue(QueueName::ChatNotification),
            InMemoryJobStore::arc(),
            router.clone(),
        );
        let now = Utc::now();
        let record = router
            .move_to_dead_letter(
                QueueName::CsvExport,
                &export_job(TenantId::new(), now),
                &JobError::transient("x"),
                now,
            )
            .await
            .unwrap();

        let err = router.retry(record.id, &queue).await.unwrap_err();
        assert!(matches!(err, DeadLetterError::QueueMismatch { .. }));
        assert!(router.get(record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_respects_retention_window() {
        let router = router();
        let now = Utc::now();
        let err = JobError::transient("x");

        for days_ago in [40, 31, 29, 1] {
            let at = now - chrono::Duration::days(days_ago);
            router
                .move_to_dead_letter(QueueName::CsvExport, &export_job(TenantId::new(), at), &err, at)
                .await
                .unwrap();
        }

        assert_eq!(router.cleanup(30, now).await.unwrap(), 2);
        assert_eq!(router.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn list_filters_by_queue_newest_first() {
        let router = router();
        let now = Utc::now();
        let err = JobError::transient("x");
        let older = now - chrono::Duration::minutes(5);

        router
            .move_to_dead_letter(QueueName::CsvExport, &export_job(TenantId::new(), now), &err, older)
            .await
            .unwrap();
        router
            .move_to_dead_letter(QueueName::CsvExport, &export_job(TenantId::new(), now), &err, now)
            .await
            .unwrap();

        let listed = router.list(Some(QueueName::CsvExport), 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].failed_at, now);
        assert!(router.list(Some(QueueName::EmailCampaign), 10).await.unwrap().is_empty());
    }
}
