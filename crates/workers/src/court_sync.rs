//! Court-record sync: `sync-batch` pages through a tenant's cases, each
//! `sync-case` fetches one process and reconciles its movements.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use caseflow_core::TenantId;
use caseflow_jobs::{
    BatchPaginator, HandlerOutcome, IncrementalSync, Job, JobError, JobHandler, JobId, JobPayload,
    Page, PageItem, PageSource, ScanCursor, SyncBatch, SyncCase,
};

use crate::sources::{CaseDirectory, CaseRef, CourtRecordSource};

/// Stable id of a case item job; a re-run batch cannot enqueue it twice.
pub fn sync_case_job_id(case: &SyncCase) -> JobId {
    format!("sync-case:{}:{}", case.tenant_id, case.case_id).into()
}

/// Pages of `sync-case` items drawn from the case directory.
pub struct CasePages {
    directory: Arc<dyn CaseDirectory>,
}

impl CasePages {
    pub fn new(directory: Arc<dyn CaseDirectory>) -> Self {
        Self { directory }
    }
}

/// Stable id of a batch job; a tenant already mid-scan at the same position
/// is left alone.
pub fn sync_batch_job_id(tenant_id: TenantId, cursor: &ScanCursor) -> JobId {
    match &cursor.after {
        None => format!("sync-batch:{tenant_id}:start"),
        Some(key) => format!(
            "sync-batch:{tenant_id}:{}:{}",
            cursor.started_at.timestamp_millis(),
            key.entity_id
        ),
    }
    .into()
}

#[async_trait]
impl PageSource for CasePages {
    async fn fetch_page(
        &self,
        tenant_id: TenantId,
        cursor: &ScanCursor,
        limit: usize,
    ) -> Result<Page, JobError> {
        let page = self.directory.page(tenant_id, cursor, limit).await?;
        let last = page.cases.last().map(CaseRef::scan_key);
        let items = page
            .cases
            .into_iter()
            .map(|case| {
                let item = SyncCase {
                    tenant_id,
                    case_id: case.case_id,
                    process_number: case.process_number,
                };
                PageItem {
                    job_id: Some(sync_case_job_id(&item)),
                    payload: JobPayload::SyncCase(item),
                }
            })
            .collect();
        Ok(Page {
            items,
            last,
            remaining: page.remaining,
        })
    }

    fn continuation(&self, tenant_id: TenantId, cursor: ScanCursor, batch_size: usize) -> PageItem {
        PageItem {
            job_id: Some(sync_batch_job_id(tenant_id, &cursor)),
            payload: JobPayload::SyncBatch(SyncBatch {
                tenant_id,
                cursor,
                batch_size,
            }),
        }
    }
}

pub struct CourtSyncHandler {
    paginator: BatchPaginator,
    pages: CasePages,
    directory: Arc<dyn CaseDirectory>,
    court: Arc<dyn CourtRecordSource>,
    sync: IncrementalSync,
}

impl CourtSyncHandler {
    pub fn new(
        paginator: BatchPaginator,
        directory: Arc<dyn CaseDirectory>,
        court: Arc<dyn CourtRecordSource>,
        sync: IncrementalSync,
    ) -> Self {
        Self {
            paginator,
            pages: CasePages::new(directory.clone()),
            directory,
            court,
            sync,
        }
    }

    async fn sync_batch(&self, batch: &SyncBatch) -> Result<HandlerOutcome, JobError> {
        let outcome = self
            .paginator
            .run_batch(&self.pages, batch.tenant_id, &batch.cursor, batch.batch_size)
            .await?;

        let note = match outcome.next.and_then(|next| next.after) {
            Some(key) => format!("next batch after case {}", key.entity_id),
            None => "scan finished".to_string(),
        };
        Ok(HandlerOutcome {
            enqueued: outcome.dispatched as u64,
            skipped: outcome.duplicates as u64,
            rejected: outcome.rejected as u64,
            ..HandlerOutcome::default()
        }
        .with_note(note))
    }

    async fn sync_case(&self, case: &SyncCase) -> Result<HandlerOutcome, JobError> {
        let movements = self.court.movements(&case.process_number).await?;
        debug!(
            tenant_id = %case.tenant_id,
            case_id = %case.case_id,
            fetched = movements.len(),
            "fetched court movements"
        );

        let now = Utc::now();
        let report = self
            .sync
            .reconcile(case.tenant_id, case.case_id, movements, now)
            .await?;
        self.directory
            .mark_synced(case.tenant_id, case.case_id, now)
            .await?;

        Ok(HandlerOutcome::synced(report.inserted, report.skipped))
    }
}

#[async_trait]
impl JobHandler for CourtSyncHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        match &job.payload {
            JobPayload::SyncBatch(batch) => self.sync_batch(batch).await,
            JobPayload::SyncCase(case) => self.sync_case(case).await,
            other => Err(JobError::permanent(format!(
                "court-sync cannot handle {}",
                other.job_name()
            ))),
        }
    }
}
