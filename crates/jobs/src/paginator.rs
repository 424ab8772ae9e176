//! Batch paginator: turns "resync everything for a tenant" into paced pages
//! of item jobs.
//!
//! Each batch job fetches one page (oldest-synced first), enqueues an item
//! job per entity with random jitter, and, only if entities remain past the
//! page, enqueues the next batch job with a fixed delay. The inter-batch
//! delay is what bounds the admission rate; it is independent of how fast
//! workers drain the queue.
//!
//! Pages are addressed by a keyset cursor rather than a numeric offset. Item
//! jobs re-sort their entity to the end of the order while the scan is still
//! running, which would shift every later offset.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use caseflow_core::{EntityId, TenantId};

use crate::error::JobError;
use crate::payload::JobPayload;
use crate::queue::{EnqueueOptions, QueueClient};
use crate::types::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginatorConfig {
    pub batch_size: usize,
    /// Delay before the next batch job becomes visible
    pub batch_delay: Duration,
    /// Upper bound of the per-item random delay
    pub max_item_jitter: Duration,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_secs(60),
            max_item_jitter: Duration::from_secs(5),
        }
    }
}

/// Position of an entity in an oldest-first scan. Never-synced entities sort
/// first; the entity id breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanKey {
    pub last_synced_at: Option<DateTime<Utc>>,
    pub entity_id: EntityId,
}

/// Where a tenant scan resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Entities synced at or after this instant are out of scope
    pub started_at: DateTime<Utc>,
    /// Key of the last entity already dispatched; `None` on the first page
    pub after: Option<ScanKey>,
}

impl ScanCursor {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            after: None,
        }
    }

    /// Whether an entity at `key` is still ahead of this cursor.
    pub fn admits(&self, key: &ScanKey) -> bool {
        key.last_synced_at.is_none_or(|at| at < self.started_at)
            && self.after.as_ref().is_none_or(|after| key > after)
    }

    fn advanced_to(self, key: ScanKey) -> Self {
        Self {
            after: Some(key),
            ..self
        }
    }
}

/// One entity to enqueue as an item job.
#[derive(Debug, Clone, PartialEq)]
pub struct PageItem {
    pub payload: JobPayload,
    /// Stable id so a re-run batch does not enqueue the same item twice
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<PageItem>,
    /// Key of the last entity on the page
    pub last: Option<ScanKey>,
    /// Entities the cursor still admits after this page
    pub remaining: usize,
}

/// Where the pages come from, and how to describe the next batch.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// The first `limit` entities admitted by `cursor`, in key order.
    async fn fetch_page(
        &self,
        tenant_id: TenantId,
        cursor: &ScanCursor,
        limit: usize,
    ) -> Result<Page, JobError>;

    /// Batch job resuming at `cursor`.
    fn continuation(&self, tenant_id: TenantId, cursor: ScanCursor, batch_size: usize) -> PageItem;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Item jobs newly enqueued
    pub dispatched: usize,
    /// Item jobs already pending under the same id
    pub duplicates: usize,
    /// Items whose payload the queue refused
    pub rejected: usize,
    /// Cursor of the enqueued follow-up batch, if any
    pub next: Option<ScanCursor>,
}

/// Runs one batch step against a queue.
#[derive(Debug, Clone)]
pub struct BatchPaginator {
    queue: QueueClient,
    config: PaginatorConfig,
}

impl BatchPaginator {
    pub fn new(queue: QueueClient, config: PaginatorConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &PaginatorConfig {
        &self.config
    }

    /// Dispatch the page at `cursor`. A zero `batch_size` falls back to the
    /// configured one.
    ///
    /// An item the queue refuses is logged and counted; it does not stop the
    /// rest of the page or the continuation. Store failures propagate.
    pub async fn run_batch(
        &self,
        source: &dyn PageSource,
        tenant_id: TenantId,
        cursor: &ScanCursor,
        batch_size: usize,
    ) -> Result<BatchOutcome, JobError> {
        let batch_size = if batch_size == 0 {
            self.config.batch_size
        } else {
            batch_size
        };

        let page = source.fetch_page(tenant_id, cursor, batch_size).await?;
        let mut outcome = BatchOutcome {
            dispatched: 0,
            duplicates: 0,
            rejected: 0,
            next: None,
        };
        if page.items.is_empty() {
            info!(%tenant_id, "batch scan finished");
            return Ok(outcome);
        }

        for item in page.items {
            let job_id = item.job_id.clone();
            let mut options = EnqueueOptions::default().delay(self.jitter());
            options.job_id = item.job_id;
            match self.queue.enqueue(item.payload, options).await {
                Ok(handle) if handle.created => outcome.dispatched += 1,
                Ok(_) => outcome.duplicates += 1,
                Err(e) if e.is_rejection() => {
                    warn!(%tenant_id, job_id = ?job_id, error = %e, "page item rejected");
                    outcome.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(last) = page.last.filter(|_| page.remaining > 0) {
            let next = cursor.advanced_to(last);
            let item = source.continuation(tenant_id, next, batch_size);
            let mut options = EnqueueOptions::default().delay(self.config.batch_delay);
            options.job_id = item.job_id;
            self.queue.enqueue(item.payload, options).await?;
            outcome.next = Some(next);
        }

        info!(
            %tenant_id,
            dispatched = outcome.dispatched,
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            remaining = page.remaining,
            "batch dispatched"
        );
        Ok(outcome)
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.config.max_item_jitter.as_millis()).unwrap_or(u64::MAX);
        let ms = rand::rng().random_range(0..=max_ms);
        debug!(jitter_ms = ms, "item jitter");
        Duration::from_millis(ms)
    }
}
