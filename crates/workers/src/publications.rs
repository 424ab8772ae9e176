//! Bar-publication monitoring.
//!
//! `monitor-publications` enqueues one `fetch-publications` per monitored
//! registration. A fetch walks every page of the window, reconciles each page
//! through the fingerprint sync and reports progress as it goes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use caseflow_jobs::{
    EnqueueOptions, FetchPublications, HandlerOutcome, IncrementalSync, Job, JobError, JobHandler,
    JobPayload, MonitorPublications, ProgressStatus, ProgressStore, ProgressTracker, QueueClient,
};

use crate::sources::{PublicationSource, RegistrationDirectory};

/// Pause between page requests to the publication API.
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(500);

pub struct PublicationHandler {
    queue: QueueClient,
    registrations: Arc<dyn RegistrationDirectory>,
    source: Arc<dyn PublicationSource>,
    sync: IncrementalSync,
    progress: Arc<dyn ProgressStore>,
    progress_ttl: Duration,
    page_delay: Duration,
}

impl PublicationHandler {
    pub fn new(
        queue: QueueClient,
        registrations: Arc<dyn RegistrationDirectory>,
        source: Arc<dyn PublicationSource>,
        sync: IncrementalSync,
        progress: Arc<dyn ProgressStore>,
        progress_ttl: Duration,
    ) -> Self {
        Self {
            queue,
            registrations,
            source,
            sync,
            progress,
            progress_ttl,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    async fn monitor(&self, monitor: &MonitorPublications) -> Result<HandlerOutcome, JobError> {
        let registrations = self.registrations.monitored(monitor.tenant_id).await?;
        let now = Utc::now();
        let to = now.date_naive();
        let from = to
            .checked_sub_days(Days::new(u64::from(monitor.lookback_days)))
            .unwrap_or(to);

        let mut outcome = HandlerOutcome::default();
        for registration in registrations {
            let consulta_id = Uuid::now_v7();
            let job_id = format!(
                "fetch-publications:{}:{}:{}:{}",
                monitor.tenant_id, registration.state, registration.number, to
            );
            let payload = JobPayload::FetchPublications(FetchPublications {
                tenant_id: monitor.tenant_id,
                consulta_id,
                registration,
                from,
                to,
            });

            let handle = match self
                .queue
                .enqueue(payload, EnqueueOptions::default().job_id(job_id.clone()))
                .await
            {
                Ok(handle) => handle,
                Err(e) if e.is_rejection() => {
                    warn!(%job_id, error = %e, "registration rejected");
                    outcome.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if handle.created {
                let status = ProgressStatus::queued(consulta_id, monitor.tenant_id, now);
                if let Err(e) = self.progress.put(&status, self.progress_ttl).await {
                    warn!(%consulta_id, error = %e, "failed to publish queued progress");
                }
                outcome.enqueued += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        info!(
            tenant_id = %monitor.tenant_id,
            enqueued = outcome.enqueued,
            skipped = outcome.skipped,
            rejected = outcome.rejected,
            %from,
            %to,
            "publication scan scheduled"
        );
        Ok(outcome)
    }

    async fn fetch(
        &self,
        job: &Job,
        fetch: &FetchPublications,
    ) -> Result<HandlerOutcome, JobError> {
        let mut tracker = ProgressTracker::new(
            self.progress.clone(),
            self.progress_ttl,
            fetch.consulta_id,
            fetch.tenant_id,
        );

        match self.fetch_pages(fetch, &mut tracker).await {
            Ok(outcome) => {
                tracker.complete().await;
                Ok(outcome)
            }
            Err(e) if self.queue.is_final_failure(job, &e) => {
                tracker.fail(e.to_string()).await;
                Err(e)
            }
            Err(e) => {
                tracker.retry_pending(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn fetch_pages(
        &self,
        fetch: &FetchPublications,
        tracker: &mut ProgressTracker,
    ) -> Result<HandlerOutcome, JobError> {
        let entity_id = fetch.registration.entity_id();
        let mut inserted = 0;
        let mut skipped = 0;

        let mut page = 1;
        let mut total_pages = None;
        loop {
            let result = self
                .source
                .page(&fetch.registration, fetch.from, fetch.to, page)
                .await?;
            if total_pages.is_none() {
                total_pages = Some(result.total_pages);
                tracker.start(Some(result.total_pages)).await;
            }

            let found = result.records.len() as u64;
            let report = self
                .sync
                .reconcile(fetch.tenant_id, entity_id, result.records, Utc::now())
                .await?;
            inserted += report.inserted;
            skipped += report.skipped;
            tracker.page_done(found).await;

            if page >= total_pages.unwrap_or(0) {
                break;
            }
            page += 1;
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        info!(
            tenant_id = %fetch.tenant_id,
            registration = %fetch.registration,
            pages = page,
            inserted,
            skipped,
            "publications fetched"
        );
        Ok(HandlerOutcome::synced(inserted, skipped))
    }
}

#[async_trait]
impl JobHandler for PublicationHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        match &job.payload {
            JobPayload::MonitorPublications(monitor) => self.monitor(monitor).await,
            JobPayload::FetchPublications(fetch) => self.fetch(job, fetch).await,
            other => Err(JobError::permanent(format!(
                "publication-monitor cannot handle {}",
                other.job_name()
            ))),
        }
    }
}
