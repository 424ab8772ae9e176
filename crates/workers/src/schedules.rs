//! Scheduled fan-out. Every instance ticks; the leader gate decides which
//! one acts. Duplicate runs across a lease hand-over are absorbed by job id
//! dedup and the idempotent item handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use caseflow_jobs::{
    DeadLetterRouter, EnqueueOptions, JobError, JobPayload, MonitorPublications, QueueRegistry,
    ScanCursor, ScheduledAction, SyncBatch,
};

use crate::court_sync::sync_batch_job_id;
use crate::sources::{CaseDirectory, RegistrationDirectory};

/// Enqueues the first `sync-batch` of every tenant.
pub struct NightlyCourtSync {
    registry: Arc<QueueRegistry>,
    cases: Arc<dyn CaseDirectory>,
    batch_size: usize,
}

impl NightlyCourtSync {
    pub fn new(
        registry: Arc<QueueRegistry>,
        cases: Arc<dyn CaseDirectory>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            cases,
            batch_size,
        }
    }
}

#[async_trait]
impl ScheduledAction for NightlyCourtSync {
    fn name(&self) -> &str {
        "nightly-court-sync"
    }

    async fn run(&self, fired_at: DateTime<Utc>) -> Result<(), JobError> {
        let tenants = self.cases.tenants().await?;
        let cursor = ScanCursor::start(fired_at);
        let mut started = 0;
        for tenant_id in tenants {
            // A tenant whose first batch is still pending is left alone.
            let options = EnqueueOptions::default().job_id(sync_batch_job_id(tenant_id, &cursor));
            let payload = JobPayload::SyncBatch(SyncBatch {
                tenant_id,
                cursor,
                batch_size: self.batch_size,
            });
            if self.registry.enqueue(payload, options).await?.created {
                started += 1;
            }
        }
        info!(started, "court sync scans started");
        Ok(())
    }
}

/// Enqueues a `monitor-publications` per tenant, once per day.
pub struct DailyPublicationMonitor {
    registry: Arc<QueueRegistry>,
    registrations: Arc<dyn RegistrationDirectory>,
    lookback_days: u32,
}

impl DailyPublicationMonitor {
    pub fn new(
        registry: Arc<QueueRegistry>,
        registrations: Arc<dyn RegistrationDirectory>,
        lookback_days: u32,
    ) -> Self {
        Self {
            registry,
            registrations,
            lookback_days: lookback_days.max(1),
        }
    }
}

#[async_trait]
impl ScheduledAction for DailyPublicationMonitor {
    fn name(&self) -> &str {
        "daily-publication-monitor"
    }

    async fn run(&self, fired_at: DateTime<Utc>) -> Result<(), JobError> {
        let day = fired_at.date_naive();
        let tenants = self.registrations.tenants().await?;
        let mut started = 0;
        for tenant_id in tenants {
            let options =
                EnqueueOptions::default().job_id(format!("monitor-publications:{tenant_id}:{day}"));
            let payload = JobPayload::MonitorPublications(MonitorPublications {
                tenant_id,
                lookback_days: self.lookback_days,
            });
            if self.registry.enqueue(payload, options).await?.created {
                started += 1;
            }
        }
        info!(started, %day, "publication monitoring scheduled");
        Ok(())
    }
}

/// Drops dead letters older than the retention window.
pub struct DeadLetterCleanup {
    router: DeadLetterRouter,
    retention_days: u32,
}

impl DeadLetterCleanup {
    pub fn new(router: DeadLetterRouter, retention_days: u32) -> Self {
        Self {
            router,
            retention_days,
        }
    }
}

#[async_trait]
impl ScheduledAction for DeadLetterCleanup {
    fn name(&self) -> &str {
        "dead-letter-cleanup"
    }

    async fn run(&self, fired_at: DateTime<Utc>) -> Result<(), JobError> {
        let removed = self.router.cleanup(self.retention_days, fired_at).await?;
        if removed > 0 {
            warn!(removed, retention_days = self.retention_days, "expired dead letters removed");
        }
        Ok(())
    }
}
