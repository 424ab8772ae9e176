//! Process wiring: stores, the queue registry, one worker pool per queue,
//! the scheduler lease and the cron schedules. Built once at start-up and
//! handed out by reference.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use caseflow_infra::Settings;
use caseflow_jobs::{
    AdminService, BatchPaginator, CronTicker, DeadLetterRouter, DeadLetterStore,
    InMemoryDeadLetterStore, InMemoryJobStore, InMemoryLeaseStore, InMemoryProgressStore,
    InMemoryRecordStore, IncrementalSync, JobHandler, JobStore, LeaderElector, LeaderGate,
    LeaseStore, ProgressStore, QueueName, QueueRegistry, RecordStore, RenewalHandle,
    ScheduledAction, ScheduledTask, WorkerPoolHandle, WorkerStats,
};

use crate::campaigns::CampaignHandler;
use crate::court_sync::CourtSyncHandler;
use crate::exports::ExportHandler;
use crate::notifications::ChatHandler;
use crate::publications::PublicationHandler;
use crate::schedules::{DailyPublicationMonitor, DeadLetterCleanup, NightlyCourtSync};
use crate::sources::{
    CampaignDirectory, CaseDirectory, ChatNotifier, CourtRecordSource, ExportSource, Mailer,
    ObjectStorage, PublicationSource, RegistrationDirectory,
};

/// Lease guarding every scheduled fan-out.
pub const SCHEDULER_LEASE: &str = "scheduler";

/// External systems the handlers call into.
#[derive(Clone)]
pub struct Collaborators {
    pub cases: Arc<dyn CaseDirectory>,
    pub court: Arc<dyn CourtRecordSource>,
    pub campaigns: Arc<dyn CampaignDirectory>,
    pub mailer: Arc<dyn Mailer>,
    pub registrations: Arc<dyn RegistrationDirectory>,
    pub publications: Arc<dyn PublicationSource>,
    pub exports: Arc<dyn ExportSource>,
    pub storage: Arc<dyn ObjectStorage>,
    pub chat: Arc<dyn ChatNotifier>,
}

/// Shared durable state.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub records: Arc<dyn RecordStore>,
    pub progress: Arc<dyn ProgressStore>,
}

impl Stores {
    /// Process-local stores for tests and single-instance development.
    pub fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            leases: InMemoryLeaseStore::arc(),
            dead_letters: InMemoryDeadLetterStore::arc(),
            records: InMemoryRecordStore::arc(),
            progress: InMemoryProgressStore::arc(),
        }
    }

    /// Redis for queues, leases, dead letters and progress; Postgres for
    /// fingerprinted records.
    #[cfg(feature = "redis")]
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        use caseflow_infra::db::{self, PgRecordStore};
        use caseflow_infra::redis::{
            KeySpace, RedisDeadLetterStore, RedisJobStore, RedisLeaseStore, RedisProgressStore,
            connect,
        };

        let conn = connect(&settings.redis.url)
            .await
            .with_context(|| format!("failed to connect to redis at {}", settings.redis.url))?;
        let keys = KeySpace::new(settings.redis.key_prefix.clone());

        let pool = db::connect(&settings.database)
            .await
            .context("failed to connect to postgres")?;
        db::migrate(&pool)
            .await
            .context("failed to apply record schema")?;

        Ok(Self {
            jobs: Arc::new(RedisJobStore::new(conn.clone(), keys.clone())),
            leases: Arc::new(RedisLeaseStore::new(conn.clone(), keys.clone())),
            dead_letters: Arc::new(RedisDeadLetterStore::new(conn.clone(), &keys)),
            records: Arc::new(PgRecordStore::new(pool)),
            progress: Arc::new(RedisProgressStore::new(conn, keys)),
        })
    }
}

/// Running job subsystem of one instance.
pub struct Runtime {
    registry: Arc<QueueRegistry>,
    admin: AdminService,
    progress: Arc<dyn ProgressStore>,
    renewal: RenewalHandle,
    pools: Vec<WorkerPoolHandle>,
    schedules: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Runtime {
    /// Validate settings, then spawn worker pools, lease renewal and
    /// schedules. Must be called from within a Tokio runtime.
    pub fn start(
        settings: &Settings,
        stores: Stores,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let queue_configs = settings.queue_configs()?;
        let leader_config = settings.leader_config()?;
        let cron = |expr: &str, what: &str| {
            CronTicker::new(expr).with_context(|| format!("invalid {what} schedule {expr:?}"))
        };
        let court_ticker = cron(&settings.schedules.court_sync, "court sync")?;
        let publication_ticker = cron(
            &settings.schedules.publication_monitor,
            "publication monitor",
        )?;
        let cleanup_ticker = cron(
            &settings.schedules.dead_letter_cleanup,
            "dead-letter cleanup",
        )?;

        let router = DeadLetterRouter::new(stores.dead_letters.clone());
        let registry = Arc::new(QueueRegistry::new(
            stores.jobs.clone(),
            router.clone(),
            queue_configs,
        ));
        let sync = IncrementalSync::new(stores.records.clone()).with_mode(settings.sync.mode);
        let cancel = CancellationToken::new();

        let handlers: [(QueueName, Arc<dyn JobHandler>); 5] = [
            (
                QueueName::CourtSync,
                Arc::new(CourtSyncHandler::new(
                    BatchPaginator::new(
                        registry.queue(QueueName::CourtSync).clone(),
                        settings.paginator_config(),
                    ),
                    collaborators.cases.clone(),
                    collaborators.court.clone(),
                    sync.clone(),
                )),
            ),
            (
                QueueName::EmailCampaign,
                Arc::new(CampaignHandler::new(
                    registry.queue(QueueName::EmailCampaign).clone(),
                    collaborators.campaigns.clone(),
                    collaborators.mailer.clone(),
                )),
            ),
            (
                QueueName::PublicationMonitor,
                Arc::new(PublicationHandler::new(
                    registry.queue(QueueName::PublicationMonitor).clone(),
                    collaborators.registrations.clone(),
                    collaborators.publications.clone(),
                    sync,
                    stores.progress.clone(),
                    settings.progress_ttl(),
                )),
            ),
            (
                QueueName::CsvExport,
                Arc::new(ExportHandler::new(
                    collaborators.exports.clone(),
                    collaborators.storage.clone(),
                )),
            ),
            (
                QueueName::ChatNotification,
                Arc::new(ChatHandler::new(collaborators.chat.clone())),
            ),
        ];
        let pools = handlers
            .into_iter()
            .map(|(queue, handler)| registry.queue(queue).process(handler, cancel.child_token()))
            .collect();

        let elector = LeaderElector::new(stores.leases.clone(), settings.instance_id());
        // Not a child of `cancel`: the lease outlives the pools during shutdown.
        let renewal =
            elector.spawn_renewal(SCHEDULER_LEASE, leader_config, CancellationToken::new());
        let gate = LeaderGate::new(elector, SCHEDULER_LEASE, leader_config.ttl);

        let actions: [(CronTicker, Arc<dyn ScheduledAction>); 3] = [
            (
                court_ticker,
                Arc::new(NightlyCourtSync::new(
                    registry.clone(),
                    collaborators.cases.clone(),
                    settings.paginator.batch_size,
                )),
            ),
            (
                publication_ticker,
                Arc::new(DailyPublicationMonitor::new(
                    registry.clone(),
                    collaborators.registrations.clone(),
                    settings.schedules.publication_lookback_days,
                )),
            ),
            (
                cleanup_ticker,
                Arc::new(DeadLetterCleanup::new(
                    router,
                    settings.dead_letter.retention_days,
                )),
            ),
        ];
        let schedules = actions
            .into_iter()
            .map(|(ticker, action)| {
                ScheduledTask::new(Box::new(ticker), action)
                    .leader_gated(gate.clone())
                    .spawn(cancel.child_token())
            })
            .collect();

        info!(instance_id = %settings.instance_id, "job runtime started");
        Ok(Self {
            admin: AdminService::new(registry.clone(), settings.dead_letter.retention_days),
            registry,
            progress: stores.progress,
            renewal,
            pools,
            schedules,
            cancel,
        })
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    /// Progress projections for polling clients.
    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    /// Cached result of the last lease renewal.
    pub fn is_leader(&self) -> bool {
        self.renewal.is_leader()
    }

    pub fn worker_stats(&self) -> Vec<(QueueName, WorkerStats)> {
        self.pools.iter().map(|p| (p.queue(), p.stats())).collect()
    }

    /// Stop schedules, drain in-flight jobs, then release the lease.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for schedule in self.schedules {
            if let Err(e) = schedule.await {
                warn!(error = %e, "scheduled task panicked");
            }
        }
        for pool in self.pools {
            pool.shutdown().await;
        }
        self.renewal.shutdown().await;
        info!("job runtime stopped");
    }
}
