//! Queue client: enqueue, retry bookkeeping and dead-letter escalation for
//! one work domain.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dead_letter::{DeadLetterId, DeadLetterRouter};
use crate::error::{JobError, QueueError, StoreError};
use crate::payload::JobPayload;
use crate::store::{JobStore, PushOutcome, QueueCounts};
use crate::types::{Job, JobId, JobState, QueueName, RetryPolicy};
use crate::worker::{JobHandler, WorkerPool, WorkerPoolHandle};

/// What to do with a failure classified as permanent.
///
/// `ConsumeBudget` treats it like any transient failure (backoff until
/// `max_attempts`); `DeadLetterImmediately` skips the remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentErrorPolicy {
    #[default]
    ConsumeBudget,
    DeadLetterImmediately,
}

/// Per-queue runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Concurrent handler slots per instance
    pub concurrency: usize,
    /// Retry policy stamped on every job at enqueue
    pub retry: RetryPolicy,
    /// How long a popped job stays hidden before it can be reclaimed
    pub visibility_timeout: Duration,
    /// Completed job records retained for introspection
    pub keep_completed: usize,
    pub permanent_errors: PermanentErrorPolicy,
    /// Idle poll interval for worker slots
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            retry: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(5 * 60),
            keep_completed: 1000,
            permanent_errors: PermanentErrorPolicy::default(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    /// Defaults tuned per work domain.
    pub fn for_queue(queue: QueueName) -> Self {
        let base = Self::default();
        match queue {
            QueueName::CourtSync => Self {
                concurrency: 5,
                retry: RetryPolicy::exponential(3, Duration::from_secs(5), Duration::from_secs(600)),
                ..base
            },
            QueueName::EmailCampaign => Self {
                concurrency: 10,
                retry: RetryPolicy::exponential(5, Duration::from_secs(10), Duration::from_secs(1800)),
                ..base
            },
            // A single fetch may walk several years of publications page by page.
            QueueName::PublicationMonitor => Self {
                concurrency: 2,
                retry: RetryPolicy::exponential(3, Duration::from_secs(30), Duration::from_secs(600)),
                visibility_timeout: Duration::from_secs(30 * 60),
                ..base
            },
            QueueName::CsvExport => Self {
                concurrency: 2,
                retry: RetryPolicy::exponential(3, Duration::from_secs(5), Duration::from_secs(300)),
                visibility_timeout: Duration::from_secs(15 * 60),
                keep_completed: 200,
                ..base
            },
            QueueName::ChatNotification => Self {
                concurrency: 5,
                retry: RetryPolicy::exponential(5, Duration::from_secs(2), Duration::from_secs(60)),
                ..base
            },
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_permanent_errors(mut self, policy: PermanentErrorPolicy) -> Self {
        self.permanent_errors = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Options for a single enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    /// Caller-chosen id; a second enqueue with an id still pending is a no-op
    pub job_id: Option<JobId>,
    pub priority: Option<u8>,
}

impl EnqueueOptions {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Returned by enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: QueueName,
    pub name: &'static str,
    /// `false` when a pending job with the same id already existed
    pub created: bool,
    pub delay_until: Option<DateTime<Utc>>,
}

/// Outcome of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { attempt: u32, delay: Duration },
    DeadLettered { record_id: DeadLetterId },
}

/// One client per work domain, wrapping the shared job store.
#[derive(Clone)]
pub struct QueueClient {
    name: QueueName,
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    dead_letters: DeadLetterRouter,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueClient {
    pub fn new(
        name: QueueName,
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        dead_letters: DeadLetterRouter,
    ) -> Self {
        Self {
            name,
            config,
            store,
            dead_letters,
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter {
        &self.dead_letters
    }

    /// Validate and push a job. Store failures propagate to the caller.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        self.enqueue_at(payload, options, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<JobHandle, QueueError> {
        let job_name = payload.job_name();
        if payload.queue() != self.name {
            return Err(QueueError::WrongQueue {
                job: job_name,
                expected: payload.queue(),
                actual: self.name,
            });
        }
        payload
            .validate()
            .map_err(|source| QueueError::InvalidPayload {
                job: job_name,
                source,
            })?;

        let mut job = Job::new(self.name, payload, now)
            .with_retry_policy(self.config.retry.clone())
            .with_priority(options.priority.unwrap_or(0))
            .delayed(options.delay.unwrap_or_default(), now);
        if let Some(id) = options.job_id {
            job = job.with_id(id);
        }

        let handle = JobHandle {
            id: job.id.clone(),
            queue: self.name,
            name: job_name,
            created: true,
            delay_until: job.delay_until,
        };

        match self.store.push(job).await? {
            PushOutcome::Created => {
                debug!(queue = %self.name, job = job_name, job_id = %handle.id, "job enqueued");
                Ok(handle)
            }
            PushOutcome::Duplicate => {
                debug!(queue = %self.name, job = job_name, job_id = %handle.id, "duplicate job id, skipped");
                Ok(JobHandle {
                    created: false,
                    delay_until: None,
                    ..handle
                })
            }
        }
    }

    /// Reclaim stalled jobs, then pop the next visible one.
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let reclaimed = self.store.reclaim_stalled(self.name, now).await?;
        if reclaimed > 0 {
            warn!(queue = %self.name, reclaimed, "reclaimed jobs past their visibility timeout");
        }
        self.store
            .pop_ready(self.name, now, self.config.visibility_timeout)
            .await
    }

    /// Acknowledge a successful attempt.
    pub async fn complete(
        &self,
        mut job: Job,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        job.mark_completed(started_at, finished_at);
        self.store.complete(&job, self.config.keep_completed).await?;

        info!(
            queue = %self.name,
            job = job.name(),
            job_id = %job.id,
            duration_ms = duration_ms(started_at, finished_at),
            "job completed"
        );
        Ok(())
    }

    /// Record a failed attempt: reschedule with backoff, or dead-letter
    /// once the budget is exhausted.
    ///
    /// The dead-letter record is persisted before the job is dropped from the
    /// queue; if that write fails the error propagates and the job stays
    /// active until its visibility timeout makes it reclaimable.
    pub async fn fail(
        &self,
        mut job: Job,
        error: &JobError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueError> {
        let exhaust = self.skips_budget(error);
        let retry_in = job.mark_failed(error.to_string(), started_at, finished_at, exhaust);
        let elapsed = duration_ms(started_at, finished_at);

        if let Some(delay) = retry_in {
            self.store.reschedule(&job).await?;
            warn!(
                queue = %self.name,
                job = job.name(),
                job_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts(),
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                duration_ms = elapsed,
                error = %error,
                "job failed, retry scheduled"
            );
            return Ok(FailureDisposition::Retry {
                attempt: job.attempts_made,
                delay,
            });
        }

        let record = self
            .dead_letters
            .move_to_dead_letter(self.name, &job, error, finished_at)
            .await
            .map_err(|e| QueueError::DeadLetter(e.to_string()))?;
        self.store.discard_failed(&job).await?;

        warn!(
            queue = %self.name,
            job = job.name(),
            job_id = %job.id,
            attempt = job.attempts_made,
            duration_ms = elapsed,
            "job failed permanently"
        );
        Ok(FailureDisposition::DeadLettered {
            record_id: record.id,
        })
    }

    /// Whether failing the claimed `job` with `error` would dead-letter it
    /// rather than schedule another attempt.
    pub fn is_final_failure(&self, job: &Job, error: &JobError) -> bool {
        self.skips_budget(error) || !job.retry_policy.should_retry(job.attempts_made + 1)
    }

    fn skips_budget(&self, error: &JobError) -> bool {
        matches!(error, JobError::InvalidPayload(_))
            || (self.config.permanent_errors == PermanentErrorPolicy::DeadLetterImmediately
                && error.is_permanent())
    }

    /// Run `handler` on this queue with `config.concurrency` slots.
    pub fn process(
        &self,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> WorkerPoolHandle {
        WorkerPool::new(self.clone(), handler).spawn(cancel)
    }

    pub async fn stats(&self) -> Result<QueueCounts, StoreError> {
        self.store.counts(self.name).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(self.name, id).await
    }

    pub async fn list(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.store.list(self.name, state, limit).await
    }

    /// Remove a pending job.
    pub async fn remove(&self, id: &JobId) -> Result<bool, StoreError> {
        self.store.remove(self.name, id).await
    }
}

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::InMemoryDeadLetterStore;
    use crate::payload::{ChatNotification, SyncCase};
    use crate::store::InMemoryJobStore;
    use async_trait::async_trait;
    use caseflow_core::{EntityId, TenantId};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store that can be switched into an outage.
    #[derive(Default)]
    struct Flaky {
        inner: InMemoryJobStore,
        down: AtomicBool,
    }

    impl Flaky {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl JobStore for Flaky {
        async fn push(&self, job: Job) -> Result<PushOutcome, StoreError> {
            self.check()?;
            self.inner.push(job).await
        }

        async fn pop_ready(
            &self,
            queue: QueueName,
            now: DateTime<Utc>,
            visibility_timeout: Duration,
        ) -> Result<Option<Job>, StoreError> {
            self.check()?;
            self.inner.pop_ready(queue, now, visibility_timeout).await
        }

        async fn reschedule(&self, job: &Job) -> Result<(), StoreError> {
            self.check()?;
            self.inner.reschedule(job).await
        }

        async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
            self.check()?;
            self.inner.complete(job, keep).await
        }

        async fn discard_failed(&self, job: &Job) -> Result<(), StoreError> {
            self.check()?;
            self.inner.discard_failed(job).await
        }

        async fn reclaim_stalled(
            &self,
            queue: QueueName,
            now: DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.reclaim_stalled(queue, now).await
        }

        async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, StoreError> {
            self.check()?;
            self.inner.get(queue, id).await
        }

        async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError> {
            self.check()?;
            self.inner.counts(queue).await
        }

        async fn list(
            &self,
            queue: QueueName,
            state: JobState,
            limit: usize,
        ) -> Result<Vec<Job>, StoreError> {
            self.check()?;
            self.inner.list(queue, state, limit).await
        }

        async fn remove(&self, queue: QueueName, id: &JobId) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.remove(queue, id).await
        }
    }

    fn chat(text: &str) -> JobPayload {
        JobPayload::ChatNotification(ChatNotification {
            tenant_id: None,
            channel: "#ops".into(),
            text: text.into(),
        })
    }

    fn client(config: QueueConfig) -> (QueueClient, DeadLetterRouter) {
        let router = DeadLetterRouter::new(InMemoryDeadLetterStore::arc());
        let client = QueueClient::new(
            QueueName::ChatNotification,
            config,
            InMemoryJobStore::arc(),
            router.clone(),
        );
        (client, router)
    }

    #[tokio::test]
    async fn enqueue_rejects_foreign_payloads() {
        let (queue, _) = client(QueueConfig::default());
        let payload = JobPayload::SyncCase(SyncCase {
            tenant_id: TenantId::new(),
            case_id: EntityId::new(),
            process_number: "0001234-56.2023.8.26.0100".into(),
        });

        let err = queue.enqueue(payload, EnqueueOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::WrongQueue {
                expected: QueueName::CourtSync,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_payloads() {
        let (queue, _) = client(QueueConfig::default());
        let err = queue
            .enqueue(chat("   "), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload { job: "chat-notification", .. }));
    }

    #[tokio::test]
    async fn enqueue_with_same_id_is_idempotent() {
        let (queue, _) = client(QueueConfig::default());

        let first = queue
            .enqueue(chat("a"), EnqueueOptions::default().job_id("notify-1"))
            .await
            .unwrap();
        let second = queue
            .enqueue(chat("b"), EnqueueOptions::default().job_id("notify-1"))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn delayed_enqueue_reports_visibility() {
        let (queue, _) = client(QueueConfig::default());
        let now = Utc::now();

        let handle = queue
            .enqueue_at(chat("later"), EnqueueOptions::default().delay(Duration::from_secs(60)), now)
            .await
            .unwrap();

        assert_eq!(handle.delay_until, Some(now + chrono::Duration::seconds(60)));
        assert!(queue.claim(now).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn permanent_errors_consume_budget_by_default() {
        let (queue, router) = client(QueueConfig::default());
        let now = Utc::now();
        queue.enqueue_at(chat("x"), EnqueueOptions::default(), now).await.unwrap();

        let job = queue.claim(now).await.unwrap().unwrap();
        let disposition = queue
            .fail(job, &JobError::permanent("channel archived"), now, now)
            .await
            .unwrap();

        assert!(matches!(disposition, FailureDisposition::Retry { attempt: 1, .. }));
        assert_eq!(router.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn permanent_errors_can_skip_the_budget() {
        let config =
            QueueConfig::default().with_permanent_errors(PermanentErrorPolicy::DeadLetterImmediately);
        let (queue, router) = client(config);
        let now = Utc::now();
        queue.enqueue_at(chat("x"), EnqueueOptions::default(), now).await.unwrap();

        let job = queue.claim(now).await.unwrap().unwrap();
        let disposition = queue
            .fail(job, &JobError::permanent("channel archived"), now, now)
            .await
            .unwrap();

        assert!(matches!(disposition, FailureDisposition::DeadLettered { .. }));
        let stats = router.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(queue.stats().await.unwrap().failed, 1);

        // Transient errors still retry under this policy.
        queue.enqueue_at(chat("y"), EnqueueOptions::default(), now).await.unwrap();
        let job = queue.claim(now).await.unwrap().unwrap();
        let disposition = queue
            .fail(job, &JobError::transient("503"), now, now)
            .await
            .unwrap();
        assert!(matches!(disposition, FailureDisposition::Retry { .. }));
    }

    #[tokio::test]
    async fn store_outages_reach_the_caller() {
        let store = Arc::new(Flaky::default());
        let router = DeadLetterRouter::new(InMemoryDeadLetterStore::arc());
        let queue = QueueClient::new(
            QueueName::ChatNotification,
            QueueConfig::default(),
            store.clone(),
            router.clone(),
        );
        let now = Utc::now();
        let handle = queue.enqueue_at(chat("x"), EnqueueOptions::default(), now).await.unwrap();
        let job = queue.claim(now).await.unwrap().unwrap();

        store.down.store(true, Ordering::SeqCst);
        let err = queue
            .enqueue_at(chat("y"), EnqueueOptions::default(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(StoreError::Unavailable(_))));
        assert!(matches!(queue.claim(now).await, Err(StoreError::Unavailable(_))));
        let err = queue
            .fail(job, &JobError::transient("503"), now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(StoreError::Unavailable(_))));

        // Nothing was half-written: the claimed job is still active and
        // untouched, the rejected enqueue left no trace.
        store.down.store(false, Ordering::SeqCst);
        let counts = queue.stats().await.unwrap();
        assert_eq!((counts.waiting, counts.delayed, counts.active), (0, 0, 1));
        let active = queue.get(&handle.id).await.unwrap().unwrap();
        assert_eq!(active.state, JobState::Active);
        assert_eq!(active.attempts_made, 0);
        assert_eq!(router.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn final_failure_follows_budget_and_policy() {
        let config =
            QueueConfig::default().with_retry(RetryPolicy::fixed(2, Duration::from_secs(1)));
        let (queue, _) = client(config.clone());
        let now = Utc::now();
        let transient = JobError::transient("503");
        queue.enqueue_at(chat("x"), EnqueueOptions::default(), now).await.unwrap();

        let job = queue.claim(now).await.unwrap().unwrap();
        assert!(!queue.is_final_failure(&job, &transient));
        queue.fail(job, &transient, now, now).await.unwrap();

        let later = now + chrono::Duration::seconds(2);
        let job = queue.claim(later).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert!(queue.is_final_failure(&job, &transient));

        let (strict, _) =
            client(config.with_permanent_errors(PermanentErrorPolicy::DeadLetterImmediately));
        strict.enqueue_at(chat("y"), EnqueueOptions::default(), now).await.unwrap();
        let job = strict.claim(now).await.unwrap().unwrap();
        assert!(strict.is_final_failure(&job, &JobError::permanent("channel archived")));
        assert!(!strict.is_final_failure(&job, &transient));
    }

    #[test]
    fn domain_defaults_stay_within_observed_concurrency() {
        for queue in QueueName::ALL {
            let config = QueueConfig::for_queue(queue);
            assert!((2..=10).contains(&config.concurrency), "{queue}");
            assert!(config.retry.max_attempts >= 3);
        }
    }
}
