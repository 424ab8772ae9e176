//! Worker pool: N concurrent handler slots per queue.
//!
//! A slot loops claim → handle → acknowledge. A returned `Err` is the only
//! failure signal; the queue client turns it into a retry or a dead letter.
//! Shutdown is cooperative: a slot finishes the job it holds before exiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dead_letter::DeadLetterId;
use crate::error::{JobError, QueueError};
use crate::queue::{FailureDisposition, QueueClient};
use crate::types::{Job, JobId, QueueName};

/// Structured result of a successful handler run, for logs and metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerOutcome {
    pub synced: u64,
    pub skipped: u64,
    /// Follow-up jobs this run enqueued
    pub enqueued: u64,
    /// Follow-up jobs refused at enqueue (invalid payload), logged and dropped
    pub rejected: u64,
    pub note: Option<String>,
}

impl HandlerOutcome {
    pub fn synced(synced: u64, skipped: u64) -> Self {
        Self {
            synced,
            skipped,
            ..Self::default()
        }
    }

    pub fn enqueued(enqueued: u64) -> Self {
        Self {
            enqueued,
            ..Self::default()
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Business logic for one queue. Dispatch on `job.payload`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError>;
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Completed {
        job_id: JobId,
        outcome: HandlerOutcome,
    },
    Retrying {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
    },
    DeadLettered {
        job_id: JobId,
        record_id: DeadLetterId,
    },
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn record(&self, run: &JobRun) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match run {
            JobRun::Completed { .. } => &self.succeeded,
            JobRun::Retrying { .. } => &self.retried,
            JobRun::DeadLettered { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    queue: QueueName,
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPoolHandle {
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Stop claiming new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(queue = %self.queue, error = %e, "worker slot panicked");
            }
        }
        info!(queue = %self.queue, "worker pool stopped");
    }
}

/// Pool of handler slots bound to one queue.
#[derive(Clone)]
pub struct WorkerPool {
    queue: QueueClient,
    handler: Arc<dyn JobHandler>,
}

impl WorkerPool {
    pub fn new(queue: QueueClient, handler: Arc<dyn JobHandler>) -> Self {
        Self { queue, handler }
    }

    /// Claim and execute at most one job.
    ///
    /// `now` is the claim instant; the finish instant adds the handler's
    /// elapsed time.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<JobRun>, QueueError> {
        let Some(job) = self.queue.claim(now).await? else {
            return Ok(None);
        };

        debug!(
            queue = %self.queue.name(),
            job = job.name(),
            job_id = %job.id,
            attempt = job.attempts_made + 1,
            "claimed job"
        );

        let clock = tokio::time::Instant::now();
        let result = match job.payload.validate() {
            Ok(()) => self.handler.handle(&job).await,
            Err(e) => Err(JobError::InvalidPayload(e)),
        };
        let finished = now + crate::types::to_chrono(clock.elapsed());
        let job_id = job.id.clone();

        match result {
            Ok(outcome) => {
                debug!(
                    queue = %self.queue.name(),
                    job_id = %job_id,
                    synced = outcome.synced,
                    skipped = outcome.skipped,
                    enqueued = outcome.enqueued,
                    "handler succeeded"
                );
                self.queue.complete(job, now, finished).await?;
                Ok(Some(JobRun::Completed { job_id, outcome }))
            }
            Err(err) => match self.queue.fail(job, &err, now, finished).await? {
                FailureDisposition::Retry { attempt, delay } => Ok(Some(JobRun::Retrying {
                    job_id,
                    attempt,
                    delay,
                })),
                FailureDisposition::DeadLettered { record_id } => {
                    Ok(Some(JobRun::DeadLettered { job_id, record_id }))
                }
            },
        }
    }

    /// Spawn `concurrency` slots. Cancelling `cancel` (or calling
    /// [`WorkerPoolHandle::shutdown`]) stops them between jobs.
    pub fn spawn(self, cancel: CancellationToken) -> WorkerPoolHandle {
        let queue = self.queue.name();
        let slots = self.queue.config().concurrency.max(1);
        let counters = Arc::new(Counters::default());

        let joins = (0..slots)
            .map(|slot| {
                let pool = self.clone();
                let cancel = cancel.clone();
                let counters = counters.clone();
                tokio::spawn(async move { pool.slot_loop(slot, cancel, counters).await })
            })
            .collect();

        info!(queue = %queue, concurrency = slots, "worker pool started");

        WorkerPoolHandle {
            queue,
            cancel,
            joins,
            counters,
        }
    }

    async fn slot_loop(&self, slot: usize, cancel: CancellationToken, counters: Arc<Counters>) {
        let queue = self.queue.name();
        let poll = self.queue.config().poll_interval;

        while !cancel.is_cancelled() {
            counters.running.fetch_add(1, Ordering::Relaxed);
            let result = self.run_once(Utc::now()).await;
            counters.running.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(Some(run)) => counters.record(&run),
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
                Err(e) => {
                    error!(queue = %queue, slot, error = %e, "worker slot failed to process job");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }

        debug!(queue = %queue, slot, "worker slot stopped");
    }
}
