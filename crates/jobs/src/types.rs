//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use caseflow_core::{DomainError, TenantId};

use crate::payload::JobPayload;

/// Job identifier, unique per queue.
///
/// Generated ids are UUIDv7 strings; callers may supply their own
/// (e.g. `sync-case:<tenant>:<case>`) to make enqueue idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The five work domains. Each one gets its own queue, concurrency and
/// retry policy; a slow domain never starves another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// External court-record synchronization.
    CourtSync,
    /// Outbound campaign email.
    EmailCampaign,
    /// Bar-publication monitoring.
    PublicationMonitor,
    /// CSV exports.
    CsvExport,
    /// Chat notifications.
    ChatNotification,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::CourtSync,
        QueueName::EmailCampaign,
        QueueName::PublicationMonitor,
        QueueName::CsvExport,
        QueueName::ChatNotification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::CourtSync => "court-sync",
            QueueName::EmailCampaign => "email-campaign",
            QueueName::PublicationMonitor => "publication-monitor",
            QueueName::CsvExport => "csv-export",
            QueueName::ChatNotification => "chat-notification",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown queue: {s}")))
    }
}

/// Job lifecycle state.
///
/// `waiting → active → completed`, or `active → delayed → waiting` on a
/// retriable failure, or `active → failed` once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Visible, waiting to be popped
    Waiting,
    /// Not visible until `delay_until`
    Delayed,
    /// Popped by a worker, hidden until its visibility deadline
    Active,
    /// Completed successfully
    Completed,
    /// Exhausted retries (a dead-letter record exists for it)
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1), capped
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (the first run counts); at least 1
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the next run, given how many attempts have failed so far
    /// (1-indexed). Returns zero for `0`.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32
                    .checked_shl(attempts_made - 1)
                    .unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Check if another attempt is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID (per queue)
    pub id: JobId,
    /// Owning queue
    pub queue: QueueName,
    /// Typed payload; the variant is the job name
    pub payload: JobPayload,
    /// Current state
    pub state: JobState,
    /// Failed attempts so far; never exceeds `retry_policy.max_attempts`
    pub attempts_made: u32,
    /// Retry policy captured at enqueue
    pub retry_policy: RetryPolicy,
    /// Lower pops first
    pub priority: u8,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job was last updated
    pub updated_at: DateTime<Utc>,
    /// Not visible to workers before this instant
    pub delay_until: Option<DateTime<Utc>>,
    /// While active: when the job becomes re-claimable if not acknowledged
    pub visible_at: Option<DateTime<Utc>>,
    /// Execution history (errors from previous attempts)
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    /// Create a new waiting job.
    pub fn new(queue: QueueName, payload: JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue,
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            retry_policy: RetryPolicy::default(),
            priority: 0,
            created_at: now,
            updated_at: now,
            delay_until: None,
            visible_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule the job with a delay from `now`.
    pub fn delayed(mut self, delay: Duration, now: DateTime<Utc>) -> Self {
        if !delay.is_zero() {
            self.delay_until = Some(now + to_chrono(delay));
            self.state = JobState::Delayed;
        }
        self
    }

    /// Job name (payload discriminant).
    pub fn name(&self) -> &'static str {
        self.payload.job_name()
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.payload.tenant_id()
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts
    }

    /// Whether a worker may pop the job at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.delay_until.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Instant from which the job is poppable (FIFO ordering key).
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.delay_until.unwrap_or(self.created_at)
    }

    /// Mark job as popped by a worker.
    pub fn mark_active(&mut self, now: DateTime<Utc>, visibility_timeout: Duration) {
        self.state = JobState::Active;
        self.visible_at = Some(now + to_chrono(visibility_timeout));
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.visible_at = None;
        self.updated_at = finished_at;
        self.history.push(JobAttemptRecord {
            attempt: self.attempts_made + 1,
            started_at,
            finished_at,
            success: true,
            error: None,
            duration_ms: millis_between(started_at, finished_at),
        });
    }

    /// Record a failed attempt.
    ///
    /// Increments `attempts_made`; schedules a retry with backoff and returns
    /// the delay when the budget allows, otherwise moves the job to `Failed`
    /// and returns `None`. `exhaust` forces the terminal path.
    pub fn mark_failed(
        &mut self,
        error: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        exhaust: bool,
    ) -> Option<Duration> {
        self.attempts_made = (self.attempts_made + 1).min(self.retry_policy.max_attempts.max(1));
        self.updated_at = finished_at;
        self.visible_at = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempts_made,
            started_at,
            finished_at,
            success: false,
            error: Some(error),
            duration_ms: millis_between(started_at, finished_at),
        });

        if !exhaust && self.retry_policy.should_retry(self.attempts_made) {
            let delay = self.retry_policy.delay_for_attempt(self.attempts_made);
            self.delay_until = Some(finished_at + to_chrono(delay));
            self.state = JobState::Delayed;
            Some(delay)
        } else {
            self.state = JobState::Failed;
            None
        }
    }

    /// Last recorded error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|a| a.error.as_deref())
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
