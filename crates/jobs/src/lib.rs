//! Background job orchestration for multi-instance deployments.
//!
//! ## Design
//!
//! - Jobs are queue-scoped, typed (one payload variant per job name) and
//!   validated at both enqueue and dequeue
//! - Retry policy with fixed or exponential backoff, bounded attempts
//! - Dead-letter store for jobs that exhausted their budget, with replay
//! - Leader lease so scheduled fan-out runs on one instance at a time
//! - Paced batch fan-out and idempotent incremental sync of external records
//!
//! ## Components
//!
//! - `QueueClient` / `QueueRegistry`: enqueue and retry bookkeeping per domain
//! - `WorkerPool`: N concurrent handlers per queue
//! - `LeaderElector`: advisory lease on top of a conditional-set store
//! - `BatchPaginator`: bounded pages of item jobs with jitter
//! - `IncrementalSync`: fingerprint-based reconcile of fetched records
//! - `DeadLetterRouter`: capture, stats, replay and retention of failed jobs
//!
//! Every cross-instance interaction goes through the store traits in
//! [`store`], [`leader`], [`dead_letter`], [`sync`] and [`progress`]. The
//! in-memory implementations are for tests/dev; durable ones live in
//! `caseflow-infra`.

pub mod admin;
pub mod dead_letter;
pub mod error;
pub mod leader;
pub mod paginator;
pub mod payload;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod types;
pub mod worker;

pub use admin::{AdminError, AdminService, QueueStatsView};
pub use dead_letter::{
    DeadLetterError, DeadLetterId, DeadLetterRecord, DeadLetterRouter, DeadLetterStats,
    DeadLetterStore, InMemoryDeadLetterStore,
};
pub use error::{JobError, QueueError, StoreError};
pub use leader::{
    InMemoryLeaseStore, InstanceId, LeaderConfig, LeaderElector, LeaderError, LeaseStore,
    RenewalHandle,
};
pub use paginator::{
    BatchOutcome, BatchPaginator, Page, PageItem, PageSource, PaginatorConfig, ScanCursor, ScanKey,
};
pub use payload::{
    BarRegistration, ChatNotification, ExportCsv, ExportResource, FetchPublications, JobPayload,
    MonitorPublications, SendCampaign, SendCampaignEmail, SyncBatch, SyncCase,
};
pub use progress::{
    InMemoryProgressStore, ProgressState, ProgressStatus, ProgressStore, ProgressTracker,
};
pub use queue::{
    EnqueueOptions, FailureDisposition, JobHandle, PermanentErrorPolicy, QueueClient, QueueConfig,
};
pub use registry::QueueRegistry;
pub use scheduler::{
    CronTicker, IntervalTicker, LeaderGate, ScheduledAction, ScheduledTask, TickOutcome, Ticker,
};
pub use store::{InMemoryJobStore, JobStore, PushOutcome, QueueCounts};
pub use sync::{
    ExternalRecord, Fingerprint, InMemoryRecordStore, IncrementalSync, RecordStore, StoredRecord,
    SyncError, SyncMode, SyncReport,
};
pub use types::{BackoffStrategy, Job, JobAttemptRecord, JobId, JobState, QueueName, RetryPolicy};
pub use worker::{HandlerOutcome, JobHandler, JobRun, WorkerPool, WorkerPoolHandle, WorkerStats};
