//! Job storage: the durable job store contract and an in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::StoreError;
use crate::types::{Job, JobId, JobState, QueueName};

/// Result of pushing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Created,
    /// A non-terminal job with the same id already exists; nothing was written.
    Duplicate,
}

/// Per-queue counts for the admin surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    /// Unreadable job bodies set aside by the store. Always zero in memory.
    pub quarantined: u64,
}

/// Durable job store contract shared by every instance.
///
/// Implementations must make `push` and `pop_ready` atomic: two workers on
/// different instances can never pop the same job while it is active and
/// inside its visibility window.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job (waiting, or delayed when `delay_until` is set).
    async fn push(&self, job: Job) -> Result<PushOutcome, StoreError>;

    /// Pop the next job visible at `now` (priority, then ready time) and mark
    /// it active until `now + visibility_timeout`.
    async fn pop_ready(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Persist a job that failed and was rescheduled (state `Delayed`).
    async fn reschedule(&self, job: &Job) -> Result<(), StoreError>;

    /// Persist a completed job, keeping at most `keep` completed records.
    async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError>;

    /// Drop a job that exhausted its retries (already dead-lettered).
    async fn discard_failed(&self, job: &Job) -> Result<(), StoreError>;

    /// Move active jobs whose visibility deadline passed back to waiting.
    /// Returns how many were reclaimed. `attempts_made` is untouched.
    async fn reclaim_stalled(&self, queue: QueueName, now: DateTime<Utc>)
    -> Result<usize, StoreError>;

    async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, StoreError>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError>;

    /// List jobs in a state (oldest first).
    async fn list(
        &self,
        queue: QueueName,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Remove a job regardless of state.
    async fn remove(&self, queue: QueueName, id: &JobId) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct QueueSlot {
    jobs: HashMap<JobId, Job>,
    completed_order: VecDeque<JobId>,
    completed_total: u64,
    failed_total: u64,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    queues: Mutex<HashMap<QueueName, QueueSlot>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn push(&self, job: Job) -> Result<PushOutcome, StoreError> {
        let mut queues = self.queues.lock();
        let slot = queues.entry(job.queue).or_default();

        if let Some(existing) = slot.jobs.get(&job.id) {
            if !existing.state.is_terminal() {
                return Ok(PushOutcome::Duplicate);
            }
            slot.completed_order.retain(|id| id != &job.id);
        }

        slot.jobs.insert(job.id.clone(), job);
        Ok(PushOutcome::Created)
    }

    async fn pop_ready(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut queues = self.queues.lock();
        let Some(slot) = queues.get_mut(&queue) else {
            return Ok(None);
        };

        let next = slot
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by(|a, b| {
                (a.priority, a.ready_at(), a.created_at, &a.id)
                    .cmp(&(b.priority, b.ready_at(), b.created_at, &b.id))
            })
            .map(|j| j.id.clone());

        Ok(next.and_then(|id| {
            slot.jobs.get_mut(&id).map(|job| {
                job.mark_active(now, visibility_timeout);
                job.clone()
            })
        }))
    }

    async fn reschedule(&self, job: &Job) -> Result<(), StoreError> {
        let mut queues = self.queues.lock();
        let slot = queues.entry(job.queue).or_default();
        slot.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        let mut queues = self.queues.lock();
        let slot = queues.entry(job.queue).or_default();

        slot.jobs.insert(job.id.clone(), job.clone());
        slot.completed_total += 1;
        slot.completed_order.push_back(job.id.clone());

        while slot.completed_order.len() > keep {
            if let Some(old) = slot.completed_order.pop_front() {
                slot.jobs.remove(&old);
            }
        }
        Ok(())
    }

    async fn discard_failed(&self, job: &Job) -> Result<(), StoreError> {
        let mut queues = self.queues.lock();
        let slot = queues.entry(job.queue).or_default();
        slot.jobs.remove(&job.id);
        slot.failed_total += 1;
        Ok(())
    }

    async fn reclaim_stalled(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut queues = self.queues.lock();
        let Some(slot) = queues.get_mut(&queue) else {
            return Ok(0);
        };

        let mut reclaimed = 0;
        for job in slot.jobs.values_mut() {
            let stalled = job.state == JobState::Active && job.visible_at.is_some_and(|at| at <= now);
            if stalled {
                job.state = JobState::Waiting;
                job.visible_at = None;
                job.delay_until = None;
                job.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, StoreError> {
        let queues = self.queues.lock();
        Ok(queues.get(&queue).and_then(|s| s.jobs.get(id).cloned()))
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError> {
        let queues = self.queues.lock();
        let Some(slot) = queues.get(&queue) else {
            return Ok(QueueCounts::default());
        };

        let mut counts = QueueCounts {
            completed: slot.completed_total,
            failed: slot.failed_total,
            ..QueueCounts::default()
        };
        for job in slot.jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed | JobState::Failed => {}
            }
        }
        Ok(counts)
    }

    async fn list(
        &self,
        queue: QueueName,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let queues = self.queues.lock();
        let Some(slot) = queues.get(&queue) else {
            return Ok(Vec::new());
        };

        let mut result: Vec<_> = slot
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        result.sort_by(|a, b| (a.ready_at(), &a.id).cmp(&(b.ready_at(), &b.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn remove(&self, queue: QueueName, id: &JobId) -> Result<bool, StoreError> {
        let mut queues = self.queues.lock();
        let Some(slot) = queues.get_mut(&queue) else {
            return Ok(false);
        };
        slot.completed_order.retain(|c| c != id);
        Ok(slot.jobs.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ChatNotification, JobPayload};

    fn chat_job(text: &str, now: DateTime<Utc>) -> Job {
        Job::new(
            QueueName::ChatNotification,
            JobPayload::ChatNotification(ChatNotification {
                tenant_id: None,
                channel: "#ops".into(),
                text: text.into(),
            }),
            now,
        )
    }

    const VIS: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn push_and_pop() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = chat_job("a", now);
        let id = job.id.clone();
        assert_eq!(store.push(job).await.unwrap(), PushOutcome::Created);

        let popped = store
            .pop_ready(QueueName::ChatNotification, now, VIS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.id, id);
        assert_eq!(popped.state, JobState::Active);

        // No more jobs
        assert!(store
            .pop_ready(QueueName::ChatNotification, now, VIS)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_ignored_while_pending() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let first = chat_job("a", now).with_id("fixed".into());
        let second = chat_job("b", now).with_id("fixed".into());
        assert_eq!(store.push(first).await.unwrap(), PushOutcome::Created);
        assert_eq!(store.push(second).await.unwrap(), PushOutcome::Duplicate);

        let counts = store.counts(QueueName::ChatNotification).await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn completed_ids_can_be_reused() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store.push(chat_job("a", now).with_id("fixed".into())).await.unwrap();
        let mut job = store
            .pop_ready(QueueName::ChatNotification, now, VIS)
            .await
            .unwrap()
            .unwrap();
        job.mark_completed(now, now);
        store.complete(&job, 10).await.unwrap();

        let again = chat_job("b", now).with_id("fixed".into());
        assert_eq!(store.push(again).await.unwrap(), PushOutcome::Created);
    }

    #[tokio::test]
    async fn delayed_jobs_are_invisible_until_due() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store
            .push(chat_job("later", now).delayed(Duration::from_secs(10), now))
            .await
            .unwrap();

        let q = QueueName::ChatNotification;
        assert!(store.pop_ready(q, now, VIS).await.unwrap().is_none());
        assert_eq!(store.counts(q).await.unwrap().delayed, 1);

        let due = now + chrono::Duration::seconds(10);
        assert!(store.pop_ready(q, due, VIS).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let q = QueueName::ChatNotification;

        let low = chat_job("low", now).with_priority(5);
        let first = chat_job("first", now);
        let second = chat_job("second", now + chrono::Duration::milliseconds(1));
        store.push(second.clone()).await.unwrap();
        store.push(low.clone()).await.unwrap();
        store.push(first.clone()).await.unwrap();

        let later = now + chrono::Duration::seconds(1);
        let order: Vec<JobId> = vec![
            store.pop_ready(q, later, VIS).await.unwrap().unwrap().id,
            store.pop_ready(q, later, VIS).await.unwrap().unwrap().id,
            store.pop_ready(q, later, VIS).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![first.id, second.id, low.id]);
    }

    #[tokio::test]
    async fn stalled_jobs_are_reclaimed_after_visibility_timeout() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let q = QueueName::ChatNotification;

        store.push(chat_job("a", now)).await.unwrap();
        store.pop_ready(q, now, VIS).await.unwrap().unwrap();

        assert_eq!(store.reclaim_stalled(q, now).await.unwrap(), 0);
        let after = now + chrono::Duration::seconds(31);
        assert_eq!(store.reclaim_stalled(q, after).await.unwrap(), 1);

        let again = store.pop_ready(q, after, VIS).await.unwrap().unwrap();
        assert_eq!(again.attempts_made, 0);
    }

    #[tokio::test]
    async fn completed_retention_is_bounded() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let q = QueueName::ChatNotification;

        for i in 0..5 {
            store.push(chat_job(&format!("m{i}"), now)).await.unwrap();
            let mut job = store.pop_ready(q, now, VIS).await.unwrap().unwrap();
            job.mark_completed(now, now);
            store.complete(&job, 2).await.unwrap();
        }

        let counts = store.counts(q).await.unwrap();
        assert_eq!(counts.completed, 5);
        assert_eq!(store.list(q, JobState::Completed, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        store.push(chat_job("a", now)).await.unwrap();
        assert!(store
            .pop_ready(QueueName::CsvExport, now, VIS)
            .await
            .unwrap()
            .is_none());
    }
}
