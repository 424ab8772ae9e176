//! Ephemeral progress projection for long multi-page jobs.
//!
//! Purely observational: polling clients read it, nothing decides on it, and
//! losing it is harmless. Writes that fail are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use caseflow_core::TenantId;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStatus {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub state: ProgressState,
    pub pages_done: u32,
    pub pages_total: Option<u32>,
    pub items_found: u64,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressStatus {
    pub fn queued(id: Uuid, tenant_id: TenantId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id,
            state: ProgressState::Queued,
            pages_done: 0,
            pages_total: None,
            items_found: 0,
            error: None,
            updated_at: now,
        }
    }
}

/// TTL-bound progress storage, keyed by tenant and id.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn put(&self, status: &ProgressStatus, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<ProgressStatus>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    entries: Mutex<HashMap<(TenantId, Uuid), (ProgressStatus, Instant)>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn put(&self, status: &ProgressStatus, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert((status.tenant_id, status.id), (status.clone(), now + ttl));
        Ok(())
    }

    async fn get(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<ProgressStatus>, StoreError> {
        let mut entries = self.entries.lock();
        let key = (tenant_id, id);
        match entries.get(&key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(&key);
                Ok(None)
            }
            Some((status, _)) => Ok(Some(status.clone())),
            None => Ok(None),
        }
    }
}

/// Writes a job's progress as it advances.
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    ttl: Duration,
    status: ProgressStatus,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        ttl: Duration,
        id: Uuid,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            store,
            ttl,
            status: ProgressStatus::queued(id, tenant_id, Utc::now()),
        }
    }

    pub fn status(&self) -> &ProgressStatus {
        &self.status
    }

    pub async fn start(&mut self, pages_total: Option<u32>) {
        self.status.state = ProgressState::Running;
        self.status.pages_total = pages_total;
        self.status.error = None;
        self.publish().await;
    }

    pub async fn page_done(&mut self, items: u64) {
        self.status.pages_done += 1;
        self.status.items_found += items;
        self.publish().await;
    }

    pub async fn complete(&mut self) {
        self.status.state = ProgressState::Completed;
        self.publish().await;
    }

    /// Back to queued after a failed attempt that will be retried; the
    /// error stays visible until the next run starts.
    pub async fn retry_pending(&mut self, error: impl Into<String>) {
        self.status.state = ProgressState::Queued;
        self.status.error = Some(error.into());
        self.publish().await;
    }

    pub async fn fail(&mut self, error: impl Into<String>) {
        self.status.state = ProgressState::Failed;
        self.status.error = Some(error.into());
        self.publish().await;
    }

    async fn publish(&mut self) {
        self.status.updated_at = Utc::now();
        if let Err(e) = self.store.put(&self.status, self.ttl).await {
            warn!(
                progress_id = %self.status.id,
                tenant_id = %self.status.tenant_id,
                error = %e,
                "failed to publish progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl ProgressStore for Broken {
        async fn put(&self, _: &ProgressStatus, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }

        async fn get(&self, _: TenantId, _: Uuid) -> Result<Option<ProgressStatus>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn tracker_publishes_each_step() {
        let store = InMemoryProgressStore::arc();
        let tenant = TenantId::new();
        let id = Uuid::now_v7();
        let mut tracker = ProgressTracker::new(store.clone(), Duration::from_secs(3600), id, tenant);

        tracker.start(Some(3)).await;
        tracker.page_done(10).await;
        tracker.page_done(4).await;

        let status = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(status.state, ProgressState::Running);
        assert_eq!(status.pages_done, 2);
        assert_eq!(status.items_found, 14);

        tracker.complete().await;
        let status = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(status.state, ProgressState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = InMemoryProgressStore::new();
        let status = ProgressStatus::queued(Uuid::now_v7(), TenantId::new(), Utc::now());
        store.put(&status, Duration::from_secs(60)).await.unwrap();

        assert!(store.get(status.tenant_id, status.id).await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get(status.tenant_id, status.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_prune_expired_entries() {
        let store = InMemoryProgressStore::new();
        let stale = ProgressStatus::queued(Uuid::now_v7(), TenantId::new(), Utc::now());
        store.put(&stale, Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = ProgressStatus::queued(Uuid::now_v7(), TenantId::new(), Utc::now());
        store.put(&fresh, Duration::from_secs(60)).await.unwrap();

        let entries = store.entries.lock();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&(fresh.tenant_id, fresh.id)));
    }

    #[tokio::test]
    async fn retry_pending_reads_as_queued_with_error() {
        let store = InMemoryProgressStore::arc();
        let tenant = TenantId::new();
        let id = Uuid::now_v7();
        let mut tracker = ProgressTracker::new(store.clone(), Duration::from_secs(60), id, tenant);

        tracker.start(Some(4)).await;
        tracker.retry_pending("upstream 503").await;
        let status = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(status.state, ProgressState::Queued);
        assert_eq!(status.error.as_deref(), Some("upstream 503"));

        tracker.start(Some(4)).await;
        assert_eq!(store.get(tenant, id).await.unwrap().unwrap().error, None);
    }

    #[tokio::test]
    async fn other_tenants_cannot_read_progress() {
        let store = InMemoryProgressStore::new();
        let status = ProgressStatus::queued(Uuid::now_v7(), TenantId::new(), Utc::now());
        store.put(&status, Duration::from_secs(60)).await.unwrap();

        assert!(store.get(TenantId::new(), status.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let mut tracker =
            ProgressTracker::new(Arc::new(Broken), Duration::from_secs(60), Uuid::now_v7(), TenantId::new());
        tracker.start(None).await;
        tracker.fail("upstream 503").await;
        assert_eq!(tracker.status().state, ProgressState::Failed);
    }
}
