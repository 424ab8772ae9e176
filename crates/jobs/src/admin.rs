//! Operational surface consumed by the (external) HTTP layer: queue stats
//! and dead-letter inspection, replay and cleanup. Role checks happen at the
//! boundary, not here.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use caseflow_core::DomainError;

use crate::dead_letter::{DeadLetterError, DeadLetterId, DeadLetterRecord, DeadLetterStats};
use crate::error::StoreError;
use crate::queue::JobHandle;
use crate::registry::QueueRegistry;
use crate::store::QueueCounts;
use crate::types::QueueName;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    InvalidQueue(#[from] DomainError),
    #[error("invalid dead-letter id: {0}")]
    InvalidId(String),
    #[error("dead-letter record not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    DeadLetter(DeadLetterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DeadLetterError> for AdminError {
    fn from(value: DeadLetterError) -> Self {
        match value {
            DeadLetterError::NotFound(id) => AdminError::NotFound(id.to_string()),
            other => AdminError::DeadLetter(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatsView {
    pub queue: QueueName,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

#[derive(Debug, Clone)]
pub struct AdminService {
    registry: Arc<QueueRegistry>,
    retention_days: u32,
}

impl AdminService {
    pub fn new(registry: Arc<QueueRegistry>, retention_days: u32) -> Self {
        Self {
            registry,
            retention_days,
        }
    }

    /// `GET stats`
    pub async fn queue_stats(&self) -> Result<Vec<QueueStatsView>, AdminError> {
        Ok(self
            .registry
            .stats()
            .await?
            .into_iter()
            .map(|(queue, counts)| QueueStatsView { queue, counts })
            .collect())
    }

    /// `GET dead-letter/stats`
    pub async fn dead_letter_stats(&self) -> Result<DeadLetterStats, AdminError> {
        Ok(self.registry.dead_letters().stats().await?)
    }

    /// `GET dead-letter/jobs?queue=&limit=`
    pub async fn dead_letter_jobs(
        &self,
        queue: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<DeadLetterRecord>, AdminError> {
        let queue = queue
            .filter(|q| !q.is_empty())
            .map(str::parse::<QueueName>)
            .transpose()?;
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.registry.dead_letters().list(queue, limit).await?)
    }

    /// `POST dead-letter/retry/:jobId`
    pub async fn retry_dead_letter(&self, id: &str) -> Result<JobHandle, AdminError> {
        let id = parse_id(id)?;
        Ok(self.registry.retry_dead_letter(id).await?)
    }

    /// `DELETE dead-letter/cleanup`; `None` uses the configured retention.
    pub async fn cleanup_dead_letters(&self, retention_days: Option<u32>) -> Result<usize, AdminError> {
        let days = retention_days.unwrap_or(self.retention_days);
        Ok(self.registry.dead_letters().cleanup(days, Utc::now()).await?)
    }

    /// `DELETE dead-letter/jobs/:jobId`
    pub async fn delete_dead_letter(&self, id: &str) -> Result<(), AdminError> {
        let parsed = parse_id(id)?;
        if self.registry.dead_letters().delete(parsed).await? {
            Ok(())
        } else {
            Err(AdminError::NotFound(id.to_string()))
        }
    }
}

fn parse_id(id: &str) -> Result<DeadLetterId, AdminError> {
    id.parse().map_err(|_| AdminError::InvalidId(id.to_string()))
}
