//! Queue registry: one client per work domain, built once at process start
//! and passed by reference to whatever needs to enqueue.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dead_letter::{DeadLetterError, DeadLetterId, DeadLetterRouter};
use crate::error::{QueueError, StoreError};
use crate::payload::JobPayload;
use crate::queue::{EnqueueOptions, JobHandle, QueueClient, QueueConfig};
use crate::store::{JobStore, QueueCounts};
use crate::types::QueueName;

#[derive(Debug, Clone)]
pub struct QueueRegistry {
    /// Indexed by `QueueName as usize`; `QueueName::ALL` is in declaration order.
    queues: [QueueClient; 5],
    dead_letters: DeadLetterRouter,
}

impl QueueRegistry {
    /// Build all five queues over a shared store. Queues missing from
    /// `overrides` use [`QueueConfig::for_queue`].
    pub fn new(
        store: Arc<dyn JobStore>,
        dead_letters: DeadLetterRouter,
        mut overrides: HashMap<QueueName, QueueConfig>,
    ) -> Self {
        let queues = QueueName::ALL.map(|name| {
            let config = overrides
                .remove(&name)
                .unwrap_or_else(|| QueueConfig::for_queue(name));
            QueueClient::new(name, config, store.clone(), dead_letters.clone())
        });
        Self {
            queues,
            dead_letters,
        }
    }

    /// Registry with per-domain defaults.
    pub fn with_defaults(store: Arc<dyn JobStore>, dead_letters: DeadLetterRouter) -> Self {
        Self::new(store, dead_letters, HashMap::new())
    }

    pub fn queue(&self, name: QueueName) -> &QueueClient {
        &self.queues[name as usize]
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueClient> {
        self.queues.iter()
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter {
        &self.dead_letters
    }

    /// Enqueue into the queue owning the payload's job name.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        self.queue(payload.queue()).enqueue(payload, options).await
    }

    /// Replay a dead-letter record into its origin queue.
    pub async fn retry_dead_letter(&self, id: DeadLetterId) -> Result<JobHandle, DeadLetterError> {
        let record = self
            .dead_letters
            .get(id)
            .await?
            .ok_or(DeadLetterError::NotFound(id))?;
        self.dead_letters
            .retry(id, self.queue(record.original_queue))
            .await
    }

    pub async fn stats(&self) -> Result<Vec<(QueueName, QueueCounts)>, StoreError> {
        let mut out = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            out.push((queue.name(), queue.stats().await?));
        }
        Ok(out)
    }
}
