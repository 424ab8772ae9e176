//! Chat notifications.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use caseflow_jobs::{ChatNotification, HandlerOutcome, Job, JobError, JobHandler, JobPayload};

use crate::sources::ChatNotifier;

pub struct ChatHandler {
    notifier: Arc<dyn ChatNotifier>,
}

impl ChatHandler {
    pub fn new(notifier: Arc<dyn ChatNotifier>) -> Self {
        Self { notifier }
    }

    async fn post(&self, message: &ChatNotification) -> Result<HandlerOutcome, JobError> {
        self.notifier.post(&message.channel, message.text.trim()).await?;
        debug!(
            channel = %message.channel,
            tenant_id = ?message.tenant_id,
            "chat notification posted"
        );
        Ok(HandlerOutcome::synced(1, 0))
    }
}

#[async_trait]
impl JobHandler for ChatHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        match &job.payload {
            JobPayload::ChatNotification(message) => self.post(message).await,
            other => Err(JobError::permanent(format!(
                "chat-notification cannot handle {}",
                other.job_name()
            ))),
        }
    }
}
