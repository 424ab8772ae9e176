//! Campaign email: `send-campaign` fans out one `send-campaign-email` per
//! recipient, which hands the campaign's content to the mailer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use caseflow_jobs::{
    EnqueueOptions, HandlerOutcome, Job, JobError, JobHandler, JobPayload, QueueClient,
    SendCampaign, SendCampaignEmail,
};

use crate::sources::{CampaignDirectory, Mailer, OutboundEmail};

pub struct CampaignHandler {
    queue: QueueClient,
    directory: Arc<dyn CampaignDirectory>,
    mailer: Arc<dyn Mailer>,
}

impl CampaignHandler {
    pub fn new(
        queue: QueueClient,
        directory: Arc<dyn CampaignDirectory>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            queue,
            directory,
            mailer,
        }
    }

    async fn fan_out(&self, campaign: &SendCampaign) -> Result<HandlerOutcome, JobError> {
        let recipients = self
            .directory
            .recipients(campaign.tenant_id, campaign.campaign_id)
            .await?;

        let mut outcome = HandlerOutcome::default();
        for recipient in recipients {
            let email = recipient.email.trim().to_ascii_lowercase();
            let job_id = format!("campaign-email:{}:{}", campaign.campaign_id, email);
            let payload = JobPayload::SendCampaignEmail(SendCampaignEmail {
                tenant_id: campaign.tenant_id,
                campaign_id: campaign.campaign_id,
                recipient: email,
                recipient_name: recipient.name,
            });
            match self
                .queue
                .enqueue(payload, EnqueueOptions::default().job_id(job_id))
                .await
            {
                Ok(handle) if handle.created => outcome.enqueued += 1,
                Ok(_) => outcome.skipped += 1,
                Err(e) if e.is_rejection() => {
                    warn!(
                        campaign_id = %campaign.campaign_id,
                        recipient = %recipient.email,
                        error = %e,
                        "recipient rejected"
                    );
                    outcome.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            tenant_id = %campaign.tenant_id,
            campaign_id = %campaign.campaign_id,
            enqueued = outcome.enqueued,
            skipped = outcome.skipped,
            rejected = outcome.rejected,
            "campaign fanned out"
        );
        Ok(outcome)
    }

    async fn deliver(&self, email: &SendCampaignEmail) -> Result<HandlerOutcome, JobError> {
        let message = self
            .directory
            .message(email.tenant_id, email.campaign_id)
            .await?;

        self.mailer
            .send(&OutboundEmail {
                to: email.recipient.clone(),
                to_name: email.recipient_name.clone(),
                subject: message.subject,
                html: message.html,
            })
            .await?;
        debug!(campaign_id = %email.campaign_id, "campaign email sent");

        self.directory
            .mark_delivered(email.tenant_id, email.campaign_id, &email.recipient)
            .await?;
        Ok(HandlerOutcome::synced(1, 0))
    }
}

#[async_trait]
impl JobHandler for CampaignHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        match &job.payload {
            JobPayload::SendCampaign(campaign) => self.fan_out(campaign).await,
            JobPayload::SendCampaignEmail(email) => self.deliver(email).await,
            other => Err(JobError::permanent(format!(
                "email-campaign cannot handle {}",
                other.job_name()
            ))),
        }
    }
}
