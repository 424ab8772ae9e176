//! Typed job payloads.
//!
//! One variant per job name, each with its own schema. `validate()` runs at
//! enqueue and again at dequeue so a malformed payload never reaches a
//! handler.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use caseflow_core::{DomainError, DomainResult, EntityId, TenantId};

use crate::paginator::ScanCursor;
use crate::types::QueueName;

/// Longest chat message accepted by the notification API.
pub const MAX_CHAT_TEXT: usize = 4000;

/// Widest publication window a single fetch job may cover.
pub const MAX_PUBLICATION_WINDOW_DAYS: i64 = 5 * 366;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    /// One page of a tenant-wide court resync.
    SyncBatch(SyncBatch),
    /// Fetch and reconcile movements for one case.
    SyncCase(SyncCase),
    /// Fan a campaign out to its recipients.
    SendCampaign(SendCampaign),
    /// Deliver one campaign email.
    SendCampaignEmail(SendCampaignEmail),
    /// Daily scan of the bar registrations a tenant monitors.
    MonitorPublications(MonitorPublications),
    /// Multi-page publication fetch for one registration.
    FetchPublications(FetchPublications),
    /// Render and upload a CSV export.
    ExportCsv(ExportCsv),
    /// Post a message to a chat channel.
    ChatNotification(ChatNotification),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub tenant_id: TenantId,
    pub cursor: ScanCursor,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCase {
    pub tenant_id: TenantId,
    pub case_id: EntityId,
    /// Court process number (CNJ format, 20 digits once punctuation is removed).
    pub process_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCampaign {
    pub tenant_id: TenantId,
    pub campaign_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCampaignEmail {
    pub tenant_id: TenantId,
    pub campaign_id: Uuid,
    pub recipient: String,
    pub recipient_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorPublications {
    pub tenant_id: TenantId,
    pub lookback_days: u32,
}

/// A lawyer's bar registration (number + issuing state).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BarRegistration {
    pub number: String,
    pub state: String,
}

impl BarRegistration {
    pub fn new(number: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            state: state.into(),
        }
    }

    /// Stable entity id used for fingerprinting this registration's publications.
    pub fn entity_id(&self) -> EntityId {
        EntityId::from_natural_key(&format!("oab:{}:{}", self.state, self.number))
    }

    fn validate(&self) -> DomainResult<()> {
        if self.number.is_empty() || !self.number.chars().all(|c| c.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "bar registration number must be digits, got {:?}",
                self.number
            )));
        }
        if self.state.len() != 2 || !self.state.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(DomainError::validation(format!(
                "bar registration state must be a two-letter code, got {:?}",
                self.state
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for BarRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPublications {
    pub tenant_id: TenantId,
    /// Progress projection key polled by clients.
    pub consulta_id: Uuid,
    pub registration: BarRegistration,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportResource {
    Clients,
    Cases,
    Movements,
}

impl ExportResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportResource::Clients => "clients",
            ExportResource::Cases => "cases",
            ExportResource::Movements => "movements",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCsv {
    pub tenant_id: TenantId,
    pub export_id: Uuid,
    pub resource: ExportResource,
    pub requested_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatNotification {
    /// Absent for system-wide notices (e.g. operator alerts).
    pub tenant_id: Option<TenantId>,
    pub channel: String,
    pub text: String,
}

impl JobPayload {
    /// Job name; discriminates the handler branch.
    pub fn job_name(&self) -> &'static str {
        match self {
            JobPayload::SyncBatch(_) => "sync-batch",
            JobPayload::SyncCase(_) => "sync-case",
            JobPayload::SendCampaign(_) => "send-campaign",
            JobPayload::SendCampaignEmail(_) => "send-campaign-email",
            JobPayload::MonitorPublications(_) => "monitor-publications",
            JobPayload::FetchPublications(_) => "fetch-publications",
            JobPayload::ExportCsv(_) => "export-csv",
            JobPayload::ChatNotification(_) => "chat-notification",
        }
    }

    /// Queue this payload belongs to.
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::SyncBatch(_) | JobPayload::SyncCase(_) => QueueName::CourtSync,
            JobPayload::SendCampaign(_) | JobPayload::SendCampaignEmail(_) => {
                QueueName::EmailCampaign
            }
            JobPayload::MonitorPublications(_) | JobPayload::FetchPublications(_) => {
                QueueName::PublicationMonitor
            }
            JobPayload::ExportCsv(_) => QueueName::CsvExport,
            JobPayload::ChatNotification(_) => QueueName::ChatNotification,
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            JobPayload::SyncBatch(p) => Some(p.tenant_id),
            JobPayload::SyncCase(p) => Some(p.tenant_id),
            JobPayload::SendCampaign(p) => Some(p.tenant_id),
            JobPayload::SendCampaignEmail(p) => Some(p.tenant_id),
            JobPayload::MonitorPublications(p) => Some(p.tenant_id),
            JobPayload::FetchPublications(p) => Some(p.tenant_id),
            JobPayload::ExportCsv(p) => Some(p.tenant_id),
            JobPayload::ChatNotification(p) => p.tenant_id,
        }
    }

    /// Check the payload's schema-level invariants.
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            JobPayload::SyncBatch(p) => {
                if p.batch_size == 0 {
                    return Err(DomainError::validation("batch_size must be positive"));
                }
                Ok(())
            }
            JobPayload::SyncCase(p) => {
                let digits: String = p
                    .process_number
                    .chars()
                    .filter(|c| !matches!(c, '.' | '-'))
                    .collect();
                if digits.len() != 20 || !digits.chars().all(|c| c.is_ascii_digit()) {
                    return Err(DomainError::validation(format!(
                        "process number must have 20 digits, got {:?}",
                        p.process_number
                    )));
                }
                Ok(())
            }
            JobPayload::SendCampaign(_) => Ok(()),
            JobPayload::SendCampaignEmail(p) => validate_email(&p.recipient),
            JobPayload::MonitorPublications(p) => {
                if p.lookback_days == 0 {
                    return Err(DomainError::validation("lookback_days must be positive"));
                }
                Ok(())
            }
            JobPayload::FetchPublications(p) => {
                p.registration.validate()?;
                if p.from > p.to {
                    return Err(DomainError::validation(format!(
                        "publication window is inverted: {} > {}",
                        p.from, p.to
                    )));
                }
                if (p.to - p.from).num_days() > MAX_PUBLICATION_WINDOW_DAYS {
                    return Err(DomainError::validation("publication window exceeds five years"));
                }
                Ok(())
            }
            JobPayload::ExportCsv(p) => {
                if p.requested_by.trim().is_empty() {
                    return Err(DomainError::validation("requested_by is required"));
                }
                Ok(())
            }
            JobPayload::ChatNotification(p) => {
                if p.channel.trim().is_empty() {
                    return Err(DomainError::validation("channel is required"));
                }
                if p.text.trim().is_empty() {
                    return Err(DomainError::validation("text is required"));
                }
                if p.text.chars().count() > MAX_CHAT_TEXT {
                    return Err(DomainError::validation(format!(
                        "text exceeds {MAX_CHAT_TEXT} characters"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn validate_email(addr: &str) -> DomainResult<()> {
    let valid = match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !addr.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DomainError::validation(format!("invalid recipient address: {addr:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_by_job_name() {
        let tenant_id = TenantId::new();
        let payload = JobPayload::SyncBatch(SyncBatch {
            tenant_id,
            cursor: ScanCursor::start(chrono::Utc::now()),
            batch_size: 50,
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["job"], "sync-batch");
        assert!(json["data"]["cursor"]["after"].is_null());
        assert_eq!(payload.job_name(), "sync-batch");
        assert_eq!(payload.queue(), QueueName::CourtSync);
        assert_eq!(payload.tenant_id(), Some(tenant_id));
    }

    #[test]
    fn unknown_job_name_fails_to_decode() {
        let json = serde_json::json!({"job": "format-disk", "data": {}});
        assert!(serde_json::from_value::<JobPayload>(json).is_err());
    }

    #[test]
    fn process_number_validation() {
        let ok = JobPayload::SyncCase(SyncCase {
            tenant_id: TenantId::new(),
            case_id: EntityId::new(),
            process_number: "0001234-56.2023.8.26.0100".into(),
        });
        assert!(ok.validate().is_ok());

        let bad = JobPayload::SyncCase(SyncCase {
            tenant_id: TenantId::new(),
            case_id: EntityId::new(),
            process_number: "12-34".into(),
        });
        assert!(matches!(bad.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn email_validation() {
        assert!(validate_email("ana@firm.com.br").is_ok());
        assert!(validate_email("ana@localhost").is_err());
        assert!(validate_email("ana firm@x.com").is_err());
        assert!(validate_email("@x.com").is_err());
    }

    #[test]
    fn publication_window_validation() {
        let payload = |from: &str, to: &str, state: &str| {
            JobPayload::FetchPublications(FetchPublications {
                tenant_id: TenantId::new(),
                consulta_id: Uuid::now_v7(),
                registration: BarRegistration::new("123456", state),
                from: from.parse().unwrap(),
                to: to.parse().unwrap(),
            })
        };

        assert!(payload("2021-01-01", "2025-12-31", "SP").validate().is_ok());
        assert!(payload("2025-01-02", "2025-01-01", "SP").validate().is_err());
        assert!(payload("2015-01-01", "2025-01-01", "SP").validate().is_err());
        assert!(payload("2025-01-01", "2025-01-31", "sp").validate().is_err());
    }

    #[test]
    fn chat_text_limits() {
        let payload = |text: String| {
            JobPayload::ChatNotification(ChatNotification {
                tenant_id: None,
                channel: "#ops".into(),
                text,
            })
        };
        assert!(payload("deploy done".into()).validate().is_ok());
        assert!(payload("   ".into()).validate().is_err());
        assert!(payload("x".repeat(MAX_CHAT_TEXT + 1)).validate().is_err());
    }

    #[test]
    fn registration_entity_id_is_stable() {
        let a = BarRegistration::new("123456", "SP");
        assert_eq!(a.entity_id(), BarRegistration::new("123456", "SP").entity_id());
        assert_ne!(a.entity_id(), BarRegistration::new("123456", "RJ").entity_id());
    }
}
