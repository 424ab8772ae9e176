//! External collaborators, specified only at their boundary.
//!
//! Business persistence (cases, campaigns, registrations), third-party APIs
//! and object storage live outside this workspace. Handlers reach them
//! through these traits; every failure is a classified [`SourceError`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use caseflow_core::{EntityId, SourceError, TenantId};
use caseflow_jobs::{BarRegistration, ExportResource, ExternalRecord, ScanCursor, ScanKey};

/// A case eligible for court-record sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRef {
    pub case_id: EntityId,
    pub process_number: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl CaseRef {
    pub fn scan_key(&self) -> ScanKey {
        ScanKey {
            last_synced_at: self.last_synced_at,
            entity_id: self.case_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasePage {
    pub cases: Vec<CaseRef>,
    /// Cases the cursor admits beyond this page
    pub remaining: usize,
}

/// Read side of the case registry.
#[async_trait]
pub trait CaseDirectory: Send + Sync {
    /// Tenants with court sync enabled.
    async fn tenants(&self) -> Result<Vec<TenantId>, SourceError>;

    /// Up to `limit` cases admitted by `cursor`, least recently synced
    /// first (never synced before any), case id breaking ties.
    async fn page(
        &self,
        tenant_id: TenantId,
        cursor: &ScanCursor,
        limit: usize,
    ) -> Result<CasePage, SourceError>;

    async fn mark_synced(
        &self,
        tenant_id: TenantId,
        case_id: EntityId,
        at: DateTime<Utc>,
    ) -> Result<(), SourceError>;
}

/// Court-record API.
#[async_trait]
pub trait CourtRecordSource: Send + Sync {
    /// Every known movement of a process.
    async fn movements(&self, process_number: &str) -> Result<Vec<ExternalRecord>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
}

/// Rendered campaign content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignMessage {
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait CampaignDirectory: Send + Sync {
    async fn recipients(
        &self,
        tenant_id: TenantId,
        campaign_id: Uuid,
    ) -> Result<Vec<Recipient>, SourceError>;

    async fn message(
        &self,
        tenant_id: TenantId,
        campaign_id: Uuid,
    ) -> Result<CampaignMessage, SourceError>;

    async fn mark_delivered(
        &self,
        tenant_id: TenantId,
        campaign_id: Uuid,
        recipient: &str,
    ) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
}

/// SMTP relay.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SourceError>;
}

/// Bar registrations each tenant monitors.
#[async_trait]
pub trait RegistrationDirectory: Send + Sync {
    async fn tenants(&self) -> Result<Vec<TenantId>, SourceError>;

    async fn monitored(&self, tenant_id: TenantId) -> Result<Vec<BarRegistration>, SourceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublicationPage {
    pub records: Vec<ExternalRecord>,
    /// Pages in the whole window, as reported by the first response
    pub total_pages: u32,
}

/// Bar-publication API; pages are 1-based.
#[async_trait]
pub trait PublicationSource: Send + Sync {
    async fn page(
        &self,
        registration: &BarRegistration,
        from: NaiveDate,
        to: NaiveDate,
        page: u32,
    ) -> Result<PublicationPage, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[async_trait]
pub trait ExportSource: Send + Sync {
    async fn table(
        &self,
        tenant_id: TenantId,
        resource: ExportResource,
    ) -> Result<ExportTable, SourceError>;

    /// Record where the finished export was stored.
    async fn mark_ready(
        &self,
        tenant_id: TenantId,
        export_id: Uuid,
        location: &str,
    ) -> Result<(), SourceError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `body` under `key`, returning its location.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SourceError>;
}

/// Chat notification API.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn post(&self, channel: &str, text: &str) -> Result<(), SourceError>;
}
