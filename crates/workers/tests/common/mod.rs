//! In-process stand-ins for the external collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use caseflow_core::{EntityId, SourceError, TenantId};
use caseflow_jobs::{
    BarRegistration, ExportResource, ExternalRecord, JobRun, ScanCursor, WorkerPool,
};
use caseflow_workers::Collaborators;
use caseflow_workers::sources::{
    CampaignDirectory, CampaignMessage, CaseDirectory, CasePage, CaseRef, ChatNotifier,
    CourtRecordSource, ExportSource, ExportTable, Mailer, ObjectStorage, OutboundEmail,
    PublicationPage, PublicationSource, Recipient, RegistrationDirectory,
};

pub fn process_number(i: usize) -> String {
    format!("{i:020}")
}

fn record(code: String, day: u32) -> ExternalRecord {
    ExternalRecord {
        occurred_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap(),
        description: format!("movement {code}"),
        raw: json!({ "code": code }),
        code,
    }
}

/// Claims and runs jobs until nothing is ready an hour from now.
pub async fn drain(pool: &WorkerPool) -> Vec<JobRun> {
    drain_at(pool, Utc::now() + Duration::hours(1)).await
}

/// Claims and runs jobs until nothing is ready at `at`.
pub async fn drain_at(pool: &WorkerPool, at: DateTime<Utc>) -> Vec<JobRun> {
    let mut runs = Vec::new();
    while let Some(run) = pool.run_once(at).await.unwrap() {
        runs.push(run);
    }
    runs
}

/// Case directory that orders by last sync, as the real one does.
pub struct FakeCases {
    pub tenants: Vec<TenantId>,
    pub cases: Vec<CaseRef>,
    pub synced: Mutex<Vec<(TenantId, EntityId)>>,
    last_synced: Mutex<HashMap<EntityId, DateTime<Utc>>>,
}

impl FakeCases {
    pub fn new(tenants: Vec<TenantId>, count: usize) -> Self {
        Self::with_process_numbers(tenants, (0..count).map(process_number).collect())
    }

    pub fn with_process_numbers(tenants: Vec<TenantId>, numbers: Vec<String>) -> Self {
        let cases = numbers
            .into_iter()
            .enumerate()
            .map(|(i, process_number)| CaseRef {
                case_id: EntityId::from_natural_key(&format!("case-{i}")),
                process_number,
                last_synced_at: None,
            })
            .collect();
        Self {
            tenants,
            cases,
            synced: Mutex::new(Vec::new()),
            last_synced: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CaseDirectory for FakeCases {
    async fn tenants(&self) -> Result<Vec<TenantId>, SourceError> {
        Ok(self.tenants.clone())
    }

    async fn page(
        &self,
        _tenant_id: TenantId,
        cursor: &ScanCursor,
        limit: usize,
    ) -> Result<CasePage, SourceError> {
        let last_synced = self.last_synced.lock();
        let mut admitted: Vec<CaseRef> = self
            .cases
            .iter()
            .map(|case| CaseRef {
                last_synced_at: last_synced.get(&case.case_id).copied(),
                ..case.clone()
            })
            .filter(|case| cursor.admits(&case.scan_key()))
            .collect();
        admitted.sort_by_key(CaseRef::scan_key);
        let remaining = admitted.len().saturating_sub(limit);
        admitted.truncate(limit);
        Ok(CasePage {
            cases: admitted,
            remaining,
        })
    }

    async fn mark_synced(
        &self,
        tenant_id: TenantId,
        case_id: EntityId,
        at: DateTime<Utc>,
    ) -> Result<(), SourceError> {
        self.synced.lock().push((tenant_id, case_id));
        self.last_synced.lock().insert(case_id, at);
        Ok(())
    }
}

/// Two movements per process; listed process numbers answer 503.
#[derive(Default)]
pub struct FakeCourt {
    pub unavailable: HashSet<String>,
}

#[async_trait]
impl CourtRecordSource for FakeCourt {
    async fn movements(&self, process_number: &str) -> Result<Vec<ExternalRecord>, SourceError> {
        if self.unavailable.contains(process_number) {
            return Err(SourceError::from_status(503, "maintenance"));
        }
        Ok(vec![
            record(format!("{process_number}-filed"), 2),
            record(format!("{process_number}-ruling"), 9),
        ])
    }
}

#[derive(Default)]
pub struct FakeCampaigns {
    pub recipients: Vec<Recipient>,
    pub delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl CampaignDirectory for FakeCampaigns {
    async fn recipients(
        &self,
        _tenant_id: TenantId,
        _campaign_id: Uuid,
    ) -> Result<Vec<Recipient>, SourceError> {
        Ok(self.recipients.clone())
    }

    async fn message(
        &self,
        _tenant_id: TenantId,
        campaign_id: Uuid,
    ) -> Result<CampaignMessage, SourceError> {
        Ok(CampaignMessage {
            subject: format!("Campaign {campaign_id}"),
            html: "<p>Hello</p>".into(),
        })
    }

    async fn mark_delivered(
        &self,
        _tenant_id: TenantId,
        _campaign_id: Uuid,
        recipient: &str,
    ) -> Result<(), SourceError> {
        self.delivered.lock().push(recipient.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMailer {
    pub sent: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SourceError> {
        self.sent.lock().push(email.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistrations {
    pub tenants: Vec<TenantId>,
    pub monitored: Vec<BarRegistration>,
}

#[async_trait]
impl RegistrationDirectory for FakeRegistrations {
    async fn tenants(&self) -> Result<Vec<TenantId>, SourceError> {
        Ok(self.tenants.clone())
    }

    async fn monitored(&self, _tenant_id: TenantId) -> Result<Vec<BarRegistration>, SourceError> {
        Ok(self.monitored.clone())
    }
}

/// `total_pages` pages of `per_page` records each.
pub struct FakePublications {
    pub total_pages: u32,
    pub per_page: usize,
    pub fail_on_page: Option<u32>,
    pub requests: Mutex<Vec<(BarRegistration, u32)>>,
}

impl FakePublications {
    pub fn new(total_pages: u32, per_page: usize) -> Self {
        Self {
            total_pages,
            per_page,
            fail_on_page: None,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PublicationSource for FakePublications {
    async fn page(
        &self,
        registration: &BarRegistration,
        _from: NaiveDate,
        _to: NaiveDate,
        page: u32,
    ) -> Result<PublicationPage, SourceError> {
        self.requests.lock().push((registration.clone(), page));
        if self.fail_on_page == Some(page) {
            return Err(SourceError::timeout("publication api"));
        }
        let records = (0..self.per_page)
            .map(|i| record(format!("pub-{page}-{i}"), 3))
            .collect();
        Ok(PublicationPage {
            records,
            total_pages: self.total_pages,
        })
    }
}

pub struct FakeExports {
    pub table: ExportTable,
    pub ready: Mutex<Vec<(Uuid, String)>>,
}

impl Default for FakeExports {
    fn default() -> Self {
        Self {
            table: ExportTable {
                headers: vec!["name".into(), "document".into()],
                rows: vec![
                    vec!["Maria Lima".into(), "123".into()],
                    vec!["Costa, João".into(), "456".into()],
                ],
            },
            ready: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ExportSource for FakeExports {
    async fn table(
        &self,
        _tenant_id: TenantId,
        _resource: ExportResource,
    ) -> Result<ExportTable, SourceError> {
        Ok(self.table.clone())
    }

    async fn mark_ready(
        &self,
        _tenant_id: TenantId,
        export_id: Uuid,
        location: &str,
    ) -> Result<(), SourceError> {
        self.ready.lock().push((export_id, location.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStorage {
    pub objects: Mutex<Vec<(String, Vec<u8>, String)>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SourceError> {
        self.objects
            .lock()
            .push((key.to_string(), body, content_type.to_string()));
        Ok(format!("s3://caseflow-exports/{key}"))
    }
}

#[derive(Default)]
pub struct FakeChat {
    pub posts: Mutex<Vec<(String, String)>>,
    /// Calls that reached `post`, including ones parked on `gate`.
    pub entered: AtomicUsize,
    /// When set, each post waits for a permit.
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeChat {
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChatNotifier for FakeChat {
    async fn post(&self, channel: &str, text: &str) -> Result<(), SourceError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| SourceError::transient("chat gate closed"))?
                .forget();
        }
        self.posts.lock().push((channel.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct Fakes {
    pub cases: Arc<FakeCases>,
    pub court: Arc<FakeCourt>,
    pub campaigns: Arc<FakeCampaigns>,
    pub mailer: Arc<FakeMailer>,
    pub registrations: Arc<FakeRegistrations>,
    pub publications: Arc<FakePublications>,
    pub exports: Arc<FakeExports>,
    pub storage: Arc<FakeStorage>,
    pub chat: Arc<FakeChat>,
}

impl Fakes {
    pub fn new(tenants: Vec<TenantId>) -> Self {
        Self {
            cases: Arc::new(FakeCases::new(tenants.clone(), 3)),
            court: Arc::new(FakeCourt::default()),
            campaigns: Arc::new(FakeCampaigns::default()),
            mailer: Arc::new(FakeMailer::default()),
            registrations: Arc::new(FakeRegistrations {
                tenants,
                monitored: vec![BarRegistration::new("123456", "SP")],
            }),
            publications: Arc::new(FakePublications::new(1, 2)),
            exports: Arc::new(FakeExports::default()),
            storage: Arc::new(FakeStorage::default()),
            chat: Arc::new(FakeChat::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cases: self.cases.clone(),
            court: self.court.clone(),
            campaigns: self.campaigns.clone(),
            mailer: self.mailer.clone(),
            registrations: self.registrations.clone(),
            publications: self.publications.clone(),
            exports: self.exports.clone(),
            storage: self.storage.clone(),
            chat: self.chat.clone(),
        }
    }
}
