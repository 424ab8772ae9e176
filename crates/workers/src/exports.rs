//! CSV exports: render a tenant's table and upload it to object storage.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use caseflow_jobs::{ExportCsv, HandlerOutcome, Job, JobError, JobHandler, JobPayload};

use crate::sources::{ExportSource, ExportTable, ObjectStorage};

const CONTENT_TYPE: &str = "text/csv; charset=utf-8";

/// RFC 4180 field quoting.
fn escape_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}

fn write_row(out: &mut String, row: &[String]) {
    for (i, field) in row.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_field(field));
    }
    out.push_str("\r\n");
}

/// Render a table as CSV, header first. Rows shorter than the header are
/// padded with empty fields.
pub fn render_csv(table: &ExportTable) -> String {
    let mut out = String::new();
    write_row(&mut out, &table.headers);
    for row in &table.rows {
        if row.len() < table.headers.len() {
            let mut padded = row.clone();
            padded.resize(table.headers.len(), String::new());
            write_row(&mut out, &padded);
        } else {
            write_row(&mut out, row);
        }
    }
    out
}

pub fn object_key(export: &ExportCsv) -> String {
    format!(
        "exports/{}/{}/{}.csv",
        export.tenant_id,
        export.export_id,
        export.resource.as_str()
    )
}

pub struct ExportHandler {
    source: Arc<dyn ExportSource>,
    storage: Arc<dyn ObjectStorage>,
}

impl ExportHandler {
    pub fn new(source: Arc<dyn ExportSource>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { source, storage }
    }

    async fn export(&self, export: &ExportCsv) -> Result<HandlerOutcome, JobError> {
        let table = self.source.table(export.tenant_id, export.resource).await?;
        let rows = table.rows.len() as u64;
        let body = render_csv(&table).into_bytes();
        let bytes = body.len();

        let location = self
            .storage
            .put(&object_key(export), body, CONTENT_TYPE)
            .await?;
        self.source
            .mark_ready(export.tenant_id, export.export_id, &location)
            .await?;

        info!(
            tenant_id = %export.tenant_id,
            export_id = %export.export_id,
            resource = export.resource.as_str(),
            rows,
            bytes,
            requested_by = %export.requested_by,
            "export uploaded"
        );
        Ok(HandlerOutcome::synced(rows, 0).with_note(location))
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        match &job.payload {
            JobPayload::ExportCsv(export) => self.export(export).await,
            other => Err(JobError::permanent(format!(
                "csv-export cannot handle {}",
                other.job_name()
            ))),
        }
    }
}
