//! Postgres adapters.

mod record_store;

pub use record_store::PgRecordStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use caseflow_jobs::StoreError;

use crate::config::DatabaseSettings;

/// Tables owned by the job subsystem. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS external_records (
    id BIGSERIAL PRIMARY KEY,
    tenant_id UUID NOT NULL,
    entity_id UUID NOT NULL,
    fingerprint TEXT NOT NULL,
    code TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    description TEXT NOT NULL,
    raw JSONB NOT NULL,
    ingested_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, entity_id, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_external_records_entity
    ON external_records (tenant_id, entity_id, occurred_at);
"#;

pub async fn connect(settings: &DatabaseSettings) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.url)
        .await
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

pub(crate) fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::ColumnDecode { index, source } => StoreError::Corrupt {
            key: index,
            reason: source.to_string(),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}
