//! Postgres-backed fingerprint record store.
//!
//! Uniqueness of `(tenant_id, entity_id, fingerprint)` is enforced by the
//! table, so two instances reconciling the same entity concurrently can both
//! insert and the loser's rows are dropped by `ON CONFLICT DO NOTHING`.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use caseflow_core::{EntityId, TenantId};
use caseflow_jobs::{Fingerprint, RecordStore, StoreError, StoredRecord};

use super::store_error;

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Column-major view of a batch, bound as arrays and expanded with `UNNEST`.
#[derive(Debug, Default)]
struct Columns {
    tenant_ids: Vec<Uuid>,
    entity_ids: Vec<Uuid>,
    fingerprints: Vec<String>,
    codes: Vec<String>,
    occurred_at: Vec<DateTime<Utc>>,
    descriptions: Vec<String>,
    raw: Vec<String>,
    ingested_at: Vec<DateTime<Utc>>,
}

impl Columns {
    fn from_records(records: &[StoredRecord]) -> Self {
        let mut cols = Columns::default();
        for r in records {
            cols.tenant_ids.push(*r.tenant_id.as_uuid());
            cols.entity_ids.push(*r.entity_id.as_uuid());
            cols.fingerprints.push(r.fingerprint.as_str().to_string());
            cols.codes.push(r.code.clone());
            cols.occurred_at.push(r.occurred_at);
            cols.descriptions.push(r.description.clone());
            cols.raw.push(r.raw.to_string());
            cols.ingested_at.push(r.ingested_at);
        }
        cols
    }
}

async fn insert_batch<'e, E>(executor: E, records: &[StoredRecord]) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    if records.is_empty() {
        return Ok(0);
    }
    let cols = Columns::from_records(records);
    let result = sqlx::query(
        r#"
        INSERT INTO external_records
            (tenant_id, entity_id, fingerprint, code, occurred_at, description, raw, ingested_at)
        SELECT t, e, f, c, o, d, r::jsonb, i
        FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[],
                    $5::timestamptz[], $6::text[], $7::text[], $8::timestamptz[])
            AS u(t, e, f, c, o, d, r, i)
        ON CONFLICT (tenant_id, entity_id, fingerprint) DO NOTHING
        "#,
    )
    .bind(cols.tenant_ids)
    .bind(cols.entity_ids)
    .bind(cols.fingerprints)
    .bind(cols.codes)
    .bind(cols.occurred_at)
    .bind(cols.descriptions)
    .bind(cols.raw)
    .bind(cols.ingested_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self), err)]
    async fn fingerprints(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<HashSet<Fingerprint>, StoreError> {
        let rows = sqlx::query(
            "SELECT fingerprint FROM external_records WHERE tenant_id = $1 AND entity_id = $2",
        )
        .bind(*tenant_id.as_uuid())
        .bind(*entity_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("fingerprint")
                    .map(Fingerprint::from_stored)
                    .map_err(store_error)
            })
            .collect()
    }

    #[instrument(skip(self, records), fields(count = records.len()), err)]
    async fn insert_ignoring_conflicts(&self, records: &[StoredRecord]) -> Result<u64, StoreError> {
        insert_batch(&self.pool, records).await.map_err(store_error)
    }

    #[instrument(skip(self, records), fields(count = records.len()), err)]
    async fn replace_all(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        records: &[StoredRecord],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        sqlx::query("DELETE FROM external_records WHERE tenant_id = $1 AND entity_id = $2")
            .bind(*tenant_id.as_uuid())
            .bind(*entity_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        let inserted = insert_batch(&mut *tx, records).await.map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn columns_keep_record_order() {
        let tenant_id = TenantId::new();
        let entity_id = EntityId::from_natural_key("case-1");
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap();
        let records: Vec<_> = ["10", "20"]
            .iter()
            .map(|code| StoredRecord {
                tenant_id,
                entity_id,
                fingerprint: Fingerprint::compute(entity_id, code, at),
                code: code.to_string(),
                occurred_at: at,
                description: format!("movement {code}"),
                raw: serde_json::json!({ "code": code }),
                ingested_at: at,
            })
            .collect();

        let cols = Columns::from_records(&records);
        assert_eq!(cols.codes, vec!["10", "20"]);
        assert_eq!(cols.fingerprints[0], records[0].fingerprint.as_str());
        assert_eq!(cols.raw[1], r#"{"code":"20"}"#);
        assert!(cols.tenant_ids.iter().all(|t| t == tenant_id.as_uuid()));
    }
}
