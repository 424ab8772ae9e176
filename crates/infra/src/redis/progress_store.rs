use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use caseflow_core::TenantId;
use caseflow_jobs::{ProgressStatus, ProgressStore, StoreError};

use super::{KeySpace, corrupt, millis, unavailable};

/// Progress snapshots as plain keys expiring after their TTL.
#[derive(Clone)]
pub struct RedisProgressStore {
    conn: ConnectionManager,
    keys: KeySpace,
}

impl std::fmt::Debug for RedisProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisProgressStore").field("keys", &self.keys).finish()
    }
}

impl RedisProgressStore {
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self { conn, keys }
    }

    fn progress_key(&self, tenant_id: TenantId, id: Uuid) -> String {
        self.keys
            .key(&["progress", &tenant_id.to_string(), &id.to_string()])
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn put(&self, status: &ProgressStatus, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.progress_key(status.tenant_id, status.id))
            .arg(serde_json::to_string(status)?)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn get(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<ProgressStatus>, StoreError> {
        let key = self.progress_key(tenant_id, id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|r| serde_json::from_str(&r).map_err(|e| corrupt(&key, e)))
            .transpose()
    }
}
