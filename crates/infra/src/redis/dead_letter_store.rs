//! Redis-backed dead-letter store.
//!
//! Records live in one hash; two sorted sets scored by failure time index
//! them globally and per origin queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::instrument;

use caseflow_jobs::{DeadLetterId, DeadLetterRecord, DeadLetterStore, QueueName, StoreError};

use super::{KeySpace, corrupt, unavailable};

/// KEYS: records, by-time, then every per-queue index.
const REMOVE: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
  return 0
end
for i = 2, #KEYS do
  redis.call('ZREM', KEYS[i], ARGV[1])
end
return 1
"#;

#[derive(Clone)]
pub struct RedisDeadLetterStore {
    conn: ConnectionManager,
    records: String,
    by_time: String,
    by_queue: [String; QueueName::ALL.len()],
    remove: Script,
}

impl std::fmt::Debug for RedisDeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDeadLetterStore")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl RedisDeadLetterStore {
    pub fn new(conn: ConnectionManager, keys: &KeySpace) -> Self {
        Self {
            conn,
            records: keys.key(&["dead-letter", "records"]),
            by_time: keys.key(&["dead-letter", "by-time"]),
            by_queue: QueueName::ALL.map(|q| keys.key(&["dead-letter", "queue", q.as_str()])),
            remove: Script::new(REMOVE),
        }
    }

    fn queue_index(&self, queue: QueueName) -> &str {
        &self.by_queue[queue as usize]
    }

    fn decode(&self, raw: &str) -> Result<DeadLetterRecord, StoreError> {
        serde_json::from_str(raw).map_err(|e| corrupt(&self.records, e))
    }

    async fn remove_id(&self, conn: &mut ConnectionManager, id: &str) -> Result<bool, StoreError> {
        let mut invocation = self.remove.key(&self.records);
        invocation.key(&self.by_time);
        for index in &self.by_queue {
            invocation.key(index);
        }
        let removed: i64 = invocation
            .arg(id)
            .invoke_async(conn)
            .await
            .map_err(unavailable)?;
        Ok(removed == 1)
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    #[instrument(skip(self, record), fields(id = %record.id, queue = %record.original_queue), err)]
    async fn insert(&self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        let id = record.id.to_string();
        let at = score(record.failed_at);

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(&self.records, &id, serde_json::to_string(record)?)
            .ignore()
            .zadd(&self.by_time, &id, at)
            .ignore()
            .zadd(self.queue_index(record.original_queue), &id, at)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.records)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|r| self.decode(&r)).transpose()
    }

    async fn list(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let index = queue.map_or(self.by_time.as_str(), |q| self.queue_index(q));
        let last = isize::try_from(limit).unwrap_or(isize::MAX) - 1;

        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(index)
            .arg(0)
            .arg(last)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.records)
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.into_iter().flatten().map(|r| self.decode(&r)).collect()
    }

    async fn all(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(&self.records)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.iter().map(|r| self.decode(r)).collect()
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, id: DeadLetterId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.remove_id(&mut conn, &id.to_string()).await
    }

    #[instrument(skip(self), err)]
    async fn remove_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.by_time)
            .arg("-inf")
            .arg(format!("({}", score(cutoff)))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut removed = 0;
        for id in &expired {
            if self.remove_id(&mut conn, id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
