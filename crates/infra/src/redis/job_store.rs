//! Redis-backed job store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::{debug, error, instrument, warn};

use caseflow_jobs::{Job, JobId, JobState, JobStore, PushOutcome, QueueCounts, QueueName, StoreError};

use super::{KeySpace, corrupt, unavailable};

/// Waiting-set score: priority dominates, ready time breaks ties. Unix
/// milliseconds stay below this factor until the year 2286.
const PRIORITY_SCALE: u64 = 10_000_000_000_000;

/// Due delayed jobs promoted per pop.
const PROMOTE_BATCH: usize = 100;

const PUSH: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
if existing then
  local ok, body = pcall(cjson.decode, existing)
  if ok then
    if body['state'] ~= 'completed' and body['state'] ~= 'failed' then
      return 0
    end
  else
    redis.call('ZREM', KEYS[2], ARGV[1])
    redis.call('ZREM', KEYS[3], ARGV[1])
    redis.call('ZREM', KEYS[5], ARGV[1])
  end
  redis.call('LREM', KEYS[4], 0, ARGV[1])
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
if ARGV[4] == '1' then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
end
return 1
"#;

const POP: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, ARGV[4])
for i = 1, #due, 2 do
  local id = due[i]
  redis.call('ZREM', KEYS[3], id)
  local raw = redis.call('HGET', KEYS[1], id)
  if raw then
    local ok, body = pcall(cjson.decode, raw)
    local priority = ok and tonumber(body['priority']) or 0
    redis.call('ZADD', KEYS[2], priority * tonumber(ARGV[3]) + tonumber(due[i + 1]), id)
  end
end
local next = redis.call('ZPOPMIN', KEYS[2])
if #next == 0 then
  return false
end
local raw = redis.call('HGET', KEYS[1], next[1])
if not raw then
  return false
end
redis.call('ZADD', KEYS[4], ARGV[2], next[1])
return {next[1], raw}
"#;

const COMPLETE: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[1])
redis.call('HINCRBY', KEYS[4], 'completed', 1)
local keep = tonumber(ARGV[3])
local trimmed = redis.call('LRANGE', KEYS[3], keep, -1)
for _, old in ipairs(trimmed) do
  local raw = redis.call('HGET', KEYS[1], old)
  if raw then
    local ok, body = pcall(cjson.decode, raw)
    if ok and body['state'] == 'completed' then
      redis.call('HDEL', KEYS[1], old)
    end
  end
end
if keep == 0 then
  redis.call('DEL', KEYS[3])
else
  redis.call('LTRIM', KEYS[3], 0, keep - 1)
end
return #trimmed
"#;

const RECLAIM: &str = r#"
if redis.call('ZREM', KEYS[3], ARGV[1]) == 1 then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
  return 1
end
return 0
"#;

/// Moves an unreadable body aside, unless it was rewritten meanwhile.
const QUARANTINE: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('LREM', KEYS[5], 0, ARGV[1])
redis.call('HSET', KEYS[6], ARGV[1], ARGV[3])
redis.call('HINCRBY', KEYS[7], 'quarantined', 1)
return 1
"#;

struct QueueKeys {
    jobs: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    counters: String,
    quarantine: String,
}

impl QueueKeys {
    fn new(space: &KeySpace, queue: QueueName) -> Self {
        let key = |suffix| space.key(&["queue", queue.as_str(), suffix]);
        Self {
            jobs: key("jobs"),
            waiting: key("waiting"),
            delayed: key("delayed"),
            active: key("active"),
            completed: key("completed"),
            counters: key("counters"),
            quarantine: key("quarantine"),
        }
    }
}

fn epoch_millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

fn waiting_score(job: &Job) -> u64 {
    u64::from(job.priority) * PRIORITY_SCALE + epoch_millis(job.ready_at())
}

/// A stored body that no longer parses as a job.
#[derive(Debug)]
struct Corrupt {
    id: String,
    raw: String,
    reason: String,
}

#[derive(Debug, Default)]
struct Loaded {
    jobs: Vec<Job>,
    corrupt: Vec<Corrupt>,
}

/// Pair `HMGET` replies with their ids. Missing bodies are dropped.
fn decode_all(ids: &[String], raws: Vec<Option<String>>) -> Loaded {
    let mut loaded = Loaded::default();
    for (id, raw) in ids.iter().zip(raws) {
        let Some(raw) = raw else { continue };
        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => loaded.jobs.push(job),
            Err(e) => loaded.corrupt.push(Corrupt {
                id: id.clone(),
                raw,
                reason: e.to_string(),
            }),
        }
    }
    loaded
}

/// Job store over a shared Redis.
///
/// Pops are a single script: due delayed jobs are promoted, the best waiting
/// job is moved to the active set with its visibility deadline, and its
/// JSON returned. Two instances can never pop the same id.
///
/// A body that fails to decode is moved to the queue's `quarantine` hash
/// with the reason and removed from every set, so it cannot wedge pops or
/// stall recovery.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    keys: KeySpace,
    push: Script,
    pop: Script,
    complete: Script,
    reclaim: Script,
    quarantine: Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore").field("keys", &self.keys).finish()
    }
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            conn,
            keys,
            push: Script::new(PUSH),
            pop: Script::new(POP),
            complete: Script::new(COMPLETE),
            reclaim: Script::new(RECLAIM),
            quarantine: Script::new(QUARANTINE),
        }
    }

    fn queue_keys(&self, queue: QueueName) -> QueueKeys {
        QueueKeys::new(&self.keys, queue)
    }

    fn decode(key: &str, raw: &str) -> Result<Job, StoreError> {
        serde_json::from_str(raw).map_err(|e| corrupt(key, e))
    }

    async fn load(&self, keys: &QueueKeys, ids: &[String]) -> Result<Loaded, StoreError> {
        if ids.is_empty() {
            return Ok(Loaded::default());
        }
        let mut conn = self.conn.clone();
        let raws: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.jobs)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(decode_all(ids, raws))
    }

    async fn quarantine(
        &self,
        keys: &QueueKeys,
        bad: &Corrupt,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let entry = serde_json::json!({
            "raw": bad.raw,
            "reason": bad.reason,
            "at": now.to_rfc3339(),
        });

        let mut conn = self.conn.clone();
        let moved: i64 = self
            .quarantine
            .key(&keys.jobs)
            .key(&keys.waiting)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.completed)
            .key(&keys.quarantine)
            .key(&keys.counters)
            .arg(&bad.id)
            .arg(&bad.raw)
            .arg(entry.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if moved == 1 {
            error!(job_id = %bad.id, reason = %bad.reason, "corrupt job body quarantined");
        }
        Ok(moved == 1)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id), err)]
    async fn push(&self, job: Job) -> Result<PushOutcome, StoreError> {
        let keys = self.queue_keys(job.queue);
        let json = serde_json::to_string(&job)?;
        let (score, delayed) = match (job.state, job.delay_until) {
            (JobState::Delayed, Some(at)) => (epoch_millis(at), "1"),
            _ => (waiting_score(&job), "0"),
        };

        let mut conn = self.conn.clone();
        let created: i64 = self
            .push
            .key(&keys.jobs)
            .key(&keys.waiting)
            .key(&keys.delayed)
            .key(&keys.completed)
            .key(&keys.active)
            .arg(job.id.as_str())
            .arg(json)
            .arg(score)
            .arg(delayed)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(if created == 1 {
            PushOutcome::Created
        } else {
            PushOutcome::Duplicate
        })
    }

    #[instrument(skip(self), err)]
    async fn pop_ready(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let keys = self.queue_keys(queue);
        let visible_at = now
            + chrono::Duration::from_std(visibility_timeout).unwrap_or(chrono::Duration::MAX);

        let mut conn = self.conn.clone();
        let mut job = loop {
            let popped: Option<(String, String)> = self
                .pop
                .key(&keys.jobs)
                .key(&keys.waiting)
                .key(&keys.delayed)
                .key(&keys.active)
                .arg(epoch_millis(now))
                .arg(epoch_millis(visible_at))
                .arg(PRIORITY_SCALE)
                .arg(PROMOTE_BATCH)
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;

            let Some((id, raw)) = popped else {
                return Ok(None);
            };
            match serde_json::from_str::<Job>(&raw) {
                Ok(job) => break job,
                Err(e) => {
                    let bad = Corrupt {
                        id,
                        raw,
                        reason: e.to_string(),
                    };
                    self.quarantine(&keys, &bad, now).await?;
                }
            }
        };
        job.mark_active(now, visibility_timeout);

        redis::cmd("HSET")
            .arg(&keys.jobs)
            .arg(job.id.as_str())
            .arg(serde_json::to_string(&job)?)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(Some(job))
    }

    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id), err)]
    async fn reschedule(&self, job: &Job) -> Result<(), StoreError> {
        let keys = self.queue_keys(job.queue);
        let due = epoch_millis(job.delay_until.unwrap_or(job.updated_at));

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(&keys.jobs, job.id.as_str(), serde_json::to_string(job)?)
            .ignore()
            .zrem(&keys.active, job.id.as_str())
            .ignore()
            .zadd(&keys.delayed, job.id.as_str(), due)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id), err)]
    async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        let keys = self.queue_keys(job.queue);

        let mut conn = self.conn.clone();
        let trimmed: i64 = self
            .complete
            .key(&keys.jobs)
            .key(&keys.active)
            .key(&keys.completed)
            .key(&keys.counters)
            .arg(job.id.as_str())
            .arg(serde_json::to_string(job)?)
            .arg(keep)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if trimmed > 0 {
            debug!(trimmed, "trimmed completed jobs");
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id), err)]
    async fn discard_failed(&self, job: &Job) -> Result<(), StoreError> {
        let keys = self.queue_keys(job.queue);

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hdel(&keys.jobs, job.id.as_str())
            .ignore()
            .zrem(&keys.active, job.id.as_str())
            .ignore()
            .hincr(&keys.counters, "failed", 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stalled(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let keys = self.queue_keys(queue);

        let mut conn = self.conn.clone();
        let stalled: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&keys.active)
            .arg("-inf")
            .arg(epoch_millis(now))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if stalled.is_empty() {
            return Ok(0);
        }

        let loaded = self.load(&keys, &stalled).await?;
        for bad in &loaded.corrupt {
            self.quarantine(&keys, bad, now).await?;
        }

        let mut reclaimed = 0;
        for mut job in loaded.jobs {
            job.state = JobState::Waiting;
            job.visible_at = None;
            job.delay_until = None;
            job.updated_at = now;

            let moved: i64 = self
                .reclaim
                .key(&keys.jobs)
                .key(&keys.waiting)
                .key(&keys.active)
                .arg(job.id.as_str())
                .arg(serde_json::to_string(&job)?)
                .arg(waiting_score(&job))
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if moved == 1 {
                warn!(job_id = %job.id, "reclaimed stalled job");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, StoreError> {
        let keys = self.queue_keys(queue);

        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&keys.jobs)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|r| Self::decode(&keys.jobs, &r)).transpose()
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError> {
        let keys = self.queue_keys(queue);

        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed, quarantined): (
            u64,
            u64,
            u64,
            Option<u64>,
            Option<u64>,
            Option<u64>,
        ) = redis::pipe()
            .zcard(&keys.waiting)
            .zcard(&keys.delayed)
            .zcard(&keys.active)
            .hget(&keys.counters, "completed")
            .hget(&keys.counters, "failed")
            .hget(&keys.counters, "quarantined")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            quarantined: quarantined.unwrap_or(0),
        })
    }

    async fn list(
        &self,
        queue: QueueName,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.queue_keys(queue);
        let last = isize::try_from(limit).unwrap_or(isize::MAX) - 1;

        let mut conn = self.conn.clone();
        let ids: Vec<String> = match state {
            JobState::Waiting | JobState::Delayed | JobState::Active => {
                let set = match state {
                    JobState::Waiting => &keys.waiting,
                    JobState::Delayed => &keys.delayed,
                    _ => &keys.active,
                };
                redis::cmd("ZRANGE")
                    .arg(set)
                    .arg(0)
                    .arg(last)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?
            }
            JobState::Completed => {
                // Newest first in the list; the tail holds the oldest.
                let mut ids: Vec<String> = redis::cmd("LRANGE")
                    .arg(&keys.completed)
                    .arg(-(last + 1))
                    .arg(-1)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                ids.reverse();
                ids
            }
            // Exhausted jobs live in the dead-letter store only.
            JobState::Failed => Vec::new(),
        };

        let loaded = self.load(&keys, &ids).await?;
        for bad in &loaded.corrupt {
            warn!(job_id = %bad.id, reason = %bad.reason, "skipping unreadable job body");
        }
        let mut jobs = loaded.jobs;
        for job in &mut jobs {
            job.state = state;
        }
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, queue: QueueName, id: &JobId) -> Result<bool, StoreError> {
        let keys = self.queue_keys(queue);

        let mut conn = self.conn.clone();
        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .hdel(&keys.jobs, id.as_str())
            .zrem(&keys.waiting, id.as_str())
            .ignore()
            .zrem(&keys.delayed, id.as_str())
            .ignore()
            .zrem(&keys.active, id.as_str())
            .ignore()
            .lrem(&keys.completed, 0, id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }
}
