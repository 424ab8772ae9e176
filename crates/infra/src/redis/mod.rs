//! Redis adapters for the job subsystem.
//!
//! Every multi-key transition is a Lua script or an atomic pipeline, so
//! instances sharing one Redis never observe half-applied state.
//!
//! ## Key layout
//!
//! - `{prefix}:queue:{queue}:jobs`: hash, job id → job JSON
//! - `{prefix}:queue:{queue}:waiting`: zset scored by priority, then ready time
//! - `{prefix}:queue:{queue}:delayed`: zset scored by `delay_until`
//! - `{prefix}:queue:{queue}:active`: zset scored by visibility deadline
//! - `{prefix}:queue:{queue}:completed`: list, newest first
//! - `{prefix}:queue:{queue}:counters`: hash (`completed`, `failed`)
//! - `{prefix}:lease:{key}`: leader lease, value is the holder's instance id
//! - `{prefix}:dead-letter:*`: dead-letter records and their indexes
//! - `{prefix}:progress:{tenant}:{id}`: progress snapshots with TTL

mod dead_letter_store;
mod job_store;
mod lease_store;
mod progress_store;

pub use dead_letter_store::RedisDeadLetterStore;
pub use job_store::RedisJobStore;
pub use lease_store::RedisLeaseStore;
pub use progress_store::RedisProgressStore;

use redis::RedisError;
use redis::aio::ConnectionManager;

use caseflow_jobs::StoreError;

/// Open a multiplexed, auto-reconnecting connection.
pub async fn connect(url: &str) -> Result<ConnectionManager, RedisError> {
    let client = redis::Client::open(url)?;
    client.get_connection_manager().await
}

/// Key namespace shared by all adapters of one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }
}

pub(crate) fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

pub(crate) fn corrupt(key: &str, e: serde_json::Error) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

pub(crate) fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
