//! Redis-backed leader leases.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::instrument;

use caseflow_jobs::{InstanceId, LeaseStore, StoreError};

use super::{KeySpace, millis, unavailable};

const REFRESH_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// `SET NX PX` leases; compare-and-act through scripts.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    keys: KeySpace,
    refresh: Script,
    release: Script,
}

impl std::fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLeaseStore").field("keys", &self.keys).finish()
    }
}

impl RedisLeaseStore {
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            conn,
            keys,
            refresh: Script::new(REFRESH_IF_OWNER),
            release: Script::new(RELEASE_IF_OWNER),
        }
    }

    fn lease_key(&self, key: &str) -> String {
        self.keys.key(&["lease", key])
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    #[instrument(skip(self), err)]
    async fn try_acquire(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(key))
            .arg(owner.as_str())
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn owner(&self, key: &str) -> Result<Option<InstanceId>, StoreError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(self.lease_key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(holder.map(InstanceId::from))
    }

    #[instrument(skip(self), err)]
    async fn refresh_if_owner(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .refresh
            .key(self.lease_key(key))
            .arg(owner.as_str())
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(refreshed == 1)
    }

    #[instrument(skip(self), err)]
    async fn release_if_owner(&self, key: &str, owner: &InstanceId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.lease_key(key))
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseflow_jobs::LeaderElector;
    use std::sync::Arc;

    /// Needs a disposable Redis at `CASEFLOW_TEST_REDIS_URL`.
    #[tokio::test]
    #[ignore]
    async fn only_one_instance_holds_the_lease() {
        let Ok(url) = std::env::var("CASEFLOW_TEST_REDIS_URL") else {
            return;
        };
        let conn = super::super::connect(&url).await.unwrap();
        let store = Arc::new(RedisLeaseStore::new(
            conn,
            KeySpace::new(format!("test:{}", InstanceId::new())),
        ));
        let ttl = Duration::from_secs(5);
        let a = LeaderElector::new(store.clone(), InstanceId::from("a"));
        let b = LeaderElector::new(store.clone(), InstanceId::from("b"));

        assert!(a.try_become_leader("court-sync", ttl).await);
        assert!(!b.try_become_leader("court-sync", ttl).await);
        // The holder re-checks by refreshing.
        assert!(a.try_become_leader("court-sync", ttl).await);

        assert!(!store.release_if_owner("court-sync", &InstanceId::from("b")).await.unwrap());
        assert!(store.release_if_owner("court-sync", &InstanceId::from("a")).await.unwrap());
        assert!(b.try_become_leader("court-sync", ttl).await);
    }
}
