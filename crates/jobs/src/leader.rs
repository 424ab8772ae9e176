//! Leader election on top of a conditional-set-with-TTL store.
//!
//! Every instance runs the same schedules; the lease decides which one is
//! allowed to act. Mutual exclusion is bounded by the TTL and the refresh
//! interval, not by consensus: if a leader stalls past its TTL another
//! instance can acquire, so scheduled fan-out must stay idempotent downstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;

/// Identifies one running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Atomic lease primitives. Every method must be a single atomic operation
/// against the shared store; none may be emulated with read-then-write.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Set `key` to `owner` with `ttl` only if absent (`SET NX PX`).
    async fn try_acquire(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Current holder, if the lease exists.
    async fn owner(&self, key: &str) -> Result<Option<InstanceId>, StoreError>;

    /// Extend the TTL only if `owner` still holds the lease.
    async fn refresh_if_owner(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete the lease only if `owner` holds it.
    async fn release_if_owner(&self, key: &str, owner: &InstanceId) -> Result<bool, StoreError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaderError {
    #[error("lease refresh interval {refresh:?} must be shorter than ttl {ttl:?}")]
    RefreshNotShorterThanTtl { ttl: Duration, refresh: Duration },
    #[error("lease ttl must be positive")]
    ZeroTtl,
}

/// Lease timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderConfig {
    pub ttl: Duration,
    pub refresh_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
        }
    }
}

impl LeaderConfig {
    pub fn new(ttl: Duration, refresh_interval: Duration) -> Result<Self, LeaderError> {
        if ttl.is_zero() {
            return Err(LeaderError::ZeroTtl);
        }
        if refresh_interval >= ttl {
            return Err(LeaderError::RefreshNotShorterThanTtl {
                ttl,
                refresh: refresh_interval,
            });
        }
        Ok(Self {
            ttl,
            refresh_interval,
        })
    }
}

/// Advisory leader election for one instance.
#[derive(Clone)]
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    instance_id: InstanceId,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LeaseStore>, instance_id: InstanceId) -> Self {
        Self { store, instance_id }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Acquire `key`, or re-affirm it when this instance already holds it.
    ///
    /// Fails closed: a store error is logged and reported as "not leader".
    pub async fn try_become_leader(&self, key: &str, ttl: Duration) -> bool {
        match self.try_become_leader_inner(key, ttl).await {
            Ok(leader) => leader,
            Err(e) => {
                warn!(
                    key,
                    instance_id = %self.instance_id,
                    error = %e,
                    "lease store unreachable, assuming not leader"
                );
                false
            }
        }
    }

    async fn try_become_leader_inner(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        if self.store.try_acquire(key, &self.instance_id, ttl).await? {
            debug!(key, instance_id = %self.instance_id, "lease acquired");
            return Ok(true);
        }
        self.store
            .refresh_if_owner(key, &self.instance_id, ttl)
            .await
    }

    pub async fn current_leader(&self, key: &str) -> Result<Option<InstanceId>, StoreError> {
        self.store.owner(key).await
    }

    /// Give up `key` if held. Returns whether a lease was released.
    pub async fn resign(&self, key: &str) -> Result<bool, StoreError> {
        let released = self.store.release_if_owner(key, &self.instance_id).await?;
        if released {
            info!(key, instance_id = %self.instance_id, "lease released");
        }
        Ok(released)
    }

    /// Keep `key` renewed every `config.refresh_interval`, tracking whether
    /// this instance currently leads. Resigns on shutdown.
    pub fn spawn_renewal(
        &self,
        key: impl Into<String>,
        config: LeaderConfig,
        cancel: CancellationToken,
    ) -> RenewalHandle {
        let key = key.into();
        let is_leader = Arc::new(AtomicBool::new(false));
        let elector = self.clone();
        let flag = is_leader.clone();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now_leader = elector.try_become_leader(&key, config.ttl).await;
                let was_leader = flag.swap(now_leader, Ordering::SeqCst);
                if now_leader != was_leader {
                    info!(
                        key = %key,
                        instance_id = %elector.instance_id,
                        leader = now_leader,
                        "leadership changed"
                    );
                }
            }

            if flag.swap(false, Ordering::SeqCst) {
                if let Err(e) = elector.resign(&key).await {
                    warn!(key = %key, error = %e, "failed to release lease on shutdown");
                }
            }
        });

        RenewalHandle {
            is_leader,
            cancel,
            join,
        }
    }
}

/// Handle to a running renewal loop.
#[derive(Debug)]
pub struct RenewalHandle {
    is_leader: Arc<AtomicBool>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl RenewalHandle {
    /// Cached view from the last renewal; scheduled actions still check the
    /// lease synchronously before firing.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "lease renewal task panicked");
        }
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: InstanceId,
    expires_at: Instant,
}

/// In-memory lease store for tests/dev. Uses tokio's clock so paused-time
/// tests can drive expiry.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn live<'a>(leases: &'a mut HashMap<String, Lease>, key: &str) -> Option<&'a mut Lease> {
        let now = Instant::now();
        if leases.get(key).is_some_and(|l| l.expires_at <= now) {
            leases.remove(key);
        }
        leases.get_mut(key)
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock();
        if Self::live(&mut leases, key).is_some() {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn owner(&self, key: &str) -> Result<Option<InstanceId>, StoreError> {
        let mut leases = self.leases.lock();
        Ok(Self::live(&mut leases, key).map(|l| l.owner.clone()))
    }

    async fn refresh_if_owner(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock();
        match Self::live(&mut leases, key) {
            Some(lease) if &lease.owner == owner => {
                lease.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_if_owner(&self, key: &str, owner: &InstanceId) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock();
        let owned = Self::live(&mut leases, key).is_some_and(|l| &l.owner == owner);
        if owned {
            leases.remove(key);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "leader:court-sync";
    const TTL: Duration = Duration::from_secs(30);

    struct Unreachable;

    #[async_trait]
    impl LeaseStore for Unreachable {
        async fn try_acquire(&self, _: &str, _: &InstanceId, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn owner(&self, _: &str) -> Result<Option<InstanceId>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn refresh_if_owner(&self, _: &str, _: &InstanceId, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn release_if_owner(&self, _: &str, _: &InstanceId) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn pair() -> (LeaderElector, LeaderElector) {
        let store = InMemoryLeaseStore::arc();
        (
            LeaderElector::new(store.clone(), InstanceId::from("a")),
            LeaderElector::new(store, InstanceId::from("b")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_instance_leads() {
        let (a, b) = pair();

        let (ra, rb) = tokio::join!(a.try_become_leader(KEY, TTL), b.try_become_leader(KEY, TTL));
        assert!(ra ^ rb);

        // The holder re-affirms; the other keeps losing.
        let (leader, follower) = if ra { (&a, &b) } else { (&b, &a) };
        assert!(leader.try_become_leader(KEY, TTL).await);
        assert!(!follower.try_become_leader(KEY, TTL).await);
        assert_eq!(
            follower.current_leader(KEY).await.unwrap().as_ref(),
            Some(leader.instance_id())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_refresh() {
        let (a, b) = pair();
        assert!(a.try_become_leader(KEY, TTL).await);

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(b.try_become_leader(KEY, TTL).await);
        assert!(!a.try_become_leader(KEY, TTL).await);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_the_lease() {
        let (a, b) = pair();
        assert!(a.try_become_leader(KEY, TTL).await);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(a.try_become_leader(KEY, TTL).await);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!b.try_become_leader(KEY, TTL).await);
    }

    #[tokio::test]
    async fn resign_only_releases_own_lease() {
        let (a, b) = pair();
        assert!(a.try_become_leader(KEY, TTL).await);

        assert!(!b.resign(KEY).await.unwrap());
        assert!(a.resign(KEY).await.unwrap());
        assert!(b.try_become_leader(KEY, TTL).await);
    }

    #[tokio::test]
    async fn unreachable_store_fails_closed() {
        let elector = LeaderElector::new(Arc::new(Unreachable), InstanceId::from("a"));
        assert!(!elector.try_become_leader(KEY, TTL).await);
    }

    #[test]
    fn refresh_must_be_shorter_than_ttl() {
        assert!(LeaderConfig::new(Duration::from_secs(30), Duration::from_secs(10)).is_ok());
        assert_eq!(
            LeaderConfig::new(Duration::from_secs(10), Duration::from_secs(10)),
            Err(LeaderError::RefreshNotShorterThanTtl {
                ttl: Duration::from_secs(10),
                refresh: Duration::from_secs(10),
            })
        );
        assert_eq!(
            LeaderConfig::new(Duration::ZERO, Duration::ZERO),
            Err(LeaderError::ZeroTtl)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_tracks_leadership_and_resigns() {
        let (a, b) = pair();
        let config = LeaderConfig::default();

        let handle = a.spawn_renewal(KEY, config, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(handle.is_leader());

        // Renewal keeps the lease past the original TTL.
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(handle.is_leader());
        assert!(!b.try_become_leader(KEY, config.ttl).await);

        handle.shutdown().await;
        assert!(b.try_become_leader(KEY, config.ttl).await);
    }
}
