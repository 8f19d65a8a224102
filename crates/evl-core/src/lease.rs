//! Time-bounded mutual exclusion keyed by resource name.
//!
//! A lease is live while `expires_at_ms > now`; an expired lease is logically
//! absent and anyone may take the resource over. Every grant carries a random
//! token and release is conditional on it, so a holder that outlived its TTL
//! cannot evict whoever acquired the resource after it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::util::now_millis;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);
pub const MIN_LEASE_TTL_MS: u64 = 100;

/// Proof of a granted lease. Needed to release it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub resource: String,
    pub token: String,
    /// Epoch millis when the lease was granted.
    pub acquired_at_ms: u64,
    /// Epoch millis when the lease expires.
    pub expires_at_ms: u64,
}

impl LeaseToken {
    pub fn grant(resource: &str, ttl: Duration) -> Self {
        let now = now_millis();
        Self {
            resource: resource.to_string(),
            token: Uuid::new_v4().to_string(),
            acquired_at_ms: now,
            expires_at_ms: now.saturating_add(clamp_ttl_ms(ttl)),
        }
    }

    pub fn is_live_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

pub fn clamp_ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(MIN_LEASE_TTL_MS)
}

/// Distributed lock over named resources.
///
/// None of these operations return errors: acquisition problems resolve to
/// "not acquired", lock checks fail safe to "locked", and release problems to
/// "nothing released" (the lease then simply runs out).
#[async_trait::async_trait]
pub trait LeaseManager: Send + Sync {
    /// Grant a fresh lease on `resource` unless a live one exists.
    async fn acquire(&self, resource: &str, ttl: Duration) -> Option<LeaseToken>;

    /// Drop the lease identified by `lease`; true when a record was removed.
    async fn release(&self, lease: &LeaseToken) -> bool;

    /// Drop whatever lease exists on `resource`, regardless of holder.
    async fn force_release(&self, resource: &str) -> bool;

    async fn is_locked(&self, resource: &str) -> bool;

    /// Time left on the live lease for `resource`.
    async fn remaining(&self, resource: &str) -> Option<Duration>;

    async fn live_leases(&self) -> Vec<LeaseToken>;
}

/// Lease table held in process memory. Excludes concurrent workers of one
/// process only.
#[derive(Clone, Default)]
pub struct MemoryLeaseManager {
    leases: Arc<Mutex<HashMap<String, LeaseToken>>>,
}

impl MemoryLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LeaseManager for MemoryLeaseManager {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Option<LeaseToken> {
        let mut leases = self.leases.lock().await;
        let now = now_millis();
        leases.retain(|_, l| l.is_live_at(now));
        if leases.contains_key(resource) {
            tracing::debug!(target: "evl::lease", resource, "resource already leased");
            return None;
        }
        let lease = LeaseToken::grant(resource, ttl);
        leases.insert(resource.to_string(), lease.clone());
        tracing::debug!(
            target: "evl::lease",
            resource,
            expires_at_ms = lease.expires_at_ms,
            "lease acquired"
        );
        Some(lease)
    }

    async fn release(&self, lease: &LeaseToken) -> bool {
        let mut leases = self.leases.lock().await;
        let owned = leases
            .get(&lease.resource)
            .is_some_and(|held| held.token == lease.token);
        if owned {
            leases.remove(&lease.resource);
            tracing::debug!(target: "evl::lease", resource = %lease.resource, "lease released");
        } else {
            tracing::debug!(
                target: "evl::lease",
                resource = %lease.resource,
                "no lease held under this token"
            );
        }
        owned
    }

    async fn force_release(&self, resource: &str) -> bool {
        self.leases.lock().await.remove(resource).is_some()
    }

    async fn is_locked(&self, resource: &str) -> bool {
        let now = now_millis();
        self.leases
            .lock()
            .await
            .get(resource)
            .is_some_and(|l| l.is_live_at(now))
    }

    async fn remaining(&self, resource: &str) -> Option<Duration> {
        let now = now_millis();
        let leases = self.leases.lock().await;
        let lease = leases.get(resource).filter(|l| l.is_live_at(now))?;
        Some(Duration::from_millis(lease.expires_at_ms - now))
    }

    async fn live_leases(&self) -> Vec<LeaseToken> {
        let now = now_millis();
        let mut out: Vec<LeaseToken> = self
            .leases
            .lock()
            .await
            .values()
            .filter(|l| l.is_live_at(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }
}
