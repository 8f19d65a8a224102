use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use evl_core::{
    now_millis, Event, EventStore, LeaseManager, LeaseToken, StoreError, StoredEvent,
    ThrottleTracker,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::Kernel;

/// Lease manager over the shared `leases` table.
#[derive(Clone)]
pub struct SqliteLeaseManager {
    kernel: Kernel,
}

impl SqliteLeaseManager {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }
}

#[async_trait::async_trait]
impl LeaseManager for SqliteLeaseManager {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Option<LeaseToken> {
        let r = resource.to_string();
        match self
            .kernel
            .run_blocking(move |k| k.try_acquire_lease(&r, ttl))
            .await
        {
            Ok(Some(lease)) => {
                debug!(
                    target: "evl::lease",
                    resource,
                    expires_at_ms = lease.expires_at_ms,
                    "lease acquired"
                );
                Some(lease)
            }
            Ok(None) => None,
            Err(err) => {
                error!(
                    target: "evl::lease",
                    resource,
                    error = %err,
                    "database error while acquiring lease"
                );
                None
            }
        }
    }

    async fn release(&self, lease: &LeaseToken) -> bool {
        let r = lease.resource.clone();
        let t = lease.token.clone();
        match self
            .kernel
            .run_blocking(move |k| k.release_lease(&r, &t))
            .await
        {
            Ok(true) => {
                debug!(target: "evl::lease", resource = %lease.resource, "lease released");
                true
            }
            Ok(false) => {
                debug!(
                    target: "evl::lease",
                    resource = %lease.resource,
                    "no lease held under this token"
                );
                false
            }
            Err(err) => {
                error!(
                    target: "evl::lease",
                    resource = %lease.resource,
                    error = %err,
                    "database error while releasing lease"
                );
                false
            }
        }
    }

    async fn force_release(&self, resource: &str) -> bool {
        let r = resource.to_string();
        self.kernel
            .run_blocking(move |k| k.force_release_lease(&r))
            .await
            .unwrap_or_else(|err| {
                error!(target: "evl::lease", resource, error = %err, "database error while force-releasing lease");
                false
            })
    }

    async fn is_locked(&self, resource: &str) -> bool {
        let r = resource.to_string();
        self.kernel
            .run_blocking(move |k| k.lease_is_live(&r))
            .await
            .unwrap_or_else(|err| {
                // report locked: a false "free" could let two loaders in
                error!(target: "evl::lease", resource, error = %err, "database error while checking lease");
                true
            })
    }

    async fn remaining(&self, resource: &str) -> Option<Duration> {
        let r = resource.to_string();
        match self.kernel.run_blocking(move |k| k.lease_expiry(&r)).await {
            Ok(exp) => exp.map(|at| Duration::from_millis(at.saturating_sub(now_millis()))),
            Err(err) => {
                warn!(target: "evl::lease", resource, error = %err, "failed to read lease expiry");
                None
            }
        }
    }

    async fn live_leases(&self) -> Vec<LeaseToken> {
        self.kernel
            .run_blocking(|k| k.list_leases())
            .await
            .unwrap_or_else(|err| {
                warn!(target: "evl::lease", error = %err, "failed to list leases");
                Vec::new()
            })
    }
}

/// Throttle tracker over the shared `request_times` table with an in-process
/// cache. Reads prefer the table (other loaders write there too) and fall
/// back to the cache when the table cannot be read.
#[derive(Clone)]
pub struct SqliteThrottle {
    kernel: Kernel,
    cache: Arc<Mutex<HashMap<String, u64>>>,
}

impl SqliteThrottle {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn remember(&self, source: &str, at_ms: u64) -> u64 {
        let mut cache = self.cache.lock().await;
        let slot = cache.entry(source.to_string()).or_insert(at_ms);
        *slot = (*slot).max(at_ms);
        *slot
    }
}

#[async_trait::async_trait]
impl ThrottleTracker for SqliteThrottle {
    async fn record_request(&self, source: &str, at_ms: u64) {
        self.remember(source, at_ms).await;
        let s = source.to_string();
        if let Err(err) = self
            .kernel
            .run_blocking(move |k| k.set_last_request_time(&s, at_ms))
            .await
        {
            warn!(
                target: "evl::throttle",
                source,
                error = %err,
                "failed to record request time"
            );
        }
    }

    async fn last_request_time(&self, source: &str) -> Option<u64> {
        let s = source.to_string();
        match self
            .kernel
            .run_blocking(move |k| k.last_request_time(&s))
            .await
        {
            Ok(Some(stored)) => Some(self.remember(source, stored).await),
            Ok(None) => self.cache.lock().await.get(source).copied(),
            Err(err) => {
                warn!(
                    target: "evl::throttle",
                    source,
                    error = %err,
                    "failed to read request time; using cached value"
                );
                self.cache.lock().await.get(source).copied()
            }
        }
    }
}

/// Cursor and sink over the shared `events` table.
#[derive(Clone)]
pub struct SqliteEventStore {
    kernel: Kernel,
}

impl SqliteEventStore {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }
}

#[async_trait::async_trait]
impl EventStore for SqliteEventStore {
    async fn last_event_id(&self, source: &str) -> Result<Option<i64>, StoreError> {
        let s = source.to_string();
        self.kernel
            .run_blocking(move |k| k.last_event_id(&s))
            .await
            .map_err(StoreError::backend)
    }

    async fn store(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let batch = events.to_vec();
        self.kernel
            .run_blocking(move |k| k.append_events(&batch))
            .await
            .map(|_| ())
            .map_err(|err| {
                let constraint = err
                    .downcast_ref::<rusqlite::Error>()
                    .and_then(|e| e.sqlite_error_code())
                    == Some(rusqlite::ErrorCode::ConstraintViolation);
                if constraint {
                    warn!(target: "evl::store", error = %err, "batch rejected; nothing stored");
                    StoreError::Rejected(err.to_string())
                } else {
                    error!(target: "evl::store", error = %err, "failed to append events");
                    StoreError::backend(err)
                }
            })
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.kernel
            .run_blocking(move |k| k.recent_events(limit))
            .await
            .map_err(StoreError::backend)
    }

    async fn count(&self, source: Option<&str>) -> Result<u64, StoreError> {
        let s = source.map(str::to_string);
        self.kernel
            .run_blocking(move |k| k.count_events(s.as_deref()))
            .await
            .map_err(StoreError::backend)
    }
}
