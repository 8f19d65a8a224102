use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt as _;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{CycleReport, LoaderConfig, SourceOutcome};
use crate::util::now_millis;
use crate::{EventSource, EventStore, LeaseManager, LoadError, ThrottleTracker};

/// Cycle engine: visits every source in order, one at a time, and moves new
/// events from the source into the store under that source's lease.
///
/// Several loaders (in one process or many) may share the same lease and
/// throttle backends; the lease guarantees at most one of them polls a given
/// source at any moment.
pub struct Loader<S: ?Sized, L: ?Sized, T: ?Sized> {
    store: Arc<S>,
    leases: Arc<L>,
    throttle: Arc<T>,
    sources: RwLock<Vec<Arc<dyn EventSource>>>,
    config: LoaderConfig,
    cancel: CancellationToken,
}

impl<S, L, T> Loader<S, L, T>
where
    S: EventStore + ?Sized,
    L: LeaseManager + ?Sized,
    T: ThrottleTracker + ?Sized,
{
    pub fn new(store: Arc<S>, leases: Arc<L>, throttle: Arc<T>, config: LoaderConfig) -> Self {
        Self {
            store,
            leases,
            throttle,
            sources: RwLock::new(Vec::new()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Arc<dyn EventSource>>) -> Self {
        self.sources.get_mut().extend(sources);
        self
    }

    /// Use `token` to stop the loader; checked between sources and cycles.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Append a source; it takes part from the next cycle on.
    pub async fn add_source(&self, source: Arc<dyn EventSource>) {
        info!(target: "evl::loader", source = source.name(), "source added");
        self.sources.write().await.push(source);
    }

    pub async fn source_names(&self) -> Vec<String> {
        self.sources
            .read()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Run `cycles` passes over all sources, or until cancelled when `cycles`
    /// is zero. Returns the number of events stored.
    pub async fn run(&self, cycles: u32) -> u64 {
        let mut total: u64 = 0;
        let mut completed: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                info!(target: "evl::loader", completed, "loader cancelled");
                break;
            }
            let report = self.run_cycle().await;
            total += report.loaded as u64;
            completed = completed.saturating_add(1);
            debug!(
                target: "evl::loader",
                cycle = completed,
                loaded = report.loaded,
                total,
                "cycle finished"
            );
            if cycles != 0 && completed >= cycles {
                break;
            }
            // nothing moved: don't spin while every source is quiet or leased elsewhere
            if report.loaded == 0 && !self.config.idle_backoff.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.idle_backoff) => {}
                }
            }
        }
        total
    }

    /// One pass over the sources registered at the time of the call.
    pub async fn run_cycle(&self) -> CycleReport {
        let sources: Vec<Arc<dyn EventSource>> = self.sources.read().await.clone();
        let mut report = CycleReport::default();
        for source in &sources {
            let outcome = if self.cancel.is_cancelled() {
                SourceOutcome::Cancelled
            } else {
                self.poll_source(source.as_ref()).await
            };
            report.push(source.name(), outcome);
        }
        report
    }

    async fn poll_source(&self, source: &dyn EventSource) -> SourceOutcome {
        let name = source.name();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return SourceOutcome::Cancelled,
            _ = self.throttle.wait_for_minimum_interval(name, self.config.min_request_interval) => {}
        }

        let Some(lease) = self.leases.acquire(name, self.config.lease_ttl).await else {
            info!(
                target: "evl::loader",
                source = name,
                "source is being processed by another loader"
            );
            return SourceOutcome::LockDenied;
        };

        // The lease is released before the result is looked at, whichever way
        // the work ended (including a panicking adapter).
        let result = AssertUnwindSafe(self.load_locked(source))
            .catch_unwind()
            .await;
        if !self.leases.release(&lease).await {
            warn!(
                target: "evl::loader",
                source = name,
                "lease was no longer held at release; work outlived the lease ttl"
            );
        }

        match result {
            Ok(Ok(0)) => SourceOutcome::Empty,
            Ok(Ok(n)) => SourceOutcome::Loaded(n),
            Ok(Err(err)) => {
                error!(
                    target: "evl::loader",
                    source = name,
                    error = %err,
                    "error loading events"
                );
                SourceOutcome::Failed(err.to_string())
            }
            Err(_) => {
                error!(target: "evl::loader", source = name, "source panicked while loading");
                SourceOutcome::Failed("panicked while loading".to_string())
            }
        }
    }

    async fn load_locked(&self, source: &dyn EventSource) -> Result<usize, LoadError> {
        let name = source.name();
        let cursor = self.store.last_event_id(name).await?;

        let fetched = source.fetch(cursor).await;
        // the request went out even if the response was unusable
        self.throttle.record_request(name, now_millis()).await;
        let mut events = fetched?;

        if let Some(cursor) = cursor {
            let before = events.len();
            events.retain(|ev| ev.id > cursor);
            if events.len() < before {
                warn!(
                    target: "evl::loader",
                    source = name,
                    cursor,
                    dropped = before - events.len(),
                    "source returned events at or below the cursor"
                );
            }
        }

        if events.is_empty() {
            debug!(target: "evl::loader", source = name, "no new events");
            return Ok(0);
        }

        let max = self.config.max_events_per_request;
        if events.len() > max {
            warn!(
                target: "evl::loader",
                source = name,
                returned = events.len(),
                max,
                "source returned more than the maximum allowed events; truncating"
            );
            events.truncate(max);
        }

        self.store.store(&events).await?;
        let count = events.len();
        info!(
            target: "evl::loader",
            source = name,
            count,
            last_id = events[count - 1].id,
            "loaded events"
        );
        Ok(count)
    }
}
