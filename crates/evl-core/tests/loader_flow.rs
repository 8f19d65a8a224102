use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evl_core::{
    Event, EventSource, EventStore, FetchError, LeaseManager, Loader, LoaderConfig,
    MemoryEventStore, MemoryLeaseManager, MemoryThrottle, SourceOutcome, StoreError,
    StoredEvent, ThrottleTracker,
};
use tokio::time::timeout;

/// Source that replays a fixed script of fetch results, one per call.
struct ScriptedSource {
    name: String,
    script: Mutex<VecDeque<Result<Vec<i64>, String>>>,
    seen_cursors: Mutex<Vec<Option<i64>>>,
    lease_probe: Option<Arc<MemoryLeaseManager>>,
    locked_during_fetch: AtomicBool,
}

impl ScriptedSource {
    fn new(name: &str, script: Vec<Result<Vec<i64>, String>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            seen_cursors: Mutex::new(Vec::new()),
            lease_probe: None,
            locked_during_fetch: AtomicBool::new(false),
        })
    }

    fn batches(name: &str, batches: &[&[i64]]) -> Arc<Self> {
        Self::new(name, batches.iter().map(|b| Ok(b.to_vec())).collect())
    }

    fn probing(name: &str, ids: &[i64], leases: Arc<MemoryLeaseManager>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::from(vec![Ok(ids.to_vec())])),
            seen_cursors: Mutex::new(Vec::new()),
            lease_probe: Some(leases),
            locked_during_fetch: AtomicBool::new(false),
        })
    }

    fn cursors(&self) -> Vec<Option<i64>> {
        self.seen_cursors.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EventSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, since: Option<i64>) -> Result<Vec<Event>, FetchError> {
        self.seen_cursors.lock().unwrap().push(since);
        if let Some(leases) = &self.lease_probe {
            self.locked_during_fetch
                .store(leases.is_locked(&self.name).await, Ordering::SeqCst);
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(ids)) => Ok(ids
                .into_iter()
                .map(|id| Event::json(id, self.name.clone(), &serde_json::json!({ "id": id })))
                .collect()),
            Some(Err(msg)) => Err(FetchError::Transport(msg)),
            None => Ok(Vec::new()),
        }
    }
}

struct PanickingSource;

#[async_trait::async_trait]
impl EventSource for PanickingSource {
    fn name(&self) -> &str {
        "explodes"
    }

    async fn fetch(&self, _since: Option<i64>) -> Result<Vec<Event>, FetchError> {
        panic!("adapter bug");
    }
}

/// Store wrapper that rejects every batch for one source.
struct RejectingStore {
    inner: MemoryEventStore,
    reject: String,
}

#[async_trait::async_trait]
impl EventStore for RejectingStore {
    async fn last_event_id(&self, source: &str) -> Result<Option<i64>, StoreError> {
        self.inner.last_event_id(source).await
    }

    async fn store(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.iter().any(|e| e.source == self.reject) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.store(events).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner.recent(limit).await
    }

    async fn count(&self, source: Option<&str>) -> Result<u64, StoreError> {
        self.inner.count(source).await
    }
}

fn fast_config() -> LoaderConfig {
    LoaderConfig {
        min_request_interval: Duration::ZERO,
        max_events_per_request: 1000,
        lease_ttl: Duration::from_secs(30),
        idle_backoff: Duration::from_millis(10),
    }
}

type MemLoader<S> = Loader<S, MemoryLeaseManager, MemoryThrottle>;

fn loader_with<S: EventStore>(
    store: Arc<S>,
    leases: Arc<MemoryLeaseManager>,
    config: LoaderConfig,
) -> MemLoader<S> {
    Loader::new(store, leases, Arc::new(MemoryThrottle::new()), config)
}

#[tokio::test]
async fn two_sources_over_two_cycles() {
    let store = Arc::new(MemoryEventStore::new());
    let leases = Arc::new(MemoryLeaseManager::new());
    let a = ScriptedSource::batches("A", &[&[1, 2, 3], &[4, 5]]);
    let b = ScriptedSource::batches("B", &[&[], &[10]]);
    let loader = loader_with(store.clone(), leases.clone(), fast_config())
        .with_sources([a.clone() as Arc<dyn EventSource>, b.clone()]);

    let total = loader.run(2).await;

    assert_eq!(total, 6);
    assert_eq!(store.last_event_id("A").await.unwrap(), Some(5));
    assert_eq!(store.last_event_id("B").await.unwrap(), Some(10));
    assert_eq!(a.cursors(), vec![None, Some(3)]);
    assert_eq!(b.cursors(), vec![None, None]);
    assert!(!leases.is_locked("A").await);
    assert!(!leases.is_locked("B").await);
}

#[tokio::test]
async fn oversized_batch_is_capped_and_cursor_follows_stored_events() {
    let store = Arc::new(MemoryEventStore::new());
    let leases = Arc::new(MemoryLeaseManager::new());
    let source = ScriptedSource::batches("feed", &[&[1, 2, 3, 4, 5], &[4, 5]]);
    let config = LoaderConfig {
        max_events_per_request: 3,
        ..fast_config()
    };
    let loader = loader_with(store.clone(), leases, config)
        .with_sources([source.clone() as Arc<dyn EventSource>]);

    let first = loader.run_cycle().await;
    assert_eq!(first.outcome("feed"), Some(&SourceOutcome::Loaded(3)));
    assert_eq!(store.last_event_id("feed").await.unwrap(), Some(3));
    let ids: Vec<i64> = store.recent(10).await.unwrap().iter().map(|e| e.id).rev().collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // dropped events come back on the next cycle
    let second = loader.run_cycle().await;
    assert_eq!(second.loaded, 2);
    assert_eq!(source.cursors(), vec![None, Some(3)]);
    assert_eq!(store.last_event_id("feed").await.unwrap(), Some(5));
}

#[tokio::test]
async fn events_at_or_below_cursor_are_discarded() {
    let store = Arc::new(MemoryEventStore::new());
    store
        .store(&[Event::new(7, "feed", b"{}".to_vec())])
        .await
        .unwrap();
    let source = ScriptedSource::batches("feed", &[&[6, 7, 8]]);
    let loader = loader_with(store.clone(), Arc::new(MemoryLeaseManager::new()), fast_config())
        .with_sources([source as Arc<dyn EventSource>]);

    let report = loader.run_cycle().await;
    assert_eq!(report.outcome("feed"), Some(&SourceOutcome::Loaded(1)));
    assert_eq!(store.count(Some("feed")).await.unwrap(), 2);
    assert_eq!(store.last_event_id("feed").await.unwrap(), Some(8));
}

#[tokio::test]
async fn lease_is_held_during_fetch_and_released_after() {
    let leases = Arc::new(MemoryLeaseManager::new());
    let source = ScriptedSource::probing("feed", &[1], leases.clone());
    let loader = loader_with(Arc::new(MemoryEventStore::new()), leases.clone(), fast_config())
        .with_sources([source.clone() as Arc<dyn EventSource>]);

    loader.run_cycle().await;
    assert!(source.locked_during_fetch.load(Ordering::SeqCst));
    assert!(!leases.is_locked("feed").await);
}

#[tokio::test]
async fn fetch_failure_releases_lease_and_spares_siblings() {
    let store = Arc::new(MemoryEventStore::new());
    let leases = Arc::new(MemoryLeaseManager::new());
    let throttle = Arc::new(MemoryThrottle::new());
    let broken = ScriptedSource::new("broken", vec![Err("connection reset".into())]);
    let healthy = ScriptedSource::batches("healthy", &[&[1, 2]]);
    let loader = Loader::new(store.clone(), leases.clone(), throttle.clone(), fast_config())
        .with_sources([broken as Arc<dyn EventSource>, healthy]);

    let report = loader.run_cycle().await;

    assert!(matches!(report.outcome("broken"), Some(SourceOutcome::Failed(_))));
    assert_eq!(report.outcome("healthy"), Some(&SourceOutcome::Loaded(2)));
    assert_eq!(report.loaded, 2);
    assert!(!leases.is_locked("broken").await);
    assert_eq!(store.last_event_id("broken").await.unwrap(), None);
    // the failed request still counts for pacing
    assert!(throttle.last_request_time("broken").await.is_some());
}

#[tokio::test]
async fn store_failure_releases_lease_and_keeps_cursor() {
    let store = Arc::new(RejectingStore {
        inner: MemoryEventStore::new(),
        reject: "feed".into(),
    });
    let leases = Arc::new(MemoryLeaseManager::new());
    let source = ScriptedSource::batches("feed", &[&[1, 2, 3], &[1, 2, 3]]);
    let loader = loader_with(store.clone(), leases.clone(), fast_config())
        .with_sources([source.clone() as Arc<dyn EventSource>]);

    let total = loader.run(2).await;

    assert_eq!(total, 0);
    assert!(!leases.is_locked("feed").await);
    assert_eq!(store.last_event_id("feed").await.unwrap(), None);
    assert_eq!(source.cursors(), vec![None, None]);
}

#[tokio::test]
async fn panicking_source_still_releases_its_lease() {
    let leases = Arc::new(MemoryLeaseManager::new());
    let loader = loader_with(Arc::new(MemoryEventStore::new()), leases.clone(), fast_config())
        .with_sources([
            Arc::new(PanickingSource) as Arc<dyn EventSource>,
            ScriptedSource::batches("after", &[&[1]]),
        ]);

    let report = loader.run_cycle().await;

    assert!(matches!(report.outcome("explodes"), Some(SourceOutcome::Failed(_))));
    assert_eq!(report.outcome("after"), Some(&SourceOutcome::Loaded(1)));
    assert!(!leases.is_locked("explodes").await);
}

#[tokio::test]
async fn source_leased_elsewhere_is_skipped_without_touching_the_lease() {
    let leases = Arc::new(MemoryLeaseManager::new());
    let foreign = leases
        .acquire("busy", Duration::from_secs(30))
        .await
        .unwrap();
    let busy = ScriptedSource::batches("busy", &[&[1]]);
    let free = ScriptedSource::batches("free", &[&[1]]);
    let loader = loader_with(Arc::new(MemoryEventStore::new()), leases.clone(), fast_config())
        .with_sources([busy.clone() as Arc<dyn EventSource>, free]);

    let report = loader.run_cycle().await;

    assert_eq!(report.outcome("busy"), Some(&SourceOutcome::LockDenied));
    assert_eq!(report.outcome("free"), Some(&SourceOutcome::Loaded(1)));
    assert!(busy.cursors().is_empty(), "denied source must not be fetched");
    assert!(leases.is_locked("busy").await);
    assert!(leases.release(&foreign).await);
}

#[tokio::test]
async fn idle_cycle_backs_off_before_the_next_one() {
    let config = LoaderConfig {
        idle_backoff: Duration::from_millis(150),
        ..fast_config()
    };
    let loader = loader_with(
        Arc::new(MemoryEventStore::new()),
        Arc::new(MemoryLeaseManager::new()),
        config,
    )
    .with_sources([ScriptedSource::batches("quiet", &[]) as Arc<dyn EventSource>]);

    let started = Instant::now();
    assert_eq!(loader.run(2).await, 0);
    assert!(started.elapsed() >= Duration::from_millis(150));

    // a single cycle has no next cycle to wait for
    let started = Instant::now();
    loader.run(1).await;
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[tokio::test]
async fn consecutive_requests_to_one_source_are_spaced() {
    let config = LoaderConfig {
        min_request_interval: Duration::from_millis(120),
        ..fast_config()
    };
    let source = ScriptedSource::batches("paced", &[&[1], &[2], &[3]]);
    let loader = loader_with(
        Arc::new(MemoryEventStore::new()),
        Arc::new(MemoryLeaseManager::new()),
        config,
    )
    .with_sources([source as Arc<dyn EventSource>]);

    let started = Instant::now();
    assert_eq!(loader.run(3).await, 3);
    assert!(started.elapsed() >= Duration::from_millis(230));
}

#[tokio::test]
async fn sources_added_later_join_the_next_cycle() {
    let store = Arc::new(MemoryEventStore::new());
    let loader = loader_with(store.clone(), Arc::new(MemoryLeaseManager::new()), fast_config())
        .with_sources([ScriptedSource::batches("first", &[&[1], &[2]]) as Arc<dyn EventSource>]);

    assert_eq!(loader.run(1).await, 1);
    loader
        .add_source(ScriptedSource::batches("second", &[&[100]]))
        .await;
    assert_eq!(loader.source_names().await, vec!["first", "second"]);

    let report = loader.run_cycle().await;
    assert_eq!(report.outcome("second"), Some(&SourceOutcome::Loaded(1)));
    assert_eq!(store.last_event_id("second").await.unwrap(), Some(100));
}

#[tokio::test]
async fn unbounded_run_stops_on_cancellation() {
    let loader = Arc::new(
        loader_with(
            Arc::new(MemoryEventStore::new()),
            Arc::new(MemoryLeaseManager::new()),
            fast_config(),
        )
        .with_sources([ScriptedSource::batches("feed", &[&[1, 2]]) as Arc<dyn EventSource>]),
    );
    let token = loader.cancellation_token();
    let runner = {
        let loader = loader.clone();
        tokio::spawn(async move { loader.run(0).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();
    let total = timeout(Duration::from_secs(2), runner)
        .await
        .expect("loader did not stop")
        .unwrap();
    assert_eq!(total, 2);

    let report = loader.run_cycle().await;
    assert!(report.was_cancelled());
}
