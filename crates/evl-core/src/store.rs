use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::util::rfc3339_now;
use crate::{Event, StoreError, StoredEvent};

/// Cursor and sink for ingested events.
///
/// The cursor for a source is the highest id ever stored for it, so it can
/// only move forward and only after a batch commits.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Highest stored event id for `source`, if any.
    async fn last_event_id(&self, source: &str) -> Result<Option<i64>, StoreError>;

    /// Persist a batch atomically. `(source, id)` is unique; a collision
    /// rejects the whole batch.
    async fn store(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Most recently stored events, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError>;

    /// Number of stored events, optionally restricted to one source.
    async fn count(&self, source: Option<&str>) -> Result<u64, StoreError>;
}

/// In-process event store for single-loader runs and tests.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<Mutex<MemoryEvents>>,
}

#[derive(Default)]
struct MemoryEvents {
    by_source: HashMap<String, BTreeMap<i64, StoredEvent>>,
    // insertion order, for `recent`
    log: Vec<(String, i64)>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryEventStore {
    async fn last_event_id(&self, source: &str) -> Result<Option<i64>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .by_source
            .get(source)
            .and_then(|events| events.keys().next_back().copied()))
    }

    async fn store(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut guard = self.inner.lock().await;
        let mut seen: HashSet<(&str, i64)> = HashSet::with_capacity(events.len());
        for ev in events {
            let exists = guard
                .by_source
                .get(&ev.source)
                .is_some_and(|m| m.contains_key(&ev.id));
            if exists || !seen.insert((ev.source.as_str(), ev.id)) {
                return Err(StoreError::Rejected(format!(
                    "duplicate event {} for source {}",
                    ev.id, ev.source
                )));
            }
        }
        let stored_at = rfc3339_now();
        for ev in events {
            guard.by_source.entry(ev.source.clone()).or_default().insert(
                ev.id,
                StoredEvent {
                    id: ev.id,
                    source: ev.source.clone(),
                    payload: ev.payload.clone(),
                    stored_at: stored_at.clone(),
                },
            );
            guard.log.push((ev.source.clone(), ev.id));
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .log
            .iter()
            .rev()
            .take(limit)
            .filter_map(|(source, id)| guard.by_source.get(source)?.get(id).cloned())
            .collect())
    }

    async fn count(&self, source: Option<&str>) -> Result<u64, StoreError> {
        let guard = self.inner.lock().await;
        let n = match source {
            Some(s) => guard.by_source.get(s).map_or(0, |m| m.len()),
            None => guard.by_source.values().map(|m| m.len()).sum(),
        };
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(source: &str, ids: &[i64]) -> Vec<Event> {
        ids.iter()
            .map(|id| Event::new(*id, source, format!("{{\"n\":{id}}}")))
            .collect()
    }

    #[tokio::test]
    async fn cursor_tracks_highest_stored_id() {
        let store = MemoryEventStore::new();
        assert_eq!(store.last_event_id("a").await.unwrap(), None);

        store.store(&batch("a", &[1, 2, 3])).await.unwrap();
        assert_eq!(store.last_event_id("a").await.unwrap(), Some(3));

        // a lower id arriving late never pulls the cursor back
        store.store(&batch("a", &[0])).await.unwrap();
        assert_eq!(store.last_event_id("a").await.unwrap(), Some(3));

        store.store(&batch("a", &[7])).await.unwrap();
        assert_eq!(store.last_event_id("a").await.unwrap(), Some(7));
        assert_eq!(store.last_event_id("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_rejects_whole_batch() {
        let store = MemoryEventStore::new();
        store.store(&batch("a", &[1, 2])).await.unwrap();

        let err = store.store(&batch("a", &[3, 4, 2])).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.last_event_id("a").await.unwrap(), Some(2));
        assert_eq!(store.count(Some("a")).await.unwrap(), 2);

        let err = store.store(&batch("a", &[5, 5])).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ids_are_scoped_per_source() {
        let store = MemoryEventStore::new();
        store.store(&batch("a", &[1])).await.unwrap();
        store.store(&batch("b", &[1])).await.unwrap();
        assert_eq!(store.count(None).await.unwrap(), 2);

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].source, "b");
        assert_eq!(recent[1].source, "a");
        assert_eq!(
            recent[1].payload_json().unwrap(),
            serde_json::json!({"n": 1})
        );
    }
}
