use serde::{Deserialize, Serialize};

/// An event as returned by a source adapter.
///
/// The payload is opaque to the coordination core; only the adapter that
/// produced it knows how to interpret the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique within `source`, strictly increasing in fetch order.
    pub id: i64,
    pub source: String,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(id: i64, source: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            source: source.into(),
            payload: payload.into(),
        }
    }

    /// Event carrying a JSON document serialised as its payload.
    pub fn json(id: i64, source: impl Into<String>, value: &serde_json::Value) -> Self {
        let payload = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        Self::new(id, source, payload)
    }
}

/// An event after it has been accepted by an [`EventStore`](crate::EventStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub source: String,
    pub payload: Vec<u8>,
    /// RFC 3339 timestamp assigned by the store.
    pub stored_at: String,
}

impl StoredEvent {
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}
