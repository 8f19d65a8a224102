use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::util::now_millis;

pub const DEFAULT_MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(200);

/// Per-source record of the last outbound request, used to pace requests.
#[async_trait::async_trait]
pub trait ThrottleTracker: Send + Sync {
    /// Remember `at_ms` as the most recent request to `source`.
    async fn record_request(&self, source: &str, at_ms: u64);

    async fn last_request_time(&self, source: &str) -> Option<u64>;

    /// Suspend the calling task until `min_interval` has passed since the last
    /// recorded request to `source`. Returns at once when no request is on
    /// record or the interval already elapsed.
    async fn wait_for_minimum_interval(&self, source: &str, min_interval: Duration) {
        let Some(last) = self.last_request_time(source).await else {
            return;
        };
        let remaining = remaining_interval(last, now_millis(), min_interval);
        if !remaining.is_zero() {
            tracing::debug!(
                target: "evl::throttle",
                source,
                wait_ms = remaining.as_millis() as u64,
                "throttling request"
            );
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Time still to wait when the last request happened at `last_ms` and it is
/// now `now_ms`. A timestamp in the future counts as "just now".
pub fn remaining_interval(last_ms: u64, now_ms: u64, min_interval: Duration) -> Duration {
    let elapsed = now_ms.saturating_sub(last_ms);
    let min_ms = min_interval.as_millis() as u64;
    Duration::from_millis(min_ms.saturating_sub(elapsed))
}

/// Request timestamps held in process memory.
#[derive(Clone, Default)]
pub struct MemoryThrottle {
    last: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryThrottle {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ThrottleTracker for MemoryThrottle {
    async fn record_request(&self, source: &str, at_ms: u64) {
        self.last.lock().await.insert(source.to_string(), at_ms);
    }

    async fn last_request_time(&self, source: &str) -> Option<u64> {
        self.last.lock().await.get(source).copied()
    }
}
