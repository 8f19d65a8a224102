use std::time::Duration;

use serde::Serialize;

use crate::lease::DEFAULT_LEASE_TTL;
use crate::throttle::DEFAULT_MIN_REQUEST_INTERVAL;
use crate::LoaderSettings;

pub const DEFAULT_MAX_EVENTS_PER_REQUEST: usize = 1000;
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime knobs of the cycle engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Minimum spacing between requests to one source (default 200 ms).
    pub min_request_interval: Duration,
    /// Per-source batch cap per cycle (default 1000).
    pub max_events_per_request: usize,
    /// Lease TTL; keep it well above the slowest expected fetch+store
    /// (default 30 s).
    pub lease_ttl: Duration,
    /// Pause after a cycle that loaded nothing (default 100 ms).
    pub idle_backoff: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            min_request_interval: DEFAULT_MIN_REQUEST_INTERVAL,
            max_events_per_request: DEFAULT_MAX_EVENTS_PER_REQUEST,
            lease_ttl: DEFAULT_LEASE_TTL,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }
}

impl LoaderConfig {
    pub fn from_settings(settings: &LoaderSettings) -> Self {
        let defaults = Self::default();
        Self {
            min_request_interval: settings
                .min_request_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_request_interval),
            max_events_per_request: settings
                .max_events_per_request
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_events_per_request),
            lease_ttl: settings
                .lease_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_ttl),
            idle_backoff: settings
                .idle_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_backoff),
        }
    }
}

/// What happened to one source during one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Batch stored; carries the number of events.
    Loaded(usize),
    /// Source had nothing newer than the cursor.
    Empty,
    /// Another holder owns the lease; skipped this cycle.
    LockDenied,
    /// Fetch or store failed; the lease was still released.
    Failed(String),
    /// Cancellation arrived before the source was polled.
    Cancelled,
}

impl SourceOutcome {
    pub fn loaded(&self) -> usize {
        match self {
            SourceOutcome::Loaded(n) => *n,
            _ => 0,
        }
    }
}

/// Summary of one pass over all sources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub loaded: usize,
    pub outcomes: Vec<(String, SourceOutcome)>,
}

impl CycleReport {
    pub fn push(&mut self, source: &str, outcome: SourceOutcome) {
        self.loaded += outcome.loaded();
        self.outcomes.push((source.to_string(), outcome));
    }

    pub fn outcome(&self, source: &str) -> Option<&SourceOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == source)
            .map(|(_, o)| o)
    }

    pub fn was_cancelled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, o)| matches!(o, SourceOutcome::Cancelled))
    }
}
