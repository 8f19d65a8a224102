//! Coordination core for polling named event sources from several loader
//! processes at once.
//!
//! The crate defines the collaborator seams (`EventSource`, `EventStore`,
//! `LeaseManager`, `ThrottleTracker`), in-memory implementations for
//! single-process use, the configuration layer, and the cycle engine that
//! composes them (`orchestrator::Loader`).

mod config;
mod error;
mod event;
pub mod lease;
pub mod orchestrator;
pub mod source;
pub mod store;
pub mod throttle;
mod util;

pub use config::{
    apply_env_overrides, config_schema_json, load_config, parse_config, write_schema_file,
    Config, LoaderSettings, SourceSettings, StoreSettings,
};
pub use error::{FetchError, LoadError, StoreError};
pub use event::{Event, StoredEvent};
pub use lease::{LeaseManager, LeaseToken, MemoryLeaseManager};
pub use orchestrator::{CycleReport, Loader, LoaderConfig, SourceOutcome};
pub use source::EventSource;
pub use store::{EventStore, MemoryEventStore};
pub use throttle::{MemoryThrottle, ThrottleTracker};
pub use util::now_millis;
