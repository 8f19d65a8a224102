mod loader;
mod types;

pub use loader::Loader;
pub use types::{
    CycleReport, LoaderConfig, SourceOutcome, DEFAULT_IDLE_BACKOFF, DEFAULT_MAX_EVENTS_PER_REQUEST,
};
