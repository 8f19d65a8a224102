use crate::{Event, FetchError};

/// A named remote feed the loader polls.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    /// Unique name; doubles as the lease resource and throttle key.
    fn name(&self) -> &str;

    /// Fetch events newer than `since`, ascending by id.
    ///
    /// Cancellation of an in-flight request is the adapter's concern (its own
    /// timeout); the loader never aborts a fetch once started.
    async fn fetch(&self, since: Option<i64>) -> Result<Vec<Event>, FetchError>;
}
