use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use evl_core::{Event, EventSource, FetchError, SourceSettings};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CURSOR_PARAM: &str = "lastEventId";
const ERROR_BODY_LIMIT: usize = 512;

/// Source adapter for endpoints that answer `GET` with a JSON array of
/// objects carrying an integer `id`.
pub struct HttpEventSource {
    name: String,
    url: String,
    client: reqwest::Client,
    timeout: Duration,
    auth: Option<(String, Option<String>)>,
}

impl HttpEventSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        Self::build(name.into(), url.into(), HeaderMap::new())
    }

    pub fn from_settings(settings: &SourceSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (k, v) in &settings.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .with_context(|| format!("source {}: invalid header name {k}", settings.name))?;
            let value = HeaderValue::from_str(v)
                .with_context(|| format!("source {}: invalid value for header {k}", settings.name))?;
            headers.insert(name, value);
        }
        let mut source = Self::build(settings.name.clone(), settings.url.clone(), headers)?;
        if let Some(secs) = settings.timeout_secs {
            source.timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = settings.auth.as_deref() {
            source = source.with_basic_auth(raw);
        }
        Ok(source)
    }

    fn build(name: String, url: String, headers: HeaderMap) -> Result<Self> {
        if name.is_empty() {
            return Err(anyhow!("source name must not be empty"));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("evl-loader/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .context("build http client")?;
        Ok(Self {
            name,
            url,
            client,
            timeout: DEFAULT_TIMEOUT,
            auth: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Basic auth given as `user:password` (the password part is optional).
    pub fn with_basic_auth(mut self, raw: &str) -> Self {
        self.auth = Some(match raw.split_once(':') {
            Some((user, pass)) => (user.to_string(), Some(pass.to_string())),
            None => (raw.to_string(), None),
        });
        self
    }

    fn transport_error(err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Pull the event id out of one array element; integer or integer string.
fn element_id(item: &JsonValue) -> Option<i64> {
    match item.get("id")? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turn a decoded response body into the ordered, de-duplicated batch of
/// events newer than `since`.
fn events_from_body(
    source: &str,
    body: JsonValue,
    since: Option<i64>,
) -> Result<Vec<Event>, FetchError> {
    let JsonValue::Array(items) = body else {
        return Err(FetchError::Malformed("expected a JSON array".into()));
    };
    let mut events: Vec<Event> = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = element_id(&item) else {
            warn!(target: "evl::source", source, "skipping element without an integer id");
            continue;
        };
        if since.is_some_and(|cursor| id <= cursor) {
            continue;
        }
        events.push(Event::json(id, source, &item));
    }
    events.sort_by_key(|e| e.id);
    events.dedup_by_key(|e| e.id);
    Ok(events)
}

#[async_trait::async_trait]
impl EventSource for HttpEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, since: Option<i64>) -> Result<Vec<Event>, FetchError> {
        let mut req = self.client.get(&self.url).timeout(self.timeout);
        if let Some(cursor) = since {
            req = req.query(&[(CURSOR_PARAM, cursor)]);
        }
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, pass.as_ref());
        }
        let resp = req.send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await.map_err(Self::transport_error)?;
        let body: JsonValue =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))?;
        let events = events_from_body(&self.name, body, since)?;
        debug!(
            target: "evl::source",
            source = %self.name,
            since,
            count = events.len(),
            "fetched events"
        );
        Ok(events)
    }
}
