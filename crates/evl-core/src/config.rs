use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pacing and batching knobs for the cycle engine. Unset fields take the
/// defaults documented on [`LoaderConfig`](crate::LoaderConfig).
#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoaderSettings {
    /// Minimum spacing between two requests to the same source (ms).
    #[serde(default)]
    pub min_request_interval_ms: Option<u64>,
    /// Upper bound on events stored per source per cycle.
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub max_events_per_request: Option<usize>,
    /// Lease time-to-live (seconds).
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub lease_ttl_secs: Option<u64>,
    /// Pause after a cycle that loaded nothing (ms).
    #[serde(default)]
    pub idle_backoff_ms: Option<u64>,
    /// Number of cycles to run; 0 runs until cancelled.
    #[serde(default)]
    pub cycles: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    /// Directory holding the shared SQLite database.
    #[serde(default)]
    pub dir: Option<String>,
    /// SQLite busy timeout (ms).
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SourceSettings {
    /// Unique source name; also the lease and throttle key.
    #[schemars(length(min = 1))]
    pub name: String,
    /// Endpoint returning a JSON array of events.
    #[schemars(length(min = 1))]
    pub url: String,
    /// Request timeout (seconds).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Basic auth credentials as `user:password`.
    #[serde(default)]
    pub auth: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub loader: LoaderSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub sources: Vec<SourceSettings>,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration file.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &str) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Parse and validate a TOML configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    let mut names = HashSet::new();
    for source in &cfg.sources {
        if !names.insert(source.name.as_str()) {
            return Err(anyhow!("duplicate source name: {}", source.name));
        }
    }
    Ok(cfg)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path))
}

/// Overlay `EVL_*` environment variables onto `cfg`.
pub fn apply_env_overrides(cfg: &mut Config) -> Result<()> {
    apply_overrides_from(cfg, |key| std::env::var(key).ok())
}

fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match lookup(key) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("{}={:?}: {}", key, raw, e)),
            _ => Ok(None),
        }
    }

    if let Some(v) = parsed(&lookup, "EVL_MIN_REQUEST_INTERVAL_MS")? {
        cfg.loader.min_request_interval_ms = Some(v);
    }
    if let Some(v) = parsed::<usize>(&lookup, "EVL_MAX_EVENTS_PER_REQUEST")? {
        if v == 0 {
            return Err(anyhow!("EVL_MAX_EVENTS_PER_REQUEST must be at least 1"));
        }
        cfg.loader.max_events_per_request = Some(v);
    }
    if let Some(v) = parsed(&lookup, "EVL_LEASE_TTL_SECS")? {
        cfg.loader.lease_ttl_secs = Some(v);
    }
    if let Some(v) = parsed(&lookup, "EVL_IDLE_BACKOFF_MS")? {
        cfg.loader.idle_backoff_ms = Some(v);
    }
    if let Some(dir) = lookup("EVL_STATE_DIR").filter(|s| !s.trim().is_empty()) {
        cfg.store.dir = Some(dir);
    }
    if let Some(v) = parsed(&lookup, "EVL_SQLITE_BUSY_MS")? {
        cfg.store.busy_timeout_ms = Some(v);
    }
    Ok(())
}
