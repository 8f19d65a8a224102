use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the global subscriber: console output filtered by `RUST_LOG`
/// (default `info`), plus a rolling log file when `EVL_LOG_ROLL=1`.
///
/// Calling it more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    if std::env::var("EVL_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("EVL_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let prefix = std::env::var("EVL_LOG_PREFIX").unwrap_or_else(|_| "evl-loader".into());
        let rotation = std::env::var("EVL_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
        if std::fs::create_dir_all(&dir).is_err() {
            eprintln!("evl-otel: failed to create log directory {dir}");
        }
        let writer = rolling_writer(&rotation, &dir, &prefix);
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        // the file gets everything from our own targets regardless of RUST_LOG
        let file_filter = EnvFilter::new("info,evl=debug");
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(file_filter);
        let _ = registry.with(file_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}

fn rolling_writer(
    rotation: &str,
    dir: &str,
    prefix: &str,
) -> tracing_appender::rolling::RollingFileAppender {
    match rotation.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::hourly(dir, prefix),
        "minutely" => tracing_appender::rolling::minutely(dir, prefix),
        "never" => tracing_appender::rolling::never(dir, prefix),
        _ => tracing_appender::rolling::daily(dir, prefix),
    }
}
