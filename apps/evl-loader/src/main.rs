use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use evl_core::{
    apply_env_overrides, load_config, write_schema_file, Config, EventSource, EventStore,
    LeaseManager, Loader, LoaderConfig, MemoryEventStore, MemoryLeaseManager, MemoryThrottle,
    ThrottleTracker,
};
use evl_kernel::{Kernel, KernelOptions, SqliteEventStore, SqliteLeaseManager, SqliteThrottle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod http_source;

use http_source::HttpEventSource;

const DEFAULT_CONFIG: &str = "evl.toml";
const DEFAULT_STATE_DIR: &str = "state";

type DynLoader = Loader<dyn EventStore, dyn LeaseManager, dyn ThrottleTracker>;

#[derive(Parser)]
#[command(name = "evl-loader", version, about = "Poll event sources into a shared store")]
struct Cli {
    /// Configuration file (default: ./evl.toml when present)
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load cycles
    Run(RunArgs),
    /// Lock status and cursor of every configured source
    Status,
    /// List live leases
    Leases(LeasesArgs),
    /// Show recently stored events
    Events(EventsArgs),
    /// Force-release a lease held by any process
    Release(ReleaseArgs),
    /// Write the configuration JSON schema
    Schema(SchemaArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Number of cycles (0 = until Ctrl-C); overrides [loader].cycles
    #[arg(long)]
    cycles: Option<u32>,
    /// Keep leases, request times and events in memory (single process only)
    #[arg(long)]
    memory: bool,
}

#[derive(Args)]
struct LeasesArgs {
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct EventsArgs {
    /// Number of events to show
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Only show events of this source
    #[arg(long)]
    source: Option<String>,
}

#[derive(Args)]
struct ReleaseArgs {
    /// Source name the lease is held on
    #[arg(long)]
    resource: String,
}

#[derive(Args)]
struct SchemaArgs {
    /// Output path
    #[arg(long, default_value = "evl.schema.json")]
    out: String,
}

#[tokio::main]
async fn main() {
    evl_otel::init();

    let cli = Cli::parse();
    let result = match settings(cli.config.as_deref()) {
        Ok(cfg) => match cli.command {
            Commands::Run(args) => cmd_run(&cfg, &args).await,
            Commands::Status => cmd_status(&cfg).await,
            Commands::Leases(args) => cmd_leases(&cfg, &args).await,
            Commands::Events(args) => cmd_events(&cfg, &args).await,
            Commands::Release(args) => cmd_release(&cfg, &args).await,
            Commands::Schema(args) => write_schema_file(&args.out)
                .with_context(|| format!("writing {}", args.out))
                .map(|_| println!("wrote {}", args.out)),
        },
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn settings(path: Option<&str>) -> Result<Config> {
    let mut cfg = match path {
        Some(p) => load_config(p)?,
        None if Path::new(DEFAULT_CONFIG).exists() => load_config(DEFAULT_CONFIG)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut cfg)?;
    Ok(cfg)
}

fn open_kernel(cfg: &Config) -> Result<Kernel> {
    let dir = cfg.store.dir.as_deref().unwrap_or(DEFAULT_STATE_DIR);
    Kernel::open_with(Path::new(dir), &KernelOptions::from_settings(&cfg.store))
        .with_context(|| format!("opening state database in {dir}"))
}

fn http_sources(cfg: &Config) -> Result<Vec<Arc<dyn EventSource>>> {
    cfg.sources
        .iter()
        .map(|s| {
            HttpEventSource::from_settings(s).map(|src| Arc::new(src) as Arc<dyn EventSource>)
        })
        .collect()
}

fn build_loader(cfg: &Config, memory: bool) -> Result<DynLoader> {
    let sources = http_sources(cfg)?;
    if sources.is_empty() {
        bail!("no sources configured");
    }
    let (store, leases, throttle): (
        Arc<dyn EventStore>,
        Arc<dyn LeaseManager>,
        Arc<dyn ThrottleTracker>,
    ) = if memory {
        (
            Arc::new(MemoryEventStore::new()),
            Arc::new(MemoryLeaseManager::new()),
            Arc::new(MemoryThrottle::new()),
        )
    } else {
        let kernel = open_kernel(cfg)?;
        (
            Arc::new(SqliteEventStore::new(kernel.clone())),
            Arc::new(SqliteLeaseManager::new(kernel.clone())),
            Arc::new(SqliteThrottle::new(kernel)),
        )
    };
    let config = LoaderConfig::from_settings(&cfg.loader);
    Ok(Loader::new(store, leases, throttle, config).with_sources(sources))
}

async fn cmd_run(cfg: &Config, args: &RunArgs) -> Result<()> {
    let token = CancellationToken::new();
    let loader = build_loader(cfg, args.memory)?.with_cancellation(token.clone());
    let cycles = args.cycles.or(cfg.loader.cycles).unwrap_or(0);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(target: "evl::loader", "interrupt received; finishing current source");
                token.cancel();
            }
            Err(err) => warn!(target: "evl::loader", error = %err, "cannot listen for Ctrl-C"),
        }
    });

    let names = loader.source_names().await;
    info!(
        target: "evl::loader",
        sources = ?names,
        cycles,
        memory = args.memory,
        "loader starting"
    );
    let total = loader.run(cycles).await;
    println!("loaded {total} events");
    Ok(())
}

async fn cmd_status(cfg: &Config) -> Result<()> {
    let kernel = open_kernel(cfg)?;
    let store = SqliteEventStore::new(kernel.clone());
    let leases = SqliteLeaseManager::new(kernel);
    if cfg.sources.is_empty() {
        println!("no sources configured");
        return Ok(());
    }
    for source in &cfg.sources {
        let name = source.name.as_str();
        let lock = match leases.remaining(name).await {
            Some(left) => format!("locked ({}s left)", left.as_secs()),
            None if leases.is_locked(name).await => "locked".to_string(),
            None => "free".to_string(),
        };
        let cursor = store
            .last_event_id(name)
            .await?
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into());
        let count = store.count(Some(name)).await?;
        println!("{name:<24} {lock:<20} cursor={cursor:<12} events={count}");
    }
    Ok(())
}

async fn cmd_leases(cfg: &Config, args: &LeasesArgs) -> Result<()> {
    let leases = SqliteLeaseManager::new(open_kernel(cfg)?);
    let live = leases.live_leases().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&live)?);
        return Ok(());
    }
    if live.is_empty() {
        println!("no live leases");
    }
    let now = evl_core::now_millis();
    for lease in &live {
        println!(
            "{:<24} token={} expires_in={}ms",
            lease.resource,
            lease.token,
            lease.expires_at_ms.saturating_sub(now)
        );
    }
    Ok(())
}

async fn cmd_events(cfg: &Config, args: &EventsArgs) -> Result<()> {
    let store = SqliteEventStore::new(open_kernel(cfg)?);
    let fetch = match args.source {
        // over-fetch so a source filter still fills the page
        Some(_) => args.limit.saturating_mul(10),
        None => args.limit,
    };
    let recent = store.recent(fetch).await?;
    for event in recent
        .iter()
        .filter(|e| args.source.as_deref().is_none_or(|s| e.source == s))
        .take(args.limit)
    {
        let payload = event
            .payload_json()
            .map(|v| v.to_string())
            .unwrap_or_else(|| format!("<{} bytes>", event.payload.len()));
        println!("{} {}#{} {}", event.stored_at, event.source, event.id, payload);
    }
    match args.source.as_deref() {
        Some(name) => println!("{name}: {} events", store.count(Some(name)).await?),
        None => {
            for source in &cfg.sources {
                println!("{}: {} events", source.name, store.count(Some(&source.name)).await?);
            }
            println!("total: {} events", store.count(None).await?);
        }
    }
    Ok(())
}

async fn cmd_release(cfg: &Config, args: &ReleaseArgs) -> Result<()> {
    let leases = SqliteLeaseManager::new(open_kernel(cfg)?);
    if leases.force_release(&args.resource).await {
        println!("released {}", args.resource);
    } else {
        println!("no lease held on {}", args.resource);
    }
    Ok(())
}
