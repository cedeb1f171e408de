//! Mirror-Harvest main entry point
//!
//! This is the command-line interface for the Mirror-Harvest feed daemon.

use clap::Parser;
use mirror_harvest::config::{load_config_with_hash, Config};
use mirror_harvest::pool::overall_status;
use mirror_harvest::{
    ContentFetcher, EventBus, InstancePool, PostFilter, Scheduler, SqliteStore,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Mirror-Harvest: a polite harvester for mirrored social timelines
///
/// Mirror-Harvest polls user and hashtag timelines from a pool of
/// rate-limited mirror instances, deduplicates the posts into SQLite,
/// and publishes lifecycle events for live consumers.
#[derive(Parser, Debug)]
#[command(name = "mirror-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A polite harvester for mirrored social timelines", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be harvested, then exit
    #[arg(long, conflicts_with_all = ["fetch_once", "health", "export", "query", "watch"])]
    dry_run: bool,

    /// Run one harvest cycle for every target, print a JSON summary, and exit
    #[arg(long, conflicts_with_all = ["dry_run", "health", "export", "query", "watch"])]
    fetch_once: bool,

    /// Print instance pool health as JSON and exit
    #[arg(long, conflicts_with_all = ["dry_run", "fetch_once", "export", "query", "watch"])]
    health: bool,

    /// Stream all stored posts as JSONL to stdout and exit
    #[arg(long, conflicts_with_all = ["dry_run", "fetch_once", "health", "query", "watch"])]
    export: bool,

    /// Print stored posts matching the filters and exit
    #[arg(long, conflicts_with_all = ["dry_run", "fetch_once", "health", "export", "watch"])]
    query: bool,

    /// Restrict --query to one target id
    #[arg(long, requires = "query")]
    target: Option<i64>,

    /// Restrict --query to posts containing this text (case-insensitive)
    #[arg(long, requires = "query")]
    contains: Option<String>,

    /// Maximum number of --query results
    #[arg(long, requires = "query")]
    limit: Option<usize>,

    /// Run the harvester and print the live event stream as JSONL
    #[arg(long, conflicts_with_all = ["dry_run", "fetch_once", "health", "export", "query"])]
    watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            cfg
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config)?;
    } else if cli.health {
        handle_health(&config).await?;
    } else if cli.export {
        handle_export(&config)?;
    } else if cli.query {
        handle_query(&config, cli.target, cli.contains, cli.limit)?;
    } else if cli.fetch_once {
        handle_fetch_once(&config).await?;
    } else {
        handle_harvest(&config, cli.watch).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("mirror_harvest=info,warn"),
            1 => EnvFilter::new("mirror_harvest=debug,info"),
            2 => EnvFilter::new("mirror_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Opens the store, seeds first-boot targets, and wires up the harvester
fn build_harvester(
    config: &Config,
) -> anyhow::Result<(Scheduler, EventBus, Arc<Mutex<SqliteStore>>)> {
    let mut store = SqliteStore::new(Path::new(&config.storage.database_path))?;
    seed_targets(&mut store, config)?;
    let store = Arc::new(Mutex::new(store));

    let pool = InstancePool::spawn(&config.pool);
    let fetcher = ContentFetcher::new(&config.fetcher)?;
    let bus = EventBus::new();
    let scheduler = Scheduler::new(
        pool,
        fetcher,
        store.clone(),
        bus.clone(),
        config.scheduler.clone(),
        config.storage.keep_last_per_target,
    );

    Ok((scheduler, bus, store))
}

/// Inserts the configured targets on first boot (empty targets table)
fn seed_targets(store: &mut SqliteStore, config: &Config) -> mirror_harvest::Result<()> {
    if !store.list_targets()?.is_empty() {
        return Ok(());
    }
    for seed in &config.targets {
        let record = store.add_target(seed.kind, &seed.value, seed.poll_interval_seconds)?;
        tracing::info!(target_label = %record.label(), "Seeded target");
    }
    Ok(())
}

/// Handles the --dry-run mode: validates config and shows the harvest plan
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    println!("=== Mirror-Harvest Dry Run ===\n");

    println!("Instance Pool ({}):", config.pool.instances.len());
    for instance in &config.pool.instances {
        println!("  - {}", instance);
    }
    println!(
        "  Max requests per minute: {}",
        config.pool.max_requests_per_minute
    );
    println!(
        "  Backoff: base {}s, max {}s",
        config.pool.backoff_base_seconds, config.pool.backoff_max_seconds
    );

    println!("\nFetcher:");
    println!("  User agent: {}", config.fetcher.user_agent);
    println!(
        "  Request timeout: {}s",
        config.fetcher.request_timeout_seconds
    );

    println!("\nScheduler:");
    println!(
        "  Cooldown: {}-{}s",
        config.scheduler.cooldown_min_seconds, config.scheduler.cooldown_max_seconds
    );
    println!(
        "  Fetch-once concurrency: {}",
        config.scheduler.fetch_once_concurrency
    );

    println!("\nStorage:");
    println!("  Database: {}", config.storage.database_path);
    match config.storage.keep_last_per_target {
        Some(keep) => println!("  Keep last per target: {}", keep),
        None => println!("  Keep last per target: unlimited"),
    }

    println!("\nSeed Targets ({}):", config.targets.len());
    for target in &config.targets {
        println!(
            "  - {}:{} every {}s",
            target.kind.to_db_string(),
            target.value,
            target.poll_interval_seconds
        );
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --health mode: prints pool health as JSON
///
/// Instance telemetry is in-memory only, so a fresh process reports
/// every configured instance as eligible with a full bucket.
async fn handle_health(config: &Config) -> anyhow::Result<()> {
    let pool = InstancePool::spawn(&config.pool);
    let instances = pool.health_snapshot().await;

    let report = serde_json::json!({
        "status": overall_status(&instances),
        "instances": instances,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Handles the --export mode: streams every stored post as JSONL
fn handle_export(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::new(Path::new(&config.storage.database_path))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let exported = store.export_jsonl(&mut out)?;

    tracing::info!("Exported {} posts", exported);
    Ok(())
}

/// Handles the --query mode: prints filtered posts as JSONL
fn handle_query(
    config: &Config,
    target: Option<i64>,
    contains: Option<String>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let store = SqliteStore::new(Path::new(&config.storage.database_path))?;
    let filter = PostFilter {
        target_id: target,
        contains,
        limit,
    };

    let posts = store.query(&filter)?;
    for post in &posts {
        println!("{}", serde_json::to_string(post)?);
    }
    tracing::info!("Matched {} posts", posts.len());
    Ok(())
}

/// Handles the --fetch-once mode: one cycle per target, then a summary
async fn handle_fetch_once(config: &Config) -> anyhow::Result<()> {
    let (scheduler, _bus, _store) = build_harvester(config)?;

    let summary = scheduler.fetch_once().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failures.is_empty() {
        tracing::info!("Fetch-once pass complete");
    } else {
        tracing::warn!(failures = summary.failures.len(), "Fetch-once pass had failures");
    }
    Ok(())
}

/// Handles the default mode: runs the harvest daemon until Ctrl-C
async fn handle_harvest(config: &Config, watch: bool) -> anyhow::Result<()> {
    let (scheduler, bus, store) = build_harvester(config)?;

    if watch {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        });
    }

    let targets = store.lock().unwrap().list_targets()?;
    if targets.is_empty() {
        tracing::warn!("No targets configured; the harvester has nothing to do");
    }
    for target in targets {
        scheduler.register_target(target)?;
    }

    tracing::info!(
        targets = scheduler.active_targets(),
        instances = config.pool.instances.len(),
        "Harvester running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.shutdown().await;

    Ok(())
}
