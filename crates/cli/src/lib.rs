use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mapstream_cache::{CacheConfig, DiskCache, MemoryPressure, StatisticsSnapshot};
use mapstream_core::{
    Footprint, HeadlessUploader, MapResources, RecordHandle, ResourceKind, ResourceState,
    SessionConfig, StandardDecoder,
};
use mapstream_scheduler::{DataThread, DataThreadConfig, FetcherConfig, HttpFetcher};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "mapstream-cli")]
#[command(about = "Headless driver for the mapstream resource cache")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stream resources through a full session and print a JSON report.
    Fetch {
        #[arg(value_name = "URL", required = true)]
        urls: Vec<String>,
        #[arg(long, value_enum, default_value_t = KindArg::Blob)]
        kind: KindArg,
        /// JSON cache configuration; environment overrides are applied first
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        no_disk_cache: bool,
        #[arg(long)]
        budget_mb: Option<usize>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Remove every entry from a disk cache.
    PurgeDisk {
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    MetaTile,
    Mesh,
    Texture,
    BoundLayerTile,
    Blob,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::MetaTile => ResourceKind::MetaTile,
            KindArg::Mesh => ResourceKind::Mesh,
            KindArg::Texture => ResourceKind::Texture,
            KindArg::BoundLayerTile => ResourceKind::BoundLayerTile,
            KindArg::Blob => ResourceKind::Blob,
        }
    }
}

#[derive(Debug, Serialize)]
struct FetchOutput {
    resources: Vec<ResourceOutput>,
    memory: MemoryOutput,
    statistics: StatisticsSnapshot,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct ResourceOutput {
    key: String,
    kind: ResourceKind,
    state: ResourceState,
    error: Option<String>,
    memory: Footprint,
}

#[derive(Debug, Serialize)]
struct MemoryOutput {
    budget: usize,
    used: usize,
    available: usize,
    pressure: MemoryPressure,
}

#[derive(Debug, Serialize)]
struct PurgeOutput {
    cache_dir: String,
    removed: usize,
}

struct FetchArgs {
    urls: Vec<String>,
    kind: ResourceKind,
    cache: CacheConfig,
    timeout: Duration,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Fetch { urls, kind, config, cache_dir, no_disk_cache, budget_mb, timeout_secs } => {
            let mut cache = load_cache_config(config.as_deref())?;
            if let Some(dir) = cache_dir {
                cache = cache.with_disk_dir(dir);
            }
            if no_disk_cache {
                cache = cache.with_disk_cache_enabled(false);
            }
            if let Some(mb) = budget_mb {
                cache = cache.with_memory_budget_mb(mb);
            }
            run_fetch(FetchArgs {
                urls,
                kind: kind.into(),
                cache,
                timeout: Duration::from_secs(timeout_secs),
            })
        }
        Commands::PurgeDisk { cache_dir } => run_purge_disk(cache_dir),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_cache_config(path: Option<&Path>) -> Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display())),
        None => CacheConfig::from_env().context("invalid cache environment"),
    }
}

fn run_fetch(args: FetchArgs) -> Result<()> {
    let started = Instant::now();
    let fetcher = HttpFetcher::new(FetcherConfig::default().with_timeout(args.timeout))
        .context("failed to start fetch workers")?;
    let data = DataThread::spawn(Arc::new(fetcher), DataThreadConfig::default())
        .context("failed to start data thread")?;

    let session = Arc::new(MapResources::new(
        SessionConfig::new(args.cache),
        Arc::new(StandardDecoder),
    ));
    data.attach(session.clone());

    let mut gpu = HeadlessUploader::new();
    let handles: Vec<RecordHandle> =
        args.urls.iter().map(|url| session.acquire(url.as_str(), args.kind)).collect();
    info!(count = handles.len(), kind = %args.kind, "resources requested");

    // Generous slack over the fetch timeout for decode and upload
    let deadline = started + args.timeout + Duration::from_secs(5);
    while !handles.iter().all(|handle| handle.state().is_settled()) {
        if Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for resources to settle");
        }
        session.render_tick(&mut gpu);
        thread::sleep(Duration::from_millis(5));
    }

    let resources = handles
        .iter()
        .map(|handle| ResourceOutput {
            key: handle.key().to_string(),
            kind: handle.kind(),
            state: handle.state(),
            error: handle.error().map(|err| err.to_string()),
            memory: handle.footprint(),
        })
        .collect();
    let manager = session.manager();
    manager.tick();
    let memory = MemoryOutput {
        budget: manager.memory_budget(),
        used: manager.total_memory_use(),
        available: manager.memory_available(),
        pressure: manager.memory_pressure(),
    };
    let statistics = manager.statistics().snapshot();

    drop(handles);
    data.shutdown();
    session.render_finalize(&mut gpu);
    debug!(destroyed = gpu.destroyed(), "session closed");

    let payload =
        FetchOutput { resources, memory, statistics, elapsed_ms: started.elapsed().as_millis() };
    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    Ok(())
}

fn run_purge_disk(cache_dir: Option<PathBuf>) -> Result<()> {
    let config = CacheConfig::from_env().context("invalid cache environment")?;
    let dir = cache_dir.unwrap_or(config.disk_cache_dir);

    if !dir.is_dir() {
        anyhow::bail!("cache directory does not exist: {}", dir.display());
    }

    let disk = DiskCache::open(&dir, config.disk_cache_size)
        .with_context(|| format!("failed to open disk cache {}", dir.display()))?;
    let removed = disk.entry_count();
    disk.purge().context("failed to purge disk cache")?;

    let payload = PurgeOutput { cache_dir: dir.display().to_string(), removed };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    Ok(())
}
