//! GridStore node runner
//!
//! Starts a persisted grid of local nodes, streams random numbers into a
//! counter cache and prints the most popular ones on a schedule. After the
//! stream ends it forces one last query, clears the cache on every node and
//! stops the grid.

use anyhow::{Context, Result, bail};
use clap::Parser;
use gridstore_common::Config as NodeConfig;
use gridstore_common::config::Durability;
use gridstore_grid::{DEFAULT_PER_NODE_BUFFER_SIZE, Grid, IncrementingUpdater, TaskHandle};
use gridstore_storage::CacheConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gridstore-node")]
#[command(about = "GridStore grid with the popular-numbers workload")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "gridstore.toml")]
    config: String,

    /// Data directory; each node uses a subdirectory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of nodes in the grid
    #[arg(long)]
    nodes: Option<usize>,

    /// Cache receiving the counters
    #[arg(long)]
    cache: Option<String>,

    /// Numbers to stream
    #[arg(long)]
    count: Option<u64>,

    /// Numbers are drawn from [0, range)
    #[arg(long)]
    range: Option<u32>,

    /// How many popular numbers each query prints
    #[arg(long)]
    top: Option<usize>,

    /// Query period in milliseconds
    #[arg(long)]
    query_interval_ms: Option<u64>,

    /// Streamer buffer per node
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Random seed (random when unset)
    #[arg(long)]
    seed: Option<u64>,

    /// Durability mode: full or relaxed
    #[arg(long)]
    durability: Option<String>,

    /// Permit relaxed durability (test-only: skips fsync)
    #[arg(long)]
    allow_relaxed_durability: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    /// Storage settings shared by every node
    #[serde(flatten)]
    storage: NodeConfig,
    #[serde(default)]
    grid: GridSection,
    #[serde(default)]
    workload: WorkloadSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GridSection {
    nodes: usize,
}

impl Default for GridSection {
    fn default() -> Self {
        Self { nodes: 2 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WorkloadSection {
    cache: String,
    count: u64,
    range: u32,
    top: usize,
    query_interval_ms: u64,
    buffer_size: usize,
}

impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            cache: "partitioned".to_string(),
            count: 1_000_000,
            range: 1000,
            top: 10,
            query_interval_ms: 3000,
            buffer_size: DEFAULT_PER_NODE_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggingSection {
    level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Effective settings after merging file and command line
#[derive(Debug)]
struct Settings {
    storage: NodeConfig,
    nodes: usize,
    workload: WorkloadSection,
    seed: Option<u64>,
    log_level: String,
}

fn parse_durability(value: &str) -> Result<Durability> {
    match value.to_ascii_lowercase().as_str() {
        "full" => Ok(Durability::Full),
        "relaxed" => Ok(Durability::Relaxed),
        other => bail!("unknown durability mode {other:?} (expected full or relaxed)"),
    }
}

/// Merge CLI args over the config file (CLI takes precedence)
fn merge(args: Args, file: FileConfig) -> Result<Settings> {
    let mut storage = file.storage;
    if let Some(data_dir) = args.data_dir {
        storage.node.data_dir = data_dir;
    }
    if let Some(durability) = args.durability.as_deref() {
        storage.durability = parse_durability(durability)?;
    }
    if storage.durability == Durability::Relaxed && !args.allow_relaxed_durability {
        bail!("relaxed durability can lose acknowledged writes; pass --allow-relaxed-durability to use it");
    }

    let defaults = file.workload;
    let workload = WorkloadSection {
        cache: args.cache.unwrap_or(defaults.cache),
        count: args.count.unwrap_or(defaults.count),
        range: args.range.unwrap_or(defaults.range),
        top: args.top.unwrap_or(defaults.top),
        query_interval_ms: args.query_interval_ms.unwrap_or(defaults.query_interval_ms),
        buffer_size: args.buffer_size.unwrap_or(defaults.buffer_size),
    };
    if workload.range == 0 {
        bail!("range must be positive");
    }
    if workload.query_interval_ms == 0 {
        bail!("query interval must be positive");
    }

    let nodes = args.nodes.unwrap_or(file.grid.nodes);
    if nodes == 0 {
        bail!("a grid needs at least one node");
    }

    let log_level = if args.log_level == "info" {
        file.logging.level
    } else {
        args.log_level
    };

    Ok(Settings {
        storage,
        nodes,
        workload,
        seed: args.seed,
        log_level,
    })
}

/// One storage configuration per node, each in its own directory
fn node_configs(storage: &NodeConfig, nodes: usize) -> Vec<NodeConfig> {
    let base: &Path = &storage.node.data_dir;
    (0..nodes)
        .map(|i| {
            let mut config = storage.clone();
            config.node.name = format!("{}-{i}", storage.node.name);
            config.node.data_dir = base.join(format!("node-{i}"));
            config
        })
        .collect()
}

fn print_popular(numbers: &[(u32, u64)]) {
    for (number, count) in numbers {
        println!("{number}={count}");
    }
    println!("----------------");
}

/// Stream `count` random numbers as increments; stops early when
/// `interrupted` is set. Returns the number of items streamed.
fn stream_numbers(
    grid: &Grid,
    workload: &WorkloadSection,
    seed: Option<u64>,
    interrupted: &AtomicBool,
) -> gridstore_common::Result<u64> {
    let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let mut streamer = grid
        .streamer::<u32, u64>(&workload.cache)?
        .with_per_node_buffer_size(workload.buffer_size)
        .with_updater(IncrementingUpdater);

    for i in 0..workload.count {
        if i % 4096 == 0 && interrupted.load(Ordering::Relaxed) {
            warn!("Interrupted after {} numbers", i);
            break;
        }
        streamer.add(&rng.gen_range(0..workload.range), &1)?;
    }
    let added = streamer.added();
    streamer.close()?;
    Ok(added)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let file: FileConfig = if Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config))?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            FileConfig::default()
        })
    } else {
        FileConfig::default()
    };
    let config_path = args.config.clone();
    let settings = merge(args, file)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting GridStore with {} nodes", settings.nodes);
    info!("Config file: {}", config_path);
    info!("Data directory: {:?}", settings.storage.node.data_dir);

    let configs = node_configs(&settings.storage, settings.nodes);
    let grid = tokio::task::spawn_blocking(move || Grid::start(configs)).await??;
    let workload = settings.workload;
    grid.get_or_create_cache(CacheConfig::new(workload.cache.clone()))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                interrupted.store(true, Ordering::Relaxed);
            }
        });
    }

    let period = Duration::from_millis(workload.query_interval_ms);
    let query = {
        let grid = grid.clone();
        let cache = workload.cache.clone();
        let top = workload.top;
        TaskHandle::schedule("numbers-query", period, period, move || {
            match grid.top_k::<u32, u64>(&cache, top) {
                Ok(numbers) => print_popular(&numbers),
                Err(e) => error!("Popular numbers query failed: {}", e),
            }
        })?
    };

    let started = Instant::now();
    let streamed = {
        let grid = grid.clone();
        let interrupted = Arc::clone(&interrupted);
        let seed = settings.seed;
        tokio::task::spawn_blocking(move || {
            let result = stream_numbers(&grid, &workload, seed, &interrupted);
            (result, workload)
        })
        .await?
    };
    let (streamed, workload) = streamed;
    let streamed = streamed?;
    info!("Streamed {} numbers in {:?}", streamed, started.elapsed());

    // Force one more run to get final counts
    query.cancel();
    query.run_now();
    query.shutdown().await;

    // Clean up the cache on all nodes after the run
    let cache = workload.cache.clone();
    let cleared = tokio::task::spawn_blocking(move || {
        let result = grid.broadcast(|node| {
            let descriptor = node.descriptor(&cache)?;
            let size = node.engine().len(descriptor.id)?;
            info!("Clearing {} keys from cache {} on {}", size, cache, node.name());
            node.engine().clear(descriptor.id)?;
            Ok(size)
        });
        (result, grid)
    })
    .await?;
    let (cleared, grid) = cleared;
    let total: usize = cleared?.into_iter().map(|(_, size)| size).sum();
    info!("Cleared {} keys", total);

    tokio::task::spawn_blocking(move || grid.stop()).await??;
    info!("GridStore shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["gridstore-node"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [grid]
            nodes = 4

            [workload]
            count = 10
            range = 50

            [node]
            data_dir = "/var/lib/gridstore"
            "#,
        )
        .unwrap();
        let settings = merge(args(&["--count", "99", "--data-dir", "/tmp/g"]), file).unwrap();

        assert_eq!(settings.nodes, 4);
        assert_eq!(settings.workload.count, 99);
        assert_eq!(settings.workload.range, 50);
        assert_eq!(settings.workload.buffer_size, DEFAULT_PER_NODE_BUFFER_SIZE);
        assert_eq!(settings.storage.node.data_dir, PathBuf::from("/tmp/g"));
        assert_eq!(settings.storage.durability, Durability::Full);
    }

    #[test]
    fn test_relaxed_durability_needs_flag() {
        let err = merge(args(&["--durability", "relaxed"]), FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("--allow-relaxed-durability"));

        let settings = merge(
            args(&["--durability", "relaxed", "--allow-relaxed-durability"]),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(settings.storage.durability, Durability::Relaxed);

        assert!(merge(args(&["--durability", "fast"]), FileConfig::default()).is_err());
    }

    #[test]
    fn test_node_configs_use_subdirectories() {
        let mut storage = NodeConfig::with_data_dir("/data");
        storage.node.name = "grid".into();
        let configs = node_configs(&storage, 3);
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[2].node.name, "grid-2");
        assert_eq!(configs[2].node.data_dir, PathBuf::from("/data/node-2"));
    }

    #[test]
    fn test_stream_and_rank() {
        let dir = tempdir().unwrap();
        let mut storage = NodeConfig::with_data_dir(dir.path());
        storage.checkpoint.background = false;
        storage.durability = Durability::Relaxed;
        let grid = Grid::start(node_configs(&storage, 2)).unwrap();
        let workload = WorkloadSection {
            count: 20_000,
            range: 100,
            ..WorkloadSection::default()
        };
        grid.get_or_create_cache(CacheConfig::new(workload.cache.clone()))
            .unwrap();

        let streamed = stream_numbers(&grid, &workload, Some(1), &AtomicBool::new(false)).unwrap();
        assert_eq!(streamed, 20_000);

        let top = grid.top_k::<u32, u64>(&workload.cache, 100).unwrap();
        assert_eq!(top.iter().map(|(_, c)| c).sum::<u64>(), 20_000);
        assert!(top.windows(2).all(|w| w[0].1 >= w[1].1));
        grid.stop().unwrap();
    }
}
