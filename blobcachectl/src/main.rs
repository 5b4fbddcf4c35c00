use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blobcache_core::{
    AssetCache, ByteSize, CacheConfig, CacheMonitor, HostMemoryProvider, MemoryPressureProvider,
    NoPressureSignal, ProcessMemoryProvider, Variant,
};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::{Builder, Target};
use log::LevelFilter;
use regex::Regex;

#[derive(Parser)]
#[command(
    name = "blobcachectl",
    version,
    about = "Drive the blobcache asset cache against a real origin"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Env file loaded before BLOBCACHE_* overrides are applied
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    /// Memory signal that drives adaptive capacity
    #[arg(long, global = true, value_enum, default_value_t = MemorySignal::Process)]
    memory: MemorySignal,
    /// Budget the process signal is measured against, in MiB
    #[arg(long, global = true, default_value_t = 512)]
    memory_budget_mib: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch assets and print cache stats as JSON
    Fetch {
        /// Asset ids to fetch
        #[arg(required = true)]
        keys: Vec<String>,
        /// Variant to request (defaults to the configured variant)
        #[arg(long)]
        variant: Option<String>,
        /// Fetch the whole key list this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Preload assets, run the pressure monitor, then print the analysis
    Monitor {
        /// Asset ids to preload
        keys: Vec<String>,
        #[arg(long)]
        variant: Option<String>,
        /// How long to keep the monitor running (e.g. "90s", "2m")
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,
        /// Sweep interval; defaults to the configured interval
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
        /// Remove keys matching this regex before reporting
        #[arg(long)]
        remove_pattern: Option<Regex>,
        /// Remove entries idle longer than this before reporting
        #[arg(long, value_parser = humantime::parse_duration)]
        remove_idle: Option<Duration>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MemorySignal {
    /// This process's resident memory against --memory-budget-mib
    Process,
    /// Whole-host RAM usage
    Host,
    /// Fixed capacity limits
    None,
}

impl MemorySignal {
    fn provider(self, budget_mib: u64) -> Arc<dyn MemoryPressureProvider> {
        match self {
            MemorySignal::Process => Arc::new(ProcessMemoryProvider::new(ByteSize::from_bytes(
                budget_mib.saturating_mul(1024 * 1024),
            ))),
            MemorySignal::Host => Arc::new(HostMemoryProvider::new()),
            MemorySignal::None => Arc::new(NoPressureSignal),
        }
    }
}

fn init_logger() {
    Builder::new()
        .target(Target::Stderr)
        .filter_level(LevelFilter::Warn)
        .filter_module("blobcache_core", LevelFilter::Info)
        .filter_module("blobcachectl", LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    if std::env::var("RUST_LOG").is_err() {
        init_logger();
    } else {
        env_logger::init();
    }

    let cli = Cli::parse();
    let config = CacheConfig::load(cli.config.as_deref(), cli.env_file.as_deref())
        .context("failed to load configuration")?;
    let pressure = cli.memory.provider(cli.memory_budget_mib);

    match cli.command {
        Command::Fetch {
            keys,
            variant,
            repeat,
        } => fetch(&config, pressure, &keys, variant, repeat).await,
        Command::Monitor {
            keys,
            variant,
            duration,
            interval,
            remove_pattern,
            remove_idle,
        } => {
            let cache = AssetCache::from_config(&config, pressure)?;
            let variant = resolve_variant(&config, variant);
            let monitor = CacheMonitor::new(cache.clone(), config.monitor.clone());

            let report = cache.preload(keys.as_slice(), &variant).await;
            log::info!(
                "Preloaded {} of {} assets ({} failed)",
                report.loaded,
                report.requested,
                report.failed
            );

            monitor.start_monitoring(interval.unwrap_or_else(|| config.monitor.interval()));
            tokio::time::sleep(duration).await;
            monitor.stop_monitoring();

            if let Some(pattern) = remove_pattern {
                monitor.remove_by_pattern(&pattern);
            }
            if let Some(max_idle) = remove_idle {
                monitor.remove_older_than(max_idle);
            }

            println!("{}", serde_json::to_string_pretty(&monitor.analysis())?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_variant(config: &CacheConfig, variant: Option<String>) -> Variant {
    variant
        .map(Variant::new)
        .unwrap_or_else(|| config.default_variant())
}

async fn fetch(
    config: &CacheConfig,
    pressure: Arc<dyn MemoryPressureProvider>,
    keys: &[String],
    variant: Option<String>,
    repeat: u32,
) -> Result<ExitCode> {
    let cache = AssetCache::from_config(config, pressure)?;
    let variant = resolve_variant(config, variant);

    let mut failures = 0usize;
    for round in 0..repeat.max(1) {
        for key in keys {
            match cache.fetch_or_load(key, &variant).await {
                Ok(handle) => log::info!("[{}] {} -> {}", round + 1, key, handle.size()),
                Err(err) => {
                    failures += 1;
                    eprintln!("{key}: {err}");
                }
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
