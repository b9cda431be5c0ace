use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use heapwatch::agent::Agent;
use heapwatch::config::{self, EngineConfig, load_config, load_config_from_path};
use heapwatch::engine::sim::{HomeLoop, SimEngine};
use heapwatch::format::format_bytes;
use heapwatch::logging::{self, LogFormat};
use sysinfo::System;
use tracing::info;

/// Fallback heap limit when host memory cannot be read.
const MIN_HEAP_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Parser)]
#[command(
    name = "heapwatch",
    about = "Periodically snapshot the heap of a simulated single-threaded engine"
)]
struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Snapshot timer period in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,

    /// Directory snapshots are written to
    #[arg(long)]
    destination: Option<PathBuf>,

    /// How long to keep the agent enabled, in seconds
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Log format: pretty, json
    #[arg(long)]
    log_format: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = load_config_for_cli(&cli);

    logging::init(
        LogFormat::from_str_config(&config.logging.format),
        config.logging.file.as_deref(),
    )?;

    if cli.duration_secs == 0 {
        return Err(eyre!("--duration-secs must be greater than 0"));
    }

    run(config, Duration::from_secs(cli.duration_secs)).await
}

async fn run(config: config::Config, duration: Duration) -> Result<()> {
    std::fs::create_dir_all(&config.agent.destination_dir)?;

    let heap_limit = heap_limit(&config.engine);
    info!(
        limit = heap_limit,
        "starting simulated engine with a {} heap",
        format_bytes(heap_limit)
    );
    let engine = SimEngine::new(heap_limit, config.engine.allocation_bytes);
    let mut home = HomeLoop::new(engine, config.engine.step())?;

    let agent = Agent::new(home.scheduler(), &config.agent);
    agent.enable()?;
    home.run_for(duration).await;
    agent.disable()?;

    // Let a request armed just before disable finish on the home thread.
    home.run_for(config.engine.step() * 4).await;
    let engine = home.shutdown();

    let stats = agent.stats();
    info!(
        ticks = stats.ticks,
        skipped = stats.skipped_ticks,
        failures = stats.snapshot_failures,
        user_steps = engine.user_steps(),
        "agent stopped"
    );
    println!(
        "{} snapshot(s) written to {} (mean heap {})",
        stats.snapshots_taken,
        agent.destination_dir().display(),
        format_bytes(stats.last_mean)
    );
    Ok(())
}

fn heap_limit(engine: &EngineConfig) -> u64 {
    if engine.heap_limit_bytes > 0 {
        return engine.heap_limit_bytes;
    }
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.total_memory() / 4).max(MIN_HEAP_LIMIT)
}

fn load_config_for_cli(cli: &Cli) -> config::Config {
    let mut config = match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };

    if let Some(period) = cli.period_ms {
        config.agent.period_ms = period;
    }
    if let Some(ref destination) = cli.destination {
        config.agent.destination_dir = destination.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.logging.format = format.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.logging.file = Some(file.clone());
    }

    config
}
