//! CloudRAID Node Daemon
//!
//! Runs the ingestion pipeline:
//! - Watches the staging directory for new, changed and removed files
//! - Splits files into two data shards plus rotating parity
//! - Distributes shard sets across the configured storage connectors
//!
//! `split` and `merge` run the codec on local files without a daemon.

use anyhow::Context;
use clap::{Parser, Subcommand};
use cloudraid_core::{merge, split, ParityPolicy};
use cloudraid_node::{CloudRaidService, NodeConfig, WatcherHealth};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloudraid")]
#[command(about = "CloudRAID ingestion daemon and shard codec")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watcher and worker pool until Ctrl+C
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "cloudraid.toml")]
        config: PathBuf,

        /// Number of workers (overrides config file)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Staging directory (overrides config file)
        #[arg(long)]
        split_input: Option<PathBuf>,
    },

    /// Split a file into three device shards
    Split {
        input: PathBuf,
        dev0: PathBuf,
        dev1: PathBuf,
        dev2: PathBuf,
    },

    /// Merge device shards back into a file; a missing shard is rebuilt
    Merge {
        output: PathBuf,
        dev0: PathBuf,
        dev1: PathBuf,
        dev2: PathBuf,

        /// Original file length, needed when a shard is missing
        #[arg(long)]
        length: Option<u64>,

        /// Fail on parity mismatches instead of warning
        #[arg(long)]
        strict: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Run {
            config,
            workers,
            split_input,
        } => run(config, workers, split_input).await,
        Command::Split {
            input,
            dev0,
            dev1,
            dev2,
        } => split_command(input, [dev0, dev1, dev2]),
        Command::Merge {
            output,
            dev0,
            dev1,
            dev2,
            length,
            strict,
        } => merge_command(output, [dev0, dev1, dev2], length, strict),
    }
}

async fn run(
    config_path: PathBuf,
    workers: Option<usize>,
    split_input: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("CloudRAID node starting...");

    // Priority: CLI args > environment > config file
    let config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?
        .with_env_overrides()
        .with_overrides(split_input, workers);

    info!("========================================");
    info!("  Staging:     {}", config.split.input_dir.display());
    info!("  Shards:      {}", config.split.output_dir.display());
    info!("  Watching:    {}", config.watch_root().display());
    info!("  Workers:     {}", config.filemanagement.count);
    info!("  Connectors:  {}", config.connectors.len());
    info!("  Policy:      {:?}", config.distribution.policy);
    if config.metrics.enabled {
        info!("  Metrics:     http://0.0.0.0:{}/metrics", config.metrics.port);
    }
    info!("========================================");
    info!("Press Ctrl+C to shut down");

    let service = CloudRaidService::start(config).await?;
    let mut health = service.health();
    let mut watching = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            changed = health.changed(), if watching => {
                if changed.is_err() {
                    // watcher gone or disabled
                    watching = false;
                    continue;
                }
                let state = health.borrow_and_update().clone();
                if let WatcherHealth::Failed(reason) = state {
                    error!(%reason, "Directory watcher failed; workers keep draining the queue");
                }
            }
        }
    }

    service.shutdown().await;
    info!("CloudRAID node stopped");
    Ok(())
}

fn split_command(input: PathBuf, devices: [PathBuf; 3]) -> anyhow::Result<()> {
    let reader = BufReader::new(
        File::open(&input).with_context(|| format!("opening {}", input.display()))?,
    );
    let create = |path: &PathBuf| -> anyhow::Result<BufWriter<File>> {
        Ok(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ))
    };
    let [d0, d1, d2] = &devices;
    let mut writers = [create(d0)?, create(d1)?, create(d2)?];

    let summary = split(reader, writers.each_mut())?;
    for writer in &mut writers {
        writer.flush()?;
    }
    info!(
        bytes = summary.input_len,
        device_lens = ?summary.device_lens,
        "Split complete"
    );
    Ok(())
}

fn merge_command(
    output: PathBuf,
    devices: [PathBuf; 3],
    length: Option<u64>,
    strict: bool,
) -> anyhow::Result<()> {
    let readers = devices.map(|path| match File::open(&path) {
        Ok(file) => Some(BufReader::new(file)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Device shard unavailable");
            None
        }
    });
    let policy = if strict {
        ParityPolicy::Reject
    } else {
        ParityPolicy::Warn
    };

    let mut writer = BufWriter::new(
        File::create(&output).with_context(|| format!("creating {}", output.display()))?,
    );
    let summary = merge(readers, &mut writer, policy, length)?;
    writer.flush()?;
    info!(
        bytes = summary.bytes_written,
        parity_mismatches = summary.parity_mismatches,
        rebuilt_device = ?summary.dead_device,
        "Merge complete"
    );
    Ok(())
}
