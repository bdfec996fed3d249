//! txtrack CLI
//!
//! Command-line tools for replaying and checking index tracking.
//!
//! # Commands
//!
//! - `replay` - Replay a repository snapshot into an in-memory index
//! - `check-index` - Compare repository transactions with index markers
//! - `check-node` - Look a node up in a snapshot
//! - `cursor` - Show the cursor saved in a state directory
//! - `watch` - Run scheduled cycles over a snapshot

mod commands;
mod snapshot;

use clap::{Parser, Subcommand};
use commands::ReplayOptions;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use txtrack_engine::CheckIndexBounds;

/// txtrack index tracking tools.
#[derive(Parser)]
#[command(name = "txtrack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a repository snapshot (JSON)
    #[arg(global = true, short, long)]
    snapshot: Option<PathBuf>,

    /// Directory holding the durable cursor
    #[arg(global = true, long)]
    state: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a repository snapshot into an in-memory index
    Replay {
        /// Number of cycles to run
        #[arg(short, long, default_value = "1")]
        cycles: usize,

        /// Change count that triggers a flush
        #[arg(long)]
        batch_threshold: Option<u64>,

        /// Worker threads for node batches
        #[arg(short, long)]
        workers: Option<usize>,

        /// Track only a DB id range shard, as START-END
        #[arg(long, value_parser = parse_range)]
        shard_range: Option<(u64, u64)>,
    },

    /// Compare repository transactions with index markers
    CheckIndex {
        /// Cycles to replay before checking
        #[arg(short, long, default_value = "1")]
        cycles: usize,

        /// Stop after this transaction id
        #[arg(long)]
        to_tx: Option<u64>,

        /// Start at this commit time (ms)
        #[arg(long)]
        from_time: Option<u64>,

        /// Stop after this commit time (ms)
        #[arg(long)]
        to_time: Option<u64>,
    },

    /// Look a node up in the snapshot
    CheckNode {
        /// Node id
        node_id: u64,
    },

    /// Show the cursor saved in the state directory
    Cursor,

    /// Run scheduled cycles over the snapshot
    Watch {
        /// Milliseconds between cycles
        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many milliseconds
        #[arg(short, long)]
        duration_ms: Option<u64>,
    },

    /// Show version information
    Version,
}

fn parse_range(value: &str) -> Result<(u64, u64), String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {value:?}"))?;
    let start = start.trim().parse::<u64>().map_err(|e| e.to_string())?;
    let end = end.trim().parse::<u64>().map_err(|e| e.to_string())?;
    if start >= end {
        return Err(format!("range {start}-{end} is empty"));
    }
    Ok((start, end))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = ReplayOptions {
        state_dir: cli.state.clone(),
        ..ReplayOptions::default()
    };

    match cli.command {
        Commands::Replay {
            cycles,
            batch_threshold,
            workers,
            shard_range,
        } => {
            let snapshot = cli.snapshot.ok_or("Snapshot path required for replay")?;
            let options = ReplayOptions {
                batch_threshold,
                workers,
                shard_range,
                ..options
            };
            commands::replay::run(&snapshot, &options, cycles, &cli.format)?;
        }
        Commands::CheckIndex {
            cycles,
            to_tx,
            from_time,
            to_time,
        } => {
            let snapshot = cli.snapshot.ok_or("Snapshot path required for check-index")?;
            let bounds = CheckIndexBounds {
                to_tx,
                from_time,
                to_time,
            };
            commands::check_index::run(&snapshot, &options, cycles, bounds, &cli.format)?;
        }
        Commands::CheckNode { node_id } => {
            let snapshot = cli.snapshot.ok_or("Snapshot path required for check-node")?;
            commands::check_node::run(&snapshot, node_id, &cli.format)?;
        }
        Commands::Cursor => {
            let state = cli.state.ok_or("State directory required for cursor")?;
            commands::cursor::run(&state, &cli.format)?;
        }
        Commands::Watch {
            interval_ms,
            duration_ms,
        } => {
            let snapshot = cli.snapshot.ok_or("Snapshot path required for watch")?;
            commands::watch::run(
                &snapshot,
                &options,
                Duration::from_millis(interval_ms.max(1)),
                duration_ms.map(Duration::from_millis),
            )?;
        }
        Commands::Version => {
            println!("txtrack CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
