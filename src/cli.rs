//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Periodic manga metadata ingestion and download-state tracking.
///
/// Mangasync watches configured providers for new chapters of tracked
/// series, reconciles their metadata into one canonical library, and
/// downloads chapters past each series' cutoff.
#[derive(Parser, Debug)]
#[command(name = "mangasync")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Path to the JSON config file
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Override the archive output directory
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Override the scheduler tick period in milliseconds (1-60000)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=60_000))]
    pub tick_ms: Option<u64>,

    /// Override the maximum fetch attempts for transient failures (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_attempts: Option<u32>,
}
