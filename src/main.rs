//! Daemon entry point for the mangasync tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use mangasync_core::{
    Config, FetchClient, HttpTransport, JobContext, JobGraph, MemoryStore, ProviderRegistry,
    Reconciler, RetryPolicy, Scheduler,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Mangasync starting");

    // Load config file when given, apply CLI overrides.
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_interval_ms = tick_ms;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_fetch_attempts = max_attempts;
    }
    config.validate()?;

    // Shared plumbing: one rate limiter for the whole process.
    let rate_limiter = Arc::new(config.build_rate_limiter());
    let fetch = Arc::new(FetchClient::new(
        Arc::new(HttpTransport::new()),
        rate_limiter,
        RetryPolicy::with_max_attempts(config.max_fetch_attempts),
    ));
    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&store) as _));

    // Provider implementations register here; the core ships none.
    let providers = Arc::new(ProviderRegistry::new());
    if providers.is_empty() {
        warn!("no providers registered; the scheduler will idle");
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let ctx = JobContext {
        providers,
        fetch,
        reconciler,
        store,
        cancel: Arc::clone(&cancel),
    };

    let scheduler = Scheduler::new(JobGraph::new(), ctx, config.tick_interval());

    // Ctrl-C flips the shared cancellation flag; workers observe it too.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    scheduler.run().await;
    info!("Mangasync stopped");
    Ok(())
}
