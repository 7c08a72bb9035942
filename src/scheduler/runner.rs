//! The scheduling loop: ticks the graph and executes eligible workers.
//!
//! One loop ticks on a fixed period; every eligible worker's body runs on
//! its own tokio task so a slow provider never blocks scheduling of
//! unrelated workers. Job errors and panics are caught and recorded as a
//! failed run — nothing a job does can crash the loop.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::graph::JobGraph;
use super::worker::{JobContext, WorkerKey};

/// Default tick period: fast enough that due workers start promptly, slow
/// enough to stay invisible in profiles.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Drives a [`JobGraph`].
#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<Mutex<JobGraph>>,
    ctx: Arc<JobContext>,
    tick_interval: Duration,
}

impl Scheduler {
    /// Creates a scheduler over a graph and injected job context.
    #[must_use]
    pub fn new(graph: JobGraph, ctx: JobContext, tick_interval: Duration) -> Self {
        Self {
            graph: Arc::new(Mutex::new(graph)),
            ctx: Arc::new(ctx),
            tick_interval,
        }
    }

    /// Returns the shared graph, for registration and inspection.
    #[must_use]
    pub fn graph(&self) -> Arc<Mutex<JobGraph>> {
        Arc::clone(&self.graph)
    }

    /// Returns the injected job context.
    #[must_use]
    pub fn context(&self) -> Arc<JobContext> {
        Arc::clone(&self.ctx)
    }

    /// Runs the scheduling loop until the context's cancellation flag is
    /// set.
    ///
    /// Worker tasks started by a tick are left running when the loop exits;
    /// they observe the same cancellation flag through their context.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(tick_ms = self.tick_interval.as_millis(), "scheduler starting");
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            if self.ctx.cancel.load(Ordering::SeqCst) {
                info!("scheduler stopping on cancellation");
                return;
            }
            self.tick_once();
        }
    }

    /// Performs one tick: selects eligible workers and spawns their bodies.
    ///
    /// Returns the spawned task handles so callers (tests, drain logic) can
    /// await completion; the run loop just drops them.
    pub fn tick_once(&self) -> Vec<JoinHandle<()>> {
        let now = Instant::now();
        let eligible = lock(&self.graph).tick(now);

        eligible
            .into_iter()
            .filter_map(|key| {
                let Some(job) = lock(&self.graph).job(&key) else {
                    // Removed between selection and spawn; nothing to run.
                    return None;
                };
                Some(self.spawn_worker(key, job))
            })
            .collect()
    }

    fn spawn_worker(
        &self,
        key: WorkerKey,
        job: Arc<dyn super::worker::Job>,
    ) -> JoinHandle<()> {
        let graph = Arc::clone(&self.graph);
        let ctx = Arc::clone(&self.ctx);

        tokio::spawn(async move {
            if let Err(e) = lock(&graph).mark_running(&key) {
                warn!(key = %key, error = %e, "worker vanished before start");
                return;
            }
            debug!(key = %key, "worker starting");

            // A panicking job must not take the scheduler down with it.
            let outcome = std::panic::AssertUnwindSafe(job.execute(&ctx))
                .catch_unwind()
                .await;
            let success = match outcome {
                Ok(Ok(())) => {
                    debug!(key = %key, "worker completed");
                    true
                }
                Ok(Err(job_error)) => {
                    warn!(key = %key, error = %job_error, "worker failed");
                    false
                }
                Err(_panic) => {
                    error!(key = %key, "worker panicked");
                    false
                }
            };

            if let Err(e) = lock(&graph).report_result(&key, success, Instant::now()) {
                warn!(key = %key, error = %e, "failed to record worker result");
            }
        })
    }
}

/// Locks the graph, recovering from a poisoned lock (a panicking worker
/// body never holds it across the panic, so the data is intact).
fn lock(graph: &Arc<Mutex<JobGraph>>) -> std::sync::MutexGuard<'_, JobGraph> {
    graph.lock().unwrap_or_else(PoisonError::into_inner)
}
