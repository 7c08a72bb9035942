//! Dependency-ordered job scheduling.
//!
//! # Architecture
//!
//! - [`WorkerSpec`] / [`Job`] - what runs: a keyed execution body with
//!   dependencies and a one-shot or periodic schedule
//! - [`JobGraph`] - pure scheduling decisions: registration (with duplicate
//!   and cycle validation), eligibility scans, run-state bookkeeping
//! - [`Scheduler`] - the loop: ticks the graph, spawns eligible worker
//!   bodies on their own tasks, records outcomes
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mangasync_core::scheduler::{JobGraph, Scheduler, WorkerSpec, DEFAULT_TICK_INTERVAL};
//! # use std::sync::Arc;
//! # use mangasync_core::scheduler::{Job, JobContext, JobError};
//! # struct RefreshJob;
//! # #[async_trait::async_trait]
//! # impl Job for RefreshJob {
//! #     async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> { Ok(()) }
//! # }
//! # fn context() -> JobContext { unimplemented!() }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = JobGraph::new();
//! graph.register(WorkerSpec::periodic(
//!     "refresh-library",
//!     Duration::from_secs(3600),
//!     Arc::new(RefreshJob),
//! ))?;
//! let scheduler = Scheduler::new(graph, context(), DEFAULT_TICK_INTERVAL);
//! scheduler.run().await;
//! # Ok(())
//! # }
//! ```

mod graph;
mod runner;
mod worker;

pub use graph::{GraphError, JobGraph};
pub use runner::{DEFAULT_TICK_INTERVAL, Scheduler};
pub use worker::{Job, JobContext, JobError, Schedule, WorkerKey, WorkerSpec, WorkerState};
