//! Worker definitions: keys, states, schedules, and the job execution seam.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::{FetchClient, FetchError};
use crate::provider::{ProviderError, ProviderRegistry};
use crate::reconcile::{ReconcileError, Reconciler};
use crate::store::EntityStore;

/// Stable opaque identifier of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerKey(String);

impl WorkerKey {
    /// Creates a key from any string-like value.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Execution state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Idle, will be considered on the next tick.
    Waiting,
    /// Selected by a tick, not yet started.
    Enqueued,
    /// Execution body is running.
    Running,
    /// Last run finished successfully.
    Completed,
    /// Last run failed; excluded from eligibility until reset.
    Failed,
}

impl WorkerState {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a worker re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Runs once, then is removed from the graph.
    OneShot,
    /// Re-runs every `interval` after a successful run.
    Periodic {
        /// Time between the end of one successful run and the next
        /// eligibility.
        interval: Duration,
    },
}

/// Error from a job execution body.
#[derive(Debug, Error)]
pub enum JobError {
    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Reconciliation failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// A direct fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Anything else the job wants to fail with.
    #[error("job failed: {message}")]
    Failed {
        /// What went wrong.
        message: String,
    },
}

impl JobError {
    /// Creates a free-form job failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Everything a job body may need, injected at scheduler construction.
///
/// There are no process-wide registries: tests build an isolated context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Enabled providers.
    pub providers: Arc<ProviderRegistry>,
    /// Shared fetch client (HTTP transport).
    pub fetch: Arc<FetchClient>,
    /// The identity map.
    pub reconciler: Arc<Reconciler>,
    /// Persistence collaborator.
    pub store: Arc<dyn EntityStore>,
    /// Cooperative cancellation, set on shutdown.
    pub cancel: Arc<AtomicBool>,
}

/// A worker's execution body.
///
/// Jobs are invoked by the scheduler on their own task; errors and panics
/// are caught there and recorded as a failed run, never crashing the
/// scheduling loop.
#[async_trait]
pub trait Job: Send + Sync {
    /// Runs the job to completion or failure.
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// A worker as registered into the graph.
#[derive(Clone)]
pub struct WorkerSpec {
    /// Stable identifier.
    pub key: WorkerKey,
    /// Workers that must have succeeded (since this worker's own last run)
    /// before this worker may run.
    pub dependencies: Vec<WorkerKey>,
    /// One-shot or periodic.
    pub schedule: Schedule,
    /// Execution body.
    pub job: Arc<dyn Job>,
}

impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("key", &self.key)
            .field("dependencies", &self.dependencies)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl WorkerSpec {
    /// Creates a one-shot worker.
    #[must_use]
    pub fn one_shot(key: impl Into<WorkerKey>, job: Arc<dyn Job>) -> Self {
        Self {
            key: key.into(),
            dependencies: Vec::new(),
            schedule: Schedule::OneShot,
            job,
        }
    }

    /// Creates a periodic worker.
    #[must_use]
    pub fn periodic(key: impl Into<WorkerKey>, interval: Duration, job: Arc<dyn Job>) -> Self {
        Self {
            key: key.into(),
            dependencies: Vec::new(),
            schedule: Schedule::Periodic { interval },
            job,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, key: impl Into<WorkerKey>) -> Self {
        self.dependencies.push(key.into());
        self
    }
}

impl From<String> for WorkerKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Job doubles shared by scheduler tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Job that counts executions and succeeds or fails on demand.
    #[derive(Debug, Default)]
    pub struct CountingJob {
        pub runs: AtomicUsize,
        pub fail: bool,
    }

    impl CountingJob {
        pub fn succeeding() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(JobError::failed("scripted failure"));
            }
            Ok(())
        }
    }

    /// Job that panics, for loop-isolation tests.
    #[derive(Debug)]
    pub struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            panic!("scripted panic");
        }
    }
}
