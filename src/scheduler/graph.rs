//! The worker dependency graph: registration, eligibility, and run state.
//!
//! The graph only decides; it never executes. [`JobGraph::tick`] returns the
//! workers that may run now and the runner executes them, which keeps
//! scheduling decisions testable without any concurrency.
//!
//! Dependency readiness is recomputed fresh on every tick from current
//! state — there is no cached topological order, because dependency success
//! is time-varying: a periodic dependency goes stale again once its
//! dependents have run.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::worker::{Schedule, WorkerKey, WorkerSpec, WorkerState};

/// Graph-definition and lookup errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A worker with this key is already registered.
    #[error("duplicate worker key: {key}")]
    DuplicateKey {
        /// The colliding key.
        key: WorkerKey,
    },

    /// The would-be graph contains a dependency cycle.
    #[error("cyclic dependency: {}", .cycle.iter().map(WorkerKey::as_str).collect::<Vec<_>>().join(" -> "))]
    CyclicDependency {
        /// The cycle, first key repeated at the end.
        cycle: Vec<WorkerKey>,
    },

    /// No worker with this key exists.
    #[error("unknown worker: {key}")]
    UnknownWorker {
        /// The key that failed to resolve.
        key: WorkerKey,
    },
}

/// A registered worker plus its run state.
#[derive(Debug)]
struct WorkerNode {
    spec: WorkerSpec,
    state: WorkerState,
    /// When the worker last finished a run (success or failure).
    last_execution: Option<Instant>,
    /// When the worker last finished a successful run.
    last_success: Option<Instant>,
    /// Whether the last finished run succeeded.
    last_result: Option<bool>,
    /// Earliest instant of the next eligible run (periodic only).
    next_execution: Option<Instant>,
}

impl WorkerNode {
    fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            state: WorkerState::Waiting,
            last_execution: None,
            last_success: None,
            last_result: None,
            next_execution: None,
        }
    }
}

/// The in-memory worker graph.
#[derive(Debug, Default)]
pub struct JobGraph {
    workers: HashMap<WorkerKey, WorkerNode>,
}

impl JobGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker.
    ///
    /// Dependencies on keys not registered yet are allowed — such a worker
    /// is simply never eligible until they appear — but a dependency
    /// arrangement that would close a cycle fails fast, naming the cycle,
    /// and registers nothing.
    ///
    /// # Errors
    ///
    /// [`GraphError::DuplicateKey`] when the key exists;
    /// [`GraphError::CyclicDependency`] when the would-be graph is cyclic.
    #[instrument(skip(self, spec), fields(key = %spec.key))]
    pub fn register(&mut self, spec: WorkerSpec) -> Result<(), GraphError> {
        self.register_all(vec![spec])
    }

    /// Registers a set of workers atomically: either all of them join the
    /// graph or none do.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register); a duplicate inside the batch
    /// also fails the whole batch.
    pub fn register_all(&mut self, specs: Vec<WorkerSpec>) -> Result<(), GraphError> {
        let mut batch_keys = HashSet::new();
        for spec in &specs {
            if self.workers.contains_key(&spec.key) || !batch_keys.insert(spec.key.clone()) {
                return Err(GraphError::DuplicateKey {
                    key: spec.key.clone(),
                });
            }
        }

        // Validate the combined dependency graph before touching state.
        let mut edges: HashMap<&WorkerKey, &[WorkerKey]> = self
            .workers
            .values()
            .map(|node| (&node.spec.key, node.spec.dependencies.as_slice()))
            .collect();
        for spec in &specs {
            edges.insert(&spec.key, spec.dependencies.as_slice());
        }
        if let Some(cycle) = find_cycle(&edges) {
            warn!(cycle = ?cycle, "rejecting cyclic worker registration");
            return Err(GraphError::CyclicDependency { cycle });
        }

        for spec in specs {
            debug!(key = %spec.key, deps = spec.dependencies.len(), "registering worker");
            self.workers.insert(spec.key.clone(), WorkerNode::new(spec));
        }
        Ok(())
    }

    /// Scans all workers and returns the ones eligible to run now,
    /// transitioning them to `Enqueued`.
    ///
    /// A worker is eligible iff it is `Waiting`, every dependency's last
    /// recorded run succeeded since the worker's own last execution, and
    /// (for periodic workers) its next execution time has been reached.
    /// Execution itself is the runner's job.
    pub fn tick(&mut self, now: Instant) -> Vec<WorkerKey> {
        let mut eligible: Vec<WorkerKey> = self
            .workers
            .values()
            .filter(|node| node.state == WorkerState::Waiting)
            .filter(|node| node.next_execution.is_none_or(|next| next <= now))
            .filter(|node| self.dependencies_satisfied(node))
            .map(|node| node.spec.key.clone())
            .collect();
        // Deterministic selection order; the map iterates in arbitrary order.
        eligible.sort();

        for key in &eligible {
            if let Some(node) = self.workers.get_mut(key) {
                node.state = WorkerState::Enqueued;
            }
        }
        if !eligible.is_empty() {
            debug!(eligible = eligible.len(), "tick selected workers");
        }
        eligible
    }

    /// Marks an enqueued worker as running.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownWorker`] when the key does not exist.
    pub fn mark_running(&mut self, key: &WorkerKey) -> Result<(), GraphError> {
        let node = self.node_mut(key)?;
        node.state = WorkerState::Running;
        Ok(())
    }

    /// Records the outcome of a worker run.
    ///
    /// On success a periodic worker returns to `Waiting` with its next
    /// execution pushed out by its interval, and a one-shot worker is
    /// removed from the graph. On failure the worker is parked in `Failed`
    /// and excluded from eligibility until [`reset`](Self::reset) — failures
    /// do not auto-retry, to avoid hot-looping against a broken provider.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownWorker`] when the key does not exist.
    #[instrument(skip(self))]
    pub fn report_result(
        &mut self,
        key: &WorkerKey,
        success: bool,
        now: Instant,
    ) -> Result<(), GraphError> {
        let node = self.node_mut(key)?;
        node.last_execution = Some(now);
        node.last_result = Some(success);

        if !success {
            node.state = WorkerState::Failed;
            warn!(key = %key, "worker failed; parked until reset");
            return Ok(());
        }

        node.last_success = Some(now);
        let schedule = node.spec.schedule;
        match schedule {
            Schedule::Periodic { interval } => {
                node.state = WorkerState::Waiting;
                node.next_execution = Some(now + interval);
                debug!(key = %key, interval_secs = interval.as_secs(), "periodic worker completed");
            }
            Schedule::OneShot => {
                debug!(key = %key, "one-shot worker completed; removing");
                self.workers.remove(key);
            }
        }
        Ok(())
    }

    /// Returns a failed worker to `Waiting`, making it immediately eligible
    /// (manual retry).
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownWorker`] when the key does not exist.
    pub fn reset(&mut self, key: &WorkerKey) -> Result<(), GraphError> {
        let node = self.node_mut(key)?;
        if node.state == WorkerState::Failed {
            node.state = WorkerState::Waiting;
            node.next_execution = None;
        }
        Ok(())
    }

    /// Dependencies whose last recorded run has not succeeded since this
    /// worker's own last execution.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownWorker`] when the key does not exist.
    pub fn missing_dependencies(&self, key: &WorkerKey) -> Result<Vec<WorkerKey>, GraphError> {
        let node = self
            .workers
            .get(key)
            .ok_or_else(|| GraphError::UnknownWorker { key: key.clone() })?;
        Ok(node
            .spec
            .dependencies
            .iter()
            .filter(|dep| !self.dependency_satisfied(node, dep))
            .cloned()
            .collect())
    }

    /// Returns a worker's current state.
    #[must_use]
    pub fn state(&self, key: &WorkerKey) -> Option<WorkerState> {
        self.workers.get(key).map(|node| node.state)
    }

    /// Returns the job body of a worker, for the runner.
    #[must_use]
    pub(crate) fn job(&self, key: &WorkerKey) -> Option<std::sync::Arc<dyn super::worker::Job>> {
        self.workers.get(key).map(|node| std::sync::Arc::clone(&node.spec.job))
    }

    /// Returns true when a worker with this key is registered.
    #[must_use]
    pub fn contains(&self, key: &WorkerKey) -> bool {
        self.workers.contains_key(key)
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True when no workers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn dependencies_satisfied(&self, node: &WorkerNode) -> bool {
        node.spec
            .dependencies
            .iter()
            .all(|dep| self.dependency_satisfied(node, dep))
    }

    /// A dependency counts as satisfied when its last recorded run was a
    /// success that finished after this worker's own last execution.
    fn dependency_satisfied(&self, node: &WorkerNode, dep: &WorkerKey) -> bool {
        let Some(dep_node) = self.workers.get(dep) else {
            return false;
        };
        if dep_node.last_result != Some(true) {
            return false;
        }
        match (node.last_execution, dep_node.last_success) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(own), Some(dep_success)) => dep_success > own,
        }
    }

    fn node_mut(&mut self, key: &WorkerKey) -> Result<&mut WorkerNode, GraphError> {
        self.workers
            .get_mut(key)
            .ok_or_else(|| GraphError::UnknownWorker { key: key.clone() })
    }
}

/// Finds a dependency cycle in the edge map, if one exists.
///
/// Standard three-color depth-first search; returns the cycle path with the
/// entry key repeated at the end ("a -> b -> a").
fn find_cycle(edges: &HashMap<&WorkerKey, &[WorkerKey]>) -> Option<Vec<WorkerKey>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        key: &WorkerKey,
        edges: &HashMap<&WorkerKey, &[WorkerKey]>,
        colors: &mut HashMap<WorkerKey, Color>,
        stack: &mut Vec<WorkerKey>,
    ) -> Option<Vec<WorkerKey>> {
        colors.insert(key.clone(), Color::Gray);
        stack.push(key.clone());

        if let Some(deps) = edges.get(key) {
            for dep in *deps {
                // Edges to unregistered keys cannot close a cycle.
                if !edges.contains_key(dep) {
                    continue;
                }
                match colors.get(dep).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        let start = stack.iter().position(|k| k == dep).unwrap_or(0);
                        let mut cycle: Vec<WorkerKey> = stack[start..].to_vec();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Color::White => {
                        if let Some(cycle) = visit(dep, edges, colors, stack) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        colors.insert(key.clone(), Color::Black);
        None
    }

    let mut colors: HashMap<WorkerKey, Color> = HashMap::new();
    let mut stack = Vec::new();
    for key in edges.keys() {
        if colors.get(*key).copied().unwrap_or(Color::White) == Color::White {
            if let Some(cycle) = visit(key, edges, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
