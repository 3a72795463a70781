//! The task graph: bundle tasks, category aggregates and `default`.
//!
//! Edges point from a task to the aggregates depending on it. Every name is
//! unique across the whole graph; aggregates keep their members in
//! registration order so scheduling and log output are deterministic.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

use crate::backend::{Concurrency, Job};
use crate::bundle::Bundle;
use crate::diagnostics::{Diagnostic, DiagnosticBatch, Reporter};
use crate::error::{Error, Result};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Execution state of a task. `Succeeded`/`Failed` describe the last run; a
/// task in any state other than `Running` can run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Registered,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Builds one bundle through its resolved runner.
    Bundle {
        bundle: Arc<Bundle>,
        runner: String,
        job: Arc<dyn Job>,
    },
    /// Registered by a preset's `tasks` capability.
    Standalone {
        job: Arc<dyn Job>,
        watch: Vec<String>,
    },
    /// Runs its members; sequentially unless `mode` allows otherwise.
    Aggregate {
        members: Vec<String>,
        mode: Concurrency,
    },
}

#[derive(Debug)]
pub struct Task {
    name: String,
    owner: String,
    kind: TaskKind,
    state: Mutex<TaskState>,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The preset that registered the task (or contributed its runner).
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn state(&self) -> TaskState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(TaskState::Registered)
    }

    fn set_state(&self, state: TaskState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// The job, for bundle and standalone tasks.
    pub fn job(&self) -> Option<&Arc<dyn Job>> {
        match &self.kind {
            TaskKind::Bundle { job, .. } | TaskKind::Standalone { job, .. } => Some(job),
            TaskKind::Aggregate { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: DiGraph<Arc<Task>, ()>,
    index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. Aggregate members must already be registered.
    ///
    /// # Errors
    /// [`Error::DuplicateTask`] when the name is taken, naming `owner`.
    pub fn register(&mut self, name: &str, owner: &str, kind: TaskKind) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::DuplicateTask {
                preset: owner.to_string(),
                task: name.to_string(),
            });
        }

        let members: Vec<NodeIndex> = match &kind {
            TaskKind::Aggregate { members, .. } => members
                .iter()
                .map(|m| self.lookup(m))
                .collect::<Result<_>>()?,
            _ => Vec::new(),
        };

        let node = self.graph.add_node(Arc::new(Task {
            name: name.to_string(),
            owner: owner.to_string(),
            kind,
            state: Mutex::new(TaskState::Registered),
        }));
        for member in members {
            self.graph.add_edge(member, node, ());
        }
        self.index.insert(name.to_string(), node);
        debug!(task = name, owner, "registered task");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Task>> {
        self.index.get(name).map(|i| &self.graph[*i])
    }

    /// Task names in registration order.
    pub fn task_names(&self) -> Vec<&str> {
        self.graph.node_weights().map(|t| t.name.as_str()).collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.graph.node_weights()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Names of the tasks `name` waits for.
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>> {
        let node = self.lookup(name)?;
        let mut deps: Vec<&str> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|i| self.graph[i].name.as_str())
            .collect();
        deps.sort_unstable();
        Ok(deps)
    }

    /// Aggregates that include `name`.
    pub fn dependents(&self, name: &str) -> Result<Vec<&str>> {
        let node = self.lookup(name)?;
        let mut dependents: Vec<&str> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|i| self.graph[i].name.as_str())
            .collect();
        dependents.sort_unstable();
        Ok(dependents)
    }

    /// Checks that the graph has no cycles.
    pub fn validate(&self) -> Result<()> {
        toposort(&self.graph, None).map(|_| ()).map_err(|cycle| {
            Error::InvalidConfig(format!(
                "task cycle through '{}'",
                self.graph[cycle.node_id()].name
            ))
        })
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    /// Runs `name` to its terminal outcome.
    ///
    /// # Errors
    /// [`Error::UnknownTask`], or the first failure among the task's members.
    #[instrument(skip(self, reporter))]
    pub async fn run(self: &Arc<Self>, name: &str, reporter: Arc<dyn Reporter>) -> Result<()> {
        let node = self.lookup(name)?;
        Arc::clone(self).execute(node, reporter).await
    }

    fn execute(
        self: Arc<Self>,
        node: NodeIndex,
        reporter: Arc<dyn Reporter>,
    ) -> BoxFuture<Result<()>> {
        Box::pin(async move {
            let task = Arc::clone(&self.graph[node]);
            task.set_state(TaskState::Running);
            let started = Instant::now();
            reporter.status(&task.name, &format!("Starting '{}' ...", task.name));

            let result = match &task.kind {
                TaskKind::Bundle { job, .. } | TaskKind::Standalone { job, .. } => {
                    run_job(&task.name, job.as_ref(), reporter.as_ref()).await
                }
                TaskKind::Aggregate { members, mode } => {
                    Arc::clone(&self)
                        .run_aggregate(&task.name, members, *mode, Arc::clone(&reporter))
                        .await
                }
            };

            match &result {
                Ok(()) => {
                    task.set_state(TaskState::Succeeded);
                    reporter.status(
                        &task.name,
                        &format!("Finished '{}' after {:?}", task.name, started.elapsed()),
                    );
                }
                Err(e) => {
                    task.set_state(TaskState::Failed);
                    debug!(task = %task.name, error = %e, "task failed");
                }
            }
            result
        })
    }

    async fn run_aggregate(
        self: Arc<Self>,
        aggregate: &str,
        members: &[String],
        mode: Concurrency,
        reporter: Arc<dyn Reporter>,
    ) -> Result<()> {
        let members = members
            .iter()
            .map(|m| self.lookup(m))
            .collect::<Result<Vec<_>>>()?;
        match mode {
            Concurrency::Sequential => self.run_sequential(members, reporter).await,
            Concurrency::Parallel => self.run_concurrent(aggregate, members, reporter).await,
        }
    }

    async fn run_sequential(
        self: Arc<Self>,
        members: Vec<NodeIndex>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<()> {
        for member in members {
            Arc::clone(&self).execute(member, Arc::clone(&reporter)).await?;
        }
        Ok(())
    }

    // Every spawned member reaches its terminal outcome (and flushes its
    // batch) even after a sibling failed.
    async fn run_concurrent(
        self: Arc<Self>,
        aggregate: &str,
        members: Vec<NodeIndex>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<()> {
        let mut join_set = JoinSet::new();
        for member in members {
            join_set.spawn(Arc::clone(&self).execute(member, Arc::clone(&reporter)));
        }

        let mut first_failure = None;
        while let Some(joined) = join_set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(task = aggregate, error = %e, "task panicked");
                    Err(Error::compilation(aggregate, format!("task panicked: {e}")))
                }
            };
            if let Err(e) = result {
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

/// Runs one job and flushes its batch exactly once, after the outcome is known.
async fn run_job(task: &str, job: &dyn Job, reporter: &dyn Reporter) -> Result<()> {
    let mut batch = DiagnosticBatch::new(task);
    match job.run().await {
        Ok(outcome) => {
            let failed = !outcome.succeeded;
            let message = failed.then(|| outcome.failure_message());
            batch.extend(outcome.diagnostics);
            batch.flush(reporter);
            match message {
                Some(message) => Err(Error::compilation(task, message)),
                None => Ok(()),
            }
        }
        Err(e) => {
            batch.push(Diagnostic::error(e.to_string()));
            batch.flush(reporter);
            Err(e)
        }
    }
}

/// Lets a preset register standalone tasks under its own name.
#[derive(Debug)]
pub struct TaskRegistrar<'a> {
    graph: &'a mut TaskGraph,
    owner: String,
    registered: Vec<String>,
}

impl<'a> TaskRegistrar<'a> {
    pub(crate) fn new(graph: &'a mut TaskGraph, owner: &str) -> Self {
        Self {
            graph,
            owner: owner.to_string(),
            registered: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &str, job: Arc<dyn Job>) -> Result<()> {
        self.register_watched(name, job, Vec::new())
    }

    /// Registers a task that reruns in watch mode when `patterns` change.
    pub fn register_watched(
        &mut self,
        name: &str,
        job: Arc<dyn Job>,
        patterns: Vec<String>,
    ) -> Result<()> {
        self.graph.register(
            name,
            &self.owner,
            TaskKind::Standalone {
                job,
                watch: patterns,
            },
        )?;
        self.registered.push(name.to_string());
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.graph.contains(name)
    }

    pub(crate) fn into_registered(self) -> Vec<String> {
        self.registered
    }
}
