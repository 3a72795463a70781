//! Continuous builds.
//!
//! Each watched task owns one event queue. Engine-driven tasks are rebuilt by
//! a driver loop fed from a debounced file watcher; native watchers push
//! [`BackendEvent`]s themselves. Either way a [`BundleMonitor`] turns the
//! backend's events into the uniform [`WatchEvent`] lifecycle, owns the
//! task's warning batch and guarantees a single compilation in flight.

use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BuildOutcome, Job, WatchHandle, WatchMode};
use crate::bundle::split_pattern;
use crate::diagnostics::{Diagnostic, DiagnosticBatch, Reporter};
use crate::error::{Error, Result};

/// Where native watchers send their events.
pub type EventSink = mpsc::UnboundedSender<BackendEvent>;

/// Raw events reported by a backend while watching.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Ready,
    /// Sources changed and a compilation starts.
    Invalidated,
    Diagnostic(Diagnostic),
    Completed(BuildOutcome),
    Fatal(String),
}

/// The normalized lifecycle of a watched task.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Start,
    Compiling,
    Warning(Vec<Diagnostic>),
    Success(Vec<PathBuf>),
    Fatal(String),
}

/// A lifecycle event attributed to its task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub task: String,
    pub event: WatchEvent,
}

/// A task to watch.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub task: String,
    pub job: Arc<dyn Job>,
    pub patterns: Vec<String>,
}

/// Per-task event normalizer.
#[derive(Debug)]
pub struct BundleMonitor {
    task: String,
    batch: DiagnosticBatch,
    in_flight: bool,
    reporter: Arc<dyn Reporter>,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl BundleMonitor {
    pub fn new(
        task: &str,
        reporter: Arc<dyn Reporter>,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        Self {
            task: task.to_string(),
            batch: DiagnosticBatch::new(task),
            in_flight: false,
            reporter,
            events,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn handle(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Ready => {
                self.reporter.status(&self.task, "Watching for changes");
                self.emit(WatchEvent::Start);
            }
            BackendEvent::Invalidated => {
                if self.in_flight {
                    debug!(task = %self.task, "compilation already in flight");
                    return;
                }
                self.in_flight = true;
                self.reporter.status(&self.task, "Compiling...");
                self.emit(WatchEvent::Compiling);
            }
            BackendEvent::Diagnostic(diagnostic) => self.batch.push(diagnostic),
            BackendEvent::Completed(outcome) => {
                self.in_flight = false;
                let failure = (!outcome.succeeded).then(|| outcome.failure_message());
                self.batch.extend(outcome.diagnostics);
                match failure {
                    None => {
                        let warnings = self.batch.diagnostics().to_vec();
                        self.batch.flush(self.reporter.as_ref());
                        if !warnings.is_empty() {
                            self.emit(WatchEvent::Warning(warnings));
                        }
                        self.reporter.status(&self.task, "Finished");
                        self.emit(WatchEvent::Success(outcome.outputs));
                    }
                    Some(message) => self.fail(message),
                }
            }
            BackendEvent::Fatal(message) => {
                self.in_flight = false;
                self.batch.push(Diagnostic::error(message.clone()));
                self.fail(message);
            }
        }
    }

    fn fail(&mut self, message: String) {
        self.batch.flush(self.reporter.as_ref());
        self.emit(WatchEvent::Fatal(message));
    }

    fn emit(&self, event: WatchEvent) {
        // The session may already be gone during shutdown.
        let _ = self.events.send(TaskEvent {
            task: self.task.clone(),
            event,
        });
    }
}

/// Rebuilds `job` on every trigger, one compilation at a time. Triggers
/// arriving during a compilation collapse into a single re-run.
async fn drive(
    job: Arc<dyn Job>,
    mut triggers: mpsc::UnboundedReceiver<()>,
    mut stop: oneshot::Receiver<()>,
    mut monitor: BundleMonitor,
) {
    monitor.handle(BackendEvent::Ready);
    let mut pending = true;

    loop {
        if !pending {
            tokio::select! {
                _ = &mut stop => return,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
            }
        }
        while triggers.try_recv().is_ok() {}
        pending = false;

        monitor.handle(BackendEvent::Invalidated);
        let run = job.run();
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = &mut stop => return,
                Some(()) = triggers.recv() => {
                    if !pending {
                        debug!(task = %monitor.task, "change during compilation, re-run scheduled");
                    }
                    pending = true;
                }
            }
        };

        match result {
            Ok(outcome) => monitor.handle(BackendEvent::Completed(outcome)),
            Err(e) => monitor.handle(BackendEvent::Fatal(e.to_string())),
        }
    }
}

/// Forwards events of a native watcher to its monitor until the sink closes.
async fn forward(mut events: mpsc::UnboundedReceiver<BackendEvent>, mut monitor: BundleMonitor) {
    monitor.handle(BackendEvent::Ready);
    while let Some(event) = events.recv().await {
        monitor.handle(event);
    }
    debug!(task = %monitor.task, "native watcher closed its event queue");
}

/// Starts a debounced watcher sending a trigger whenever a file matching one
/// of `patterns` changes. `None` when no pattern points at an existing
/// directory.
fn watch_files(
    task: &str,
    patterns: &[String],
    debounce: Duration,
    triggers: mpsc::UnboundedSender<()>,
) -> Result<Option<Debouncer<RecommendedWatcher>>> {
    let cwd = std::env::current_dir().map_err(|e| Error::io(".", e))?;
    let mut roots: Vec<PathBuf> = Vec::new();
    let mut matchers: Vec<Pattern> = Vec::new();

    for pattern in patterns {
        let (base, rest) = split_pattern(pattern);
        let Ok(root) = cwd.join(&base).canonicalize() else {
            warn!(task, pattern = %pattern, "watch base does not exist, skipping");
            continue;
        };
        let full = format!("{}/{}", Pattern::escape(&root.to_string_lossy()), rest);
        match Pattern::new(&full) {
            Ok(matcher) => matchers.push(matcher),
            Err(e) => {
                return Err(Error::InvalidBundle {
                    bundle: task.to_string(),
                    reason: format!("invalid watch pattern '{pattern}': {e}"),
                })
            }
        }
        if !roots.iter().any(|r| root.starts_with(r)) {
            roots.retain(|r| !r.starts_with(&root));
            roots.push(root);
        }
    }
    if roots.is_empty() {
        return Ok(None);
    }

    let name = task.to_string();
    let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| match result {
        Ok(events) => {
            if events
                .iter()
                .any(|e| matchers.iter().any(|m| m.matches_path(&e.path)))
            {
                let _ = triggers.send(());
            }
        }
        Err(e) => warn!(task = %name, error = ?e, "file watcher error"),
    })?;
    for root in &roots {
        debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
        debug!(task, root = %root.display(), "watching directory");
    }
    Ok(Some(debouncer))
}

enum Driver {
    Engine {
        triggers: mpsc::UnboundedSender<()>,
        stop: oneshot::Sender<()>,
        files: Option<Debouncer<RecommendedWatcher>>,
    },
    Native {
        handle: Box<dyn WatchHandle>,
    },
}

/// The persistent watch entry of one task.
pub struct TaskWatcher {
    task: String,
    driver: Driver,
    join: JoinHandle<()>,
}

impl Debug for TaskWatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.driver {
            Driver::Engine { files, .. } if files.is_some() => "engine+files",
            Driver::Engine { .. } => "engine",
            Driver::Native { .. } => "native",
        };
        f.debug_struct("TaskWatcher")
            .field("task", &self.task)
            .field("mode", &mode)
            .finish()
    }
}

impl TaskWatcher {
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Requests a rebuild as if a watched file changed. Returns `false` for
    /// native watchers, which rebuild on their own.
    pub fn invalidate(&self) -> bool {
        match &self.driver {
            Driver::Engine { triggers, .. } => triggers.send(()).is_ok(),
            Driver::Native { .. } => false,
        }
    }

    /// Stops watching: drops the file watcher, cancels an in-flight
    /// compilation and waits for the driver to finish.
    pub async fn stop(self) -> Result<()> {
        let result = match self.driver {
            Driver::Engine {
                triggers,
                stop,
                files,
            } => {
                drop(files);
                drop(triggers);
                let _ = stop.send(());
                Ok(())
            }
            Driver::Native { handle } => {
                let stopped = handle.stop().await;
                self.join.abort();
                stopped
            }
        };
        if let Err(e) = self.join.await {
            if !e.is_cancelled() {
                warn!(task = %self.task, error = %e, "watch driver panicked");
            }
        }
        debug!(task = %self.task, "stopped watching");
        result
    }
}

/// Settings shared by every watcher of a session.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    /// Disables file watching; rebuilds only happen through
    /// [`WatchSession::invalidate`].
    pub watch_files: bool,
    pub reporter: Arc<dyn Reporter>,
}

/// Every active watcher of one invocation plus their lifecycle events.
#[derive(Debug)]
pub struct WatchSession {
    watchers: Vec<TaskWatcher>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
}

impl WatchSession {
    /// Starts one watcher per target. Watchers run in the background; this
    /// returns as soon as they are spawned.
    ///
    /// # Errors
    /// A target that cannot be watched stops the already started watchers
    /// and fails the whole session.
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn start(targets: Vec<WatchTarget>, options: WatchOptions) -> Result<Self> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut watchers = Vec::with_capacity(targets.len());

        for target in targets {
            match Self::start_one(target, &options, events_tx.clone()).await {
                Ok(watcher) => watchers.push(watcher),
                Err(e) => {
                    for watcher in watchers {
                        if let Err(stop_error) = watcher.stop().await {
                            warn!(error = %stop_error, "failed to stop watcher");
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(target: "kiln", count = watchers.len(), "watching");
        Ok(Self { watchers, events })
    }

    async fn start_one(
        target: WatchTarget,
        options: &WatchOptions,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Result<TaskWatcher> {
        let monitor = BundleMonitor::new(&target.task, Arc::clone(&options.reporter), events);

        match target.job.watch_mode() {
            WatchMode::Unsupported => Err(Error::WatchUnsupported(target.task)),
            WatchMode::Native => {
                let (sink, queue) = mpsc::unbounded_channel();
                let handle = target.job.watch(sink).await?;
                let join = tokio::spawn(forward(queue, monitor));
                Ok(TaskWatcher {
                    task: target.task,
                    driver: Driver::Native { handle },
                    join,
                })
            }
            WatchMode::Engine => {
                let (triggers, queue) = mpsc::unbounded_channel();
                let files = if options.watch_files {
                    watch_files(
                        &target.task,
                        &target.patterns,
                        options.debounce,
                        triggers.clone(),
                    )?
                } else {
                    None
                };
                let (stop, stop_rx) = oneshot::channel();
                let join = tokio::spawn(drive(target.job, queue, stop_rx, monitor));
                Ok(TaskWatcher {
                    task: target.task,
                    driver: Driver::Engine {
                        triggers,
                        stop,
                        files,
                    },
                    join,
                })
            }
        }
    }

    pub fn tasks(&self) -> Vec<&str> {
        self.watchers.iter().map(TaskWatcher::task).collect()
    }

    /// Requests a rebuild of `task`.
    pub fn invalidate(&self, task: &str) -> Result<bool> {
        self.watchers
            .iter()
            .find(|w| w.task == task)
            .map(TaskWatcher::invalidate)
            .ok_or_else(|| Error::UnknownTask(task.to_string()))
    }

    /// The next lifecycle event of any watched task.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Stops every watcher, reporting the first failure after all of them
    /// were asked to stop.
    #[instrument(skip_all)]
    pub async fn stop(self) -> Result<()> {
        let mut first_failure = None;
        for watcher in self.watchers {
            if let Err(e) = watcher.stop().await {
                warn!(error = %e, "failed to stop watcher");
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}
