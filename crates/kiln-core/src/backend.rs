//! The contract between the task graph and the tools that actually compile.
//!
//! A [`Backend`] is offered by a preset as a runner. When the graph is
//! constructed, the backend prepares one [`Job`] per bundle; assembling the
//! plugin pipeline happens there so configuration errors surface before any
//! task runs.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bundle::Bundle;
use crate::config::{Config, Environment};
use crate::context::BuildContext;
use crate::diagnostics::Diagnostic;
use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::watch::EventSink;

/// Whether bundles of one backend may build at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Concurrency {
    #[default]
    Parallel,
    Sequential,
}

/// How a job reacts to watch mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchMode {
    /// The engine watches the bundle's patterns and calls [`Job::run`] again.
    #[default]
    Engine,
    /// The backend watches on its own and reports through an [`EventSink`].
    Native,
    Unsupported,
}

/// Everything a backend needs to build one bundle.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub task: String,
    pub runner: String,
    pub bundle: Arc<Bundle>,
    pub config: Arc<Config>,
    /// Destination root; outputs go to `bundle.output_dir(destination)`.
    pub destination: PathBuf,
    pub environment: Environment,
    pub watching: bool,
    pub ports: Arc<PortAllocator>,
}

impl TaskDefinition {
    pub fn output_dir(&self) -> PathBuf {
        self.bundle.output_dir(&self.destination)
    }

    pub fn output_path(&self) -> PathBuf {
        self.bundle.output_path(&self.destination)
    }
}

/// The result of one build. Compilation failures are reported here, not as
/// `Err`: an `Err` from [`Job::run`] means the backend could not run at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutcome {
    pub succeeded: bool,
    pub outputs: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildOutcome {
    pub fn success(outputs: Vec<PathBuf>) -> Self {
        Self {
            succeeded: true,
            outputs,
            diagnostics: Vec::new(),
        }
    }

    pub fn failure(diagnostic: Diagnostic) -> Self {
        Self {
            succeeded: false,
            outputs: Vec::new(),
            diagnostics: vec![diagnostic],
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }

    /// The message used when the owning task fails.
    pub fn failure_message(&self) -> String {
        self.diagnostics
            .iter()
            .find(|d| d.is_error())
            .map(ToString::to_string)
            .unwrap_or_else(|| "build failed".to_string())
    }
}

/// A runner implementation offered through `bundleCreator`.
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn concurrency(&self) -> Concurrency {
        Concurrency::Parallel
    }

    /// Builds the task definition for one bundle, including its pipeline.
    fn prepare(&self, ctx: &BuildContext, task: TaskDefinition) -> Result<Arc<dyn Job>>;
}

/// A prepared, repeatable unit of work.
#[async_trait]
pub trait Job: Send + Sync + std::fmt::Debug {
    async fn run(&self) -> Result<BuildOutcome>;

    fn watch_mode(&self) -> WatchMode {
        WatchMode::Engine
    }

    /// Starts backend-native watching. Only called for [`WatchMode::Native`].
    async fn watch(&self, _events: EventSink) -> Result<Box<dyn WatchHandle>> {
        Err(Error::InvalidConfig(
            "job declared native watch without implementing it".to_string(),
        ))
    }
}

/// A running native watcher.
#[async_trait]
pub trait WatchHandle: Send + Sync + std::fmt::Debug {
    /// Stops watching and releases every resource (processes, ports).
    async fn stop(self: Box<Self>) -> Result<()>;
}
