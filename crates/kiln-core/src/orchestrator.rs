use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::backend::{Concurrency, TaskDefinition};
use crate::bundle::{collect_bundles, Bundle};
use crate::commands::{collect_commands, CommandTable};
use crate::config::ProjectConfig;
use crate::constants::DEFAULT_TASK;
use crate::context::{BuildContext, BuildOptions};
use crate::error::Result;
use crate::graph::{TaskGraph, TaskKind, TaskRegistrar};
use crate::preset::{Capability, Preset};
use crate::registry::PresetRegistry;
use crate::resolver::{collect_runners, resolve_runner};
use crate::test_runner::run_tests;
use crate::watch::{WatchOptions, WatchSession, WatchTarget};

/// Owner recorded for the aggregates the orchestrator registers itself.
const ORCHESTRATOR: &str = "kiln";

/// One build invocation: loaded presets, merged configuration and the task
/// graph derived from them.
///
/// Construction performs every resolution step, so any configuration error
/// surfaces here, before a single task runs.
#[derive(Debug)]
pub struct Orchestrator {
    ctx: Arc<BuildContext>,
    graph: Arc<TaskGraph>,
    bundles: Vec<Arc<Bundle>>,
}

impl Orchestrator {
    #[instrument(skip_all)]
    pub fn new(
        presets: Vec<Arc<dyn Preset>>,
        project: Option<&ProjectConfig>,
        options: BuildOptions,
    ) -> Result<Self> {
        let registry = PresetRegistry::register(presets)?;
        let config = registry.compose_config(project);
        let ctx = Arc::new(BuildContext::new(registry, config, options)?);

        let mut graph = TaskGraph::new();
        let mut top_level = register_preset_tasks(&ctx, &mut graph)?;
        let bundles = register_bundle_tasks(&ctx, &mut graph, &mut top_level)?;

        graph.register(
            DEFAULT_TASK,
            ORCHESTRATOR,
            TaskKind::Aggregate {
                members: top_level,
                mode: Concurrency::Parallel,
            },
        )?;
        graph.validate()?;

        info!(
            target: "kiln",
            presets = ?ctx.registry().loaded(),
            tasks = graph.len(),
            "build graph ready"
        );
        Ok(Self {
            ctx,
            graph: Arc::new(graph),
            bundles,
        })
    }

    pub fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    pub fn bundles(&self) -> &[Arc<Bundle>] {
        &self.bundles
    }

    /// Task names in registration order.
    pub fn task_names(&self) -> Vec<String> {
        self.graph
            .task_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Runs `task` (and everything it aggregates) once.
    pub async fn run(&self, task: &str) -> Result<()> {
        self.graph
            .run(task, Arc::clone(self.ctx.reporter()))
            .await
    }

    /// Starts watching every bundle task and every standalone task that
    /// declared watch patterns.
    pub async fn watch(&self) -> Result<WatchSession> {
        self.watch_with(true).await
    }

    /// Like [`Orchestrator::watch`]; without file watching rebuilds only
    /// happen through [`WatchSession::invalidate`].
    pub async fn watch_with(&self, watch_files: bool) -> Result<WatchSession> {
        let targets: Vec<WatchTarget> = self
            .graph
            .tasks()
            .filter_map(|task| match task.kind() {
                TaskKind::Bundle { bundle, job, .. } => Some(WatchTarget {
                    task: task.name().to_string(),
                    job: Arc::clone(job),
                    patterns: bundle.watch_patterns().to_vec(),
                }),
                TaskKind::Standalone { job, watch } if !watch.is_empty() => Some(WatchTarget {
                    task: task.name().to_string(),
                    job: Arc::clone(job),
                    patterns: watch.clone(),
                }),
                _ => None,
            })
            .collect();

        let options = WatchOptions {
            debounce: Duration::from_millis(self.ctx.watch_settings().debounce_ms),
            watch_files,
            reporter: Arc::clone(self.ctx.reporter()),
        };
        WatchSession::start(targets, options).await
    }

    /// Merged commands: preset commands, then the builtins.
    pub fn commands(&self) -> CommandTable {
        collect_commands(&self.ctx)
    }

    pub async fn test(&self, cwd: &Path, patterns: &[String]) -> Result<()> {
        run_tests(&self.ctx, cwd, patterns).await
    }
}

/// Runs the `tasks` capability; returns the names that join `default`.
fn register_preset_tasks(ctx: &BuildContext, graph: &mut TaskGraph) -> Result<Vec<String>> {
    let mut registered = Vec::new();
    for preset in ctx.registry().implementations(&Capability::Tasks) {
        let mut registrar = TaskRegistrar::new(graph, preset.name());
        preset.tasks(ctx, &mut registrar)?;
        registered.extend(registrar.into_registered());
    }
    Ok(registered)
}

/// Resolves a runner for every bundle and registers bundle and category
/// tasks, category by category.
fn register_bundle_tasks(
    ctx: &BuildContext,
    graph: &mut TaskGraph,
    top_level: &mut Vec<String>,
) -> Result<Vec<Arc<Bundle>>> {
    let bundles: Vec<Arc<Bundle>> = collect_bundles(ctx.config())?
        .into_iter()
        .map(Arc::new)
        .collect();
    let runners = collect_runners(ctx);

    let mut categories: Vec<&str> = Vec::new();
    for bundle in &bundles {
        if !categories.contains(&bundle.category.as_str()) {
            categories.push(&bundle.category);
        }
    }

    for category in categories {
        let candidates = runners.candidates(category);
        let mut members = Vec::new();
        let mut mode = Concurrency::Parallel;

        for bundle in bundles.iter().filter(|b| b.category == category) {
            let runner = resolve_runner(bundle, candidates)?;
            debug!(bundle = %bundle.name, runner = %runner.id, "resolved runner");
            if runner.backend.concurrency() == Concurrency::Sequential {
                mode = Concurrency::Sequential;
            }

            let definition = TaskDefinition {
                task: bundle.task_name.clone(),
                runner: runner.id.clone(),
                bundle: Arc::clone(bundle),
                config: Arc::clone(ctx.config()),
                destination: ctx.destination(),
                environment: ctx.environment(),
                watching: ctx.is_watching(),
                ports: Arc::clone(ctx.ports()),
            };
            let job = runner.backend.prepare(ctx, definition)?;
            graph.register(
                &bundle.task_name,
                &runner.preset,
                TaskKind::Bundle {
                    bundle: Arc::clone(bundle),
                    runner: runner.id.clone(),
                    job,
                },
            )?;
            members.push(bundle.task_name.clone());
        }

        // A sole bundle named after its category already is the category task.
        let collapsed = members.len() == 1 && members[0] == category;
        if !collapsed {
            graph.register(category, ORCHESTRATOR, TaskKind::Aggregate { members, mode })?;
        }
        top_level.push(category.to_string());
    }

    Ok(bundles)
}
