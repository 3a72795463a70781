//! The builtin `exec` preset: builds bundles by running an external bundler.
//!
//! A bundle names its tool through `command` (or `exec.<category>.command`):
//!
//! ```toml
//! [js.app]
//! source = "js/app.js"
//! command = ["esbuild", "{source}", "--bundle", "--outfile={destination}"]
//! ```
//!
//! `{source}`, `{destination}`, `{format}` and `{environment}` are substituted,
//! then the argument fragments of the `pipeline:exec` capability are appended
//! in weight order. The tool reports through JSON lines on stdout.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::constants::{ENV_OVERRIDE, PORT_ENV};
use kiln_core::pipeline::{assemble, PipelineBuilder, PipelineSlot, PluginContribution};
use kiln_core::protocol::{run_tool, WireMessage};
use kiln_core::watch::BackendEvent;
use kiln_core::{
    Backend, BuildContext, BuildOutcome, Bundle, Capability, ConfigFragment, Environment, Error,
    EventSink, Job, Preset, Result, RunnerTable, TaskDefinition, WatchHandle, WatchMode,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use toml::Value;
use tracing::{debug, info, instrument, warn};

pub const PRESET_NAME: &str = "exec";
pub const RUNNER: &str = "exec";

/// One argument fragment of the `exec` pipeline.
pub type ExecArgs = Vec<String>;

#[derive(Debug, Default)]
pub struct ExecPreset;

impl ExecPreset {
    pub fn new() -> Self {
        Self
    }
}

impl Preset for ExecPreset {
    fn name(&self) -> &str {
        PRESET_NAME
    }

    fn capabilities(&self) -> HashSet<Capability> {
        HashSet::from([
            Capability::DefaultConfig,
            Capability::BundleCreator,
            Capability::pipeline(RUNNER),
        ])
    }

    fn default_config(&self) -> ConfigFragment {
        ConfigFragment::new()
            .set("bundle_types.js", "js")
            .set("bundle_types.css", "css")
            .set("exec.categories", vec!["js", "css"])
    }

    fn bundle_creator(&self, ctx: &BuildContext, runners: &mut RunnerTable) {
        let categories = ctx
            .config()
            .get("exec.categories")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        let backend: Arc<dyn Backend> = Arc::new(ExecBackend);
        for category in categories {
            runners.add(category, RUNNER, Arc::clone(&backend));
        }
    }

    fn pipeline(&self, ctx: &BuildContext, bundle: &Bundle, slot: &mut PipelineSlot<'_>) {
        let Some(builder) = slot.builder::<ExecArgs>() else {
            return;
        };

        if let Some(format) = &bundle.format {
            builder.insert("format", fragment(vec![format!("--format={format}")]).weight(20));
        }
        if !bundle.externals.is_empty() {
            let args = bundle
                .externals
                .iter()
                .map(|external| format!("--external:{external}"))
                .collect();
            builder.insert("externals", fragment(args).weight(30));
        }
        let minify = bundle
            .extra
            .get("minify")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if minify && ctx.environment() == Environment::Production {
            builder.insert("minify", fragment(vec!["--minify".to_string()]).weight(100));
        }
    }
}

fn fragment(args: ExecArgs) -> PluginContribution<ExecArgs> {
    PluginContribution::new(move |_| Ok(args.clone()))
}

/// Reads a command from a string (split on whitespace) or an array of strings.
fn read_command(value: &Value) -> Option<Vec<String>> {
    let argv: Option<Vec<String>> = match value {
        Value::String(text) => Some(text.split_whitespace().map(str::to_string).collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => None,
    };
    argv.filter(|argv| !argv.is_empty())
}

/// Values substituted into command templates.
#[derive(Debug, Clone)]
struct Placeholders {
    sources: Vec<String>,
    destination: String,
    format: String,
    environment: String,
}

impl Placeholders {
    /// A lone `{source}` argument expands to one argument per source.
    fn render(&self, template: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(template.len());
        for arg in template {
            if arg == "{source}" {
                argv.extend(self.sources.iter().cloned());
                continue;
            }
            argv.push(
                arg.replace("{source}", &self.sources.join(" "))
                    .replace("{destination}", &self.destination)
                    .replace("{format}", &self.format)
                    .replace("{environment}", &self.environment),
            );
        }
        argv
    }
}

#[derive(Debug)]
struct ExecBackend;

impl ExecBackend {
    fn template(ctx: &BuildContext, bundle: &Bundle, key: &str) -> Option<Vec<String>> {
        bundle
            .extra
            .get(key)
            .or_else(|| {
                ctx.config()
                    .get(&format!("{RUNNER}.{}.{key}", bundle.category))
            })
            .and_then(read_command)
    }
}

impl Backend for ExecBackend {
    fn name(&self) -> &str {
        RUNNER
    }

    fn prepare(&self, ctx: &BuildContext, task: TaskDefinition) -> Result<Arc<dyn Job>> {
        let bundle = &task.bundle;
        let command = Self::template(ctx, bundle, "command").ok_or_else(|| {
            Error::InvalidBundle {
                bundle: bundle.name.clone(),
                reason: "missing 'command'".to_string(),
            }
        })?;
        let watch_command = Self::template(ctx, bundle, "watch_command");
        let extra_args: Vec<String> = assemble(ctx, RUNNER, bundle, PipelineBuilder::<ExecArgs>::new())?
            .into_iter()
            .flatten()
            .collect();

        let placeholders = Placeholders {
            sources: bundle.sources.clone(),
            destination: task.output_path().display().to_string(),
            format: bundle.format.clone().unwrap_or_default(),
            environment: task.environment.to_string(),
        };
        let render = |template: &[String]| {
            let mut argv = placeholders.render(template);
            argv.extend(extra_args.iter().cloned());
            argv
        };
        let serve = bundle
            .extra
            .get("serve")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let job = ExecJob {
            argv: render(&command),
            watch_argv: watch_command.as_deref().map(render),
            serve,
            port: OnceCell::new(),
            task,
        };
        debug!(task = %job.task.task, argv = ?job.argv, "prepared exec job");
        Ok(Arc::new(job))
    }
}

#[derive(Debug)]
struct ExecJob {
    task: TaskDefinition,
    argv: Vec<String>,
    watch_argv: Option<Vec<String>>,
    serve: bool,
    port: OnceCell<u16>,
}

impl ExecJob {
    /// Allocates this bundle's dev-server port on first use.
    async fn port(&self) -> Result<Option<u16>> {
        if !(self.serve && self.task.watching) {
            return Ok(None);
        }
        let port = self
            .port
            .get_or_try_init(|| self.task.ports.allocate(&self.task.task))
            .await?;
        Ok(Some(*port))
    }

    async fn command(&self, argv: &[String]) -> Result<(Command, String)> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::InvalidBundle {
            bundle: self.task.bundle.name.clone(),
            reason: "empty command".to_string(),
        })?;
        let output_dir = self.task.output_dir();
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| Error::io(&output_dir, e))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env(ENV_OVERRIDE, self.task.environment.to_string());
        if let Some(port) = self.port().await? {
            command.env(PORT_ENV, port.to_string());
        }
        Ok((command, program.clone()))
    }
}

/// Adds `<output>.map` files written next to reported outputs.
fn with_source_maps(mut outcome: BuildOutcome) -> BuildOutcome {
    let maps: Vec<PathBuf> = outcome
        .outputs
        .iter()
        .map(|output| {
            let mut map = output.clone().into_os_string();
            map.push(".map");
            PathBuf::from(map)
        })
        .filter(|map| map.exists() && !outcome.outputs.contains(map))
        .collect();
    outcome.outputs.extend(maps);
    outcome
}

#[async_trait]
impl Job for ExecJob {
    #[instrument(skip(self), fields(task = %self.task.task))]
    async fn run(&self) -> Result<BuildOutcome> {
        let (command, program) = self.command(&self.argv).await?;
        let run = run_tool(command, &program, None).await?;
        let output = self.task.output_path();
        Ok(with_source_maps(run.into_outcome(&program, Some(&output))))
    }

    fn watch_mode(&self) -> WatchMode {
        if self.watch_argv.is_some() && self.task.watching {
            WatchMode::Native
        } else {
            WatchMode::Engine
        }
    }

    async fn watch(&self, events: EventSink) -> Result<Box<dyn WatchHandle>> {
        let argv = self.watch_argv.as_deref().unwrap_or(&self.argv);
        let (mut command, program) = self.command(argv).await?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| Error::Process {
            program: program.clone(),
            message: e.to_string(),
        })?;
        info!(target: "kiln", task = %self.task.task, program = %program, "started watch process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let name = program.clone();
        let reader = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let name = name.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(program = %name, "{line}");
                    }
                });
            }
            let Some(stdout) = stdout else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match WireMessage::parse(&line) {
                    Some(message) => {
                        if events.send(message.into_event()).is_err() {
                            return;
                        }
                    }
                    None => debug!(program = %name, "{line}"),
                }
            }
            let _ = events.send(BackendEvent::Fatal(format!(
                "watch process '{name}' exited"
            )));
        });

        Ok(Box::new(ExecWatchHandle {
            program,
            child,
            reader,
        }))
    }
}

#[derive(Debug)]
struct ExecWatchHandle {
    program: String,
    child: Child,
    reader: JoinHandle<()>,
}

#[async_trait]
impl WatchHandle for ExecWatchHandle {
    async fn stop(mut self: Box<Self>) -> Result<()> {
        self.reader.abort();
        if let Err(e) = self.child.kill().await {
            warn!(program = %self.program, error = %e, "failed to kill watch process");
        }
        debug!(program = %self.program, "watch process stopped");
        Ok(())
    }
}
