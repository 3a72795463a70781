use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;

use kiln_core::constants::{CONFIG_FILE, DEFAULT_TASK};
use kiln_core::{
    BuildOptions, BuiltinCommand, CommandAction, Environment, Orchestrator, ProjectConfig,
};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod discovery;
mod executor;
mod styles;

use styles as s;

/// The command-line interface for Kiln.
#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(version)]
#[command(styles = s::get_clap_styles())]
#[command(
    help_template = "{bin} {version}\n\n{about-with-newline}{usage-heading} {usage}\n\n{all-args}{after-help}"
)]
#[command(about = "Preset-driven asset build orchestrator")]
#[command(
    long_about = "Kiln composes presets into one build: presets contribute configuration,
runners, pipeline plugins, commands and tasks, and kiln turns the bundles of
kiln.toml into a task graph (bundle -> category -> default).

Builtin Commands:
  run [task]        Run a task once (default: `default`)
  watch             Rebuild bundles whenever their sources change
  test [patterns]   Run the test runner configured by the loaded presets
  tasks             List registered tasks in registration order
"
)]
#[command(
    after_help = "\x1b[1;32mExamples:\x1b[0m\n  \x1b[36mkiln run\x1b[0m                  \x1b[2m# Build everything\x1b[0m\n  \x1b[36mkiln run js_app\x1b[0m           \x1b[2m# Build a single bundle\x1b[0m\n  \x1b[36mkiln watch\x1b[0m                \x1b[2m# Rebuild on change\x1b[0m\n  \x1b[36mkiln --preset copy run\x1b[0m    \x1b[2m# Ignore the preset list of kiln.toml\x1b[0m"
)]
pub(crate) struct Cli {
    /// Command to run: `run`, `watch`, `test`, `tasks` or a preset command
    command: Option<String>,
    /// Arguments for the command (task name, test patterns, ...)
    args: Vec<String>,
    /// Path to the kiln config file.
    #[arg(long, default_value = CONFIG_FILE)]
    config: String,
    /// Preset to load; repeat to load several. Replaces `presets` of the config file.
    #[arg(long = "preset")]
    presets: Vec<String>,
    /// Do not read the config file.
    #[arg(long, default_value_t = false)]
    ignore_config: bool,
    /// Forwarded to presets as the `no-cache` flag.
    #[arg(long, default_value_t = false)]
    no_cache: bool,
    /// Build environment (`production` or `development`).
    #[arg(long)]
    environment: Option<Environment>,
    /// Log at debug level.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    debug!("parsed cli arguments: {:?}", cli);

    let Some(command_name) = cli.command.as_deref() else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let project = load_project(&cli)?;
    let preset_names = preset_names(&cli, project.as_ref())?;
    let presets = discovery::resolve_presets(&preset_names)?;

    let options = BuildOptions {
        watching: command_name == BuiltinCommand::Watch.as_str(),
        environment: cli.environment,
        flags: cli
            .no_cache
            .then(|| "no-cache".to_string())
            .into_iter()
            .collect(),
        ..BuildOptions::default()
    };
    let orchestrator = Orchestrator::new(presets, project.as_ref(), options)
        .context("unable to construct the build graph")?;

    execute(&orchestrator, command_name, &cli.args).await
}

/// Reads the config file. A missing file is only an error when it was named
/// explicitly.
fn load_project(cli: &Cli) -> Result<Option<ProjectConfig>> {
    if cli.ignore_config {
        return Ok(None);
    }
    let path = Path::new(&cli.config);
    if !path.exists() && cli.config == CONFIG_FILE {
        debug!("no {} found, continuing without project config", CONFIG_FILE);
        return Ok(None);
    }
    let project = ProjectConfig::load_from_file(path)
        .with_context(|| format!("unable to load config '{}'", cli.config))?;
    Ok(Some(project))
}

fn preset_names(cli: &Cli, project: Option<&ProjectConfig>) -> Result<Vec<String>> {
    let names = if cli.presets.is_empty() {
        project.map(|p| p.presets.clone()).unwrap_or_default()
    } else {
        cli.presets.clone()
    };
    if names.is_empty() {
        bail!("no presets to load: list them under `presets` in {CONFIG_FILE} or pass --preset");
    }
    Ok(names)
}

/// Dispatches a builtin or preset command.
async fn execute(orchestrator: &Orchestrator, name: &str, args: &[String]) -> Result<()> {
    let commands = orchestrator.commands();
    let spec = commands.lookup(name)?;

    match &spec.action {
        CommandAction::Builtin(BuiltinCommand::Run) => {
            let task = args.first().map(String::as_str).unwrap_or(DEFAULT_TASK);
            executor::run(orchestrator, task).await
        }
        CommandAction::Builtin(BuiltinCommand::Watch) => executor::watch(orchestrator).await,
        CommandAction::Builtin(BuiltinCommand::Test) => {
            let cwd = std::env::current_dir().context("unable to read working directory")?;
            orchestrator
                .test(&cwd, args)
                .await
                .context("tests failed")
        }
        CommandAction::Builtin(BuiltinCommand::Tasks) => {
            for task in orchestrator.graph().tasks() {
                println!(
                    "{}{}{} {}({}){}",
                    s::NAME,
                    task.name(),
                    s::NAME.render_reset(),
                    s::DESC,
                    task.owner(),
                    s::DESC.render_reset()
                );
            }
            Ok(())
        }
        CommandAction::Preset(handler) => {
            debug!(command = %spec.name, owner = ?spec.owner, "running preset command");
            handler
                .run(orchestrator.context(), args)
                .await
                .with_context(|| format!("command '{}' failed", spec.name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cli(config: &str) -> Cli {
        Cli {
            command: Some("run".to_string()),
            args: Vec::new(),
            config: config.to_string(),
            presets: Vec::new(),
            ignore_config: false,
            no_cache: false,
            environment: None,
            verbose: false,
        }
    }

    #[test]
    fn preset_flags_replace_config_presets() {
        let mut cli = test_cli(CONFIG_FILE);
        cli.presets = vec!["copy".to_string()];
        let project = ProjectConfig {
            presets: vec!["exec".to_string()],
            ..ProjectConfig::default()
        };

        assert_eq!(preset_names(&cli, Some(&project)).unwrap(), vec!["copy"]);
        cli.presets.clear();
        assert_eq!(preset_names(&cli, Some(&project)).unwrap(), vec!["exec"]);
        assert!(preset_names(&cli, None).is_err());
    }

    #[test]
    fn missing_default_config_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = test_cli(dir.path().join(CONFIG_FILE).to_str().unwrap());
        assert!(load_project(&cli).is_err(), "explicit path must exist");

        let mut cli = test_cli(CONFIG_FILE);
        cli.ignore_config = true;
        assert!(load_project(&cli).unwrap().is_none());
    }

    #[tokio::test]
    async fn tasks_command_lists_without_building() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            format!(
                "presets = [\"copy\"]\n\n[images.images]\nsource = \"{}/images/**\"\n",
                dir.path().display()
            ),
        )
        .unwrap();

        let cli = test_cli(path.to_str().unwrap());
        let project = load_project(&cli).unwrap();
        let names = preset_names(&cli, project.as_ref()).unwrap();
        let presets = discovery::resolve_presets(&names).unwrap();
        let orchestrator =
            Orchestrator::new(presets, project.as_ref(), BuildOptions::default()).unwrap();

        execute(&orchestrator, "tasks", &[]).await.unwrap();
        let err = execute(&orchestrator, "deploy", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown command 'deploy'");
    }
}
