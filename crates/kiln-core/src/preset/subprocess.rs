use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::backend::{Backend, BuildOutcome, Job, TaskDefinition};
use crate::commands::{CommandHandler, CommandTable};
use crate::config::ConfigFragment;
use crate::constants::ENV_OVERRIDE;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::preset::{Capability, Preset};
use crate::protocol::{run_tool, BuildRequest};
use crate::resolver::RunnerTable;

/// What an external preset binary prints for `--discover`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PresetManifest {
    pub default_config: toml::Table,
    /// Category to the runner ids offered for it.
    pub runners: BTreeMap<String, Vec<String>>,
    /// Command name to description.
    pub commands: BTreeMap<String, String>,
}

/// A preset that delegates to an external binary via JSON over stdio.
#[derive(Debug)]
pub struct SubprocessPreset {
    name: String,
    binary_path: PathBuf,
    manifest: PresetManifest,
}

impl SubprocessPreset {
    pub fn new(name: String, binary_path: PathBuf, manifest: PresetManifest) -> Self {
        Self {
            name,
            binary_path,
            manifest,
        }
    }

    /// Runs `<binary> --discover` and reads the manifest from its stdout.
    #[instrument(skip(binary_path))]
    pub fn discover(name: &str, binary_path: &Path) -> Result<Self> {
        let program = binary_path.display().to_string();
        let output = StdCommand::new(binary_path)
            .arg("--discover")
            .output()
            .map_err(|e| Error::Process {
                program: program.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Process {
                program,
                message: format!("--discover exited with {}", output.status),
            });
        }
        let manifest: PresetManifest =
            serde_json::from_slice(&output.stdout).map_err(|e| Error::Process {
                program,
                message: format!("invalid manifest: {e}"),
            })?;
        debug!(
            runners = manifest.runners.len(),
            commands = manifest.commands.len(),
            "discovered subprocess preset"
        );
        Ok(Self::new(
            name.to_string(),
            binary_path.to_path_buf(),
            manifest,
        ))
    }

    pub fn manifest(&self) -> &PresetManifest {
        &self.manifest
    }
}

impl Preset for SubprocessPreset {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> HashSet<Capability> {
        let mut capabilities = HashSet::new();
        if !self.manifest.default_config.is_empty() {
            capabilities.insert(Capability::DefaultConfig);
        }
        if !self.manifest.runners.is_empty() {
            capabilities.insert(Capability::BundleCreator);
        }
        if !self.manifest.commands.is_empty() {
            capabilities.insert(Capability::Commands);
        }
        capabilities
    }

    fn default_config(&self) -> ConfigFragment {
        ConfigFragment::from_table(self.manifest.default_config.clone())
    }

    fn bundle_creator(&self, _ctx: &BuildContext, runners: &mut RunnerTable) {
        for (category, offered) in &self.manifest.runners {
            for runner in offered {
                let backend = SubprocessBackend {
                    runner: runner.clone(),
                    binary_path: self.binary_path.clone(),
                };
                runners.add(category, runner, Arc::new(backend));
            }
        }
    }

    fn commands(&self, _ctx: &BuildContext, commands: &mut CommandTable) {
        for (name, description) in &self.manifest.commands {
            commands.add(
                name,
                description,
                Arc::new(SubprocessCommand {
                    name: name.clone(),
                    binary_path: self.binary_path.clone(),
                }),
            );
        }
    }
}

#[derive(Debug)]
struct SubprocessBackend {
    runner: String,
    binary_path: PathBuf,
}

impl Backend for SubprocessBackend {
    fn name(&self) -> &str {
        &self.runner
    }

    fn prepare(&self, _ctx: &BuildContext, task: TaskDefinition) -> Result<Arc<dyn Job>> {
        let bundle = serde_json::to_value(task.bundle.as_ref()).map_err(|e| {
            Error::InvalidBundle {
                bundle: task.bundle.name.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Arc::new(SubprocessJob {
            binary_path: self.binary_path.clone(),
            request: BuildRequest {
                task: task.task.clone(),
                runner: task.runner.clone(),
                bundle,
                destination: task.output_dir(),
                environment: task.environment,
                watching: task.watching,
            },
        }))
    }
}

/// One `--build` invocation per run; the binary answers with wire messages.
#[derive(Debug)]
struct SubprocessJob {
    binary_path: PathBuf,
    request: BuildRequest,
}

#[async_trait]
impl Job for SubprocessJob {
    async fn run(&self) -> Result<BuildOutcome> {
        let program = self.binary_path.display().to_string();
        let input = serde_json::to_string(&self.request).map_err(|e| Error::Process {
            program: program.clone(),
            message: e.to_string(),
        })?;
        let mut command = Command::new(&self.binary_path);
        command.arg("--build");
        let run = run_tool(command, &program, Some(input)).await?;
        Ok(run.into_outcome(&program, None))
    }
}

#[derive(Debug)]
struct SubprocessCommand {
    name: String,
    binary_path: PathBuf,
}

#[async_trait]
impl CommandHandler for SubprocessCommand {
    async fn run(&self, ctx: &BuildContext, args: &[String]) -> Result<()> {
        let program = self.binary_path.display().to_string();
        let status = Command::new(&self.binary_path)
            .arg("--command")
            .arg(&self.name)
            .args(args)
            .env(ENV_OVERRIDE, ctx.environment().to_string())
            .status()
            .await
            .map_err(|e| Error::Process {
                program: program.clone(),
                message: e.to_string(),
            })?;
        if !status.success() {
            return Err(Error::Process {
                program,
                message: format!("command '{}' exited with {status}", self.name),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use crate::config::Environment;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn create_mock_preset(dir: &TempDir) -> PathBuf {
        let script_path = dir.path().join("kiln-preset-mock");
        let script_content = r#"#!/usr/bin/env python3
import sys
import json

if "--discover" in sys.argv:
    print(json.dumps({
        "default_config": {"mock": {"enabled": True}},
        "runners": {"js": ["mock"]},
        "commands": {"hello": "Prints a greeting"},
    }))
elif "--build" in sys.argv:
    request = json.loads(sys.stdin.read())
    print("plain tool output")
    print(json.dumps({"type": "start"}))
    if request["bundle"]["name"] == "broken":
        print(json.dumps({"type": "diagnostic", "severity": "error", "message": "syntax error"}))
        print(json.dumps({"type": "result", "succeeded": False}))
    elif request["bundle"]["name"] == "silent":
        pass
    else:
        print(json.dumps({"type": "diagnostic", "severity": "warning", "message": "unused"}))
        out = request["destination"] + "/" + request["bundle"]["destination"]
        print(json.dumps({"type": "result", "succeeded": True, "outputs": [out]}))
else:
    sys.exit(2)
"#;
        fs::write(&script_path, script_content).unwrap();

        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();

        script_path
    }

    fn job(binary_path: PathBuf, bundle: &str) -> SubprocessJob {
        let bundle = Bundle::new("js", bundle, vec!["js/app.js".to_string()]);
        SubprocessJob {
            binary_path,
            request: BuildRequest {
                task: bundle.task_name.clone(),
                runner: "mock".to_string(),
                bundle: serde_json::to_value(&bundle).unwrap(),
                destination: PathBuf::from("dist/js"),
                environment: Environment::Development,
                watching: false,
            },
        }
    }

    #[test]
    fn discover_reads_manifest_and_derives_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let preset = SubprocessPreset::discover("mock", &create_mock_preset(&dir)).unwrap();

        assert_eq!(preset.name(), "mock");
        assert_eq!(
            preset.capabilities(),
            HashSet::from([
                Capability::DefaultConfig,
                Capability::BundleCreator,
                Capability::Commands,
            ])
        );
        assert_eq!(preset.manifest().runners["js"], vec!["mock".to_string()]);
        assert!(preset.default_config().values().contains_key("mock"));
    }

    #[test]
    fn discover_fails_for_missing_binary() {
        let err = SubprocessPreset::discover("ghost", Path::new("/nonexistent/kiln-preset-ghost"))
            .unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
    }

    #[tokio::test]
    async fn build_collects_diagnostics_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = job(create_mock_preset(&dir), "app").run().await.unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.outputs, vec![PathBuf::from("dist/js/app")]);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].message, "unused");
    }

    #[tokio::test]
    async fn build_reports_failure_from_error_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = job(create_mock_preset(&dir), "broken").run().await.unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(outcome.failure_message(), "syntax error");
    }

    #[tokio::test]
    async fn build_without_result_line_fails() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = job(create_mock_preset(&dir), "silent").run().await.unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(
            outcome.failure_message(),
            "tool exited without reporting a result"
        );
    }
}
