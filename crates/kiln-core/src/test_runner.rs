//! `kiln test`: presets describe the test runner, the core writes its
//! configuration file and runs it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::constants::TEST_CONFIG_FILE;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::preset::Capability;

/// Options accumulated across every preset implementing `test`.
///
/// The serialized form is the configuration file handed to the runner; the
/// program, arguments and environment only drive the process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOptions {
    #[serde(skip)]
    pub program: Option<String>,
    #[serde(skip)]
    pub args: Vec<String>,
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
    pub module_directories: Vec<String>,
    pub module_file_extensions: Vec<String>,
    pub roots: Vec<PathBuf>,
    pub test_path_ignore_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_regex: Option<String>,
    pub transform: BTreeMap<String, String>,
    pub bail: bool,
}

impl TestOptions {
    pub fn new(cwd: &Path, destination: &Path) -> Self {
        Self {
            program: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            module_directories: Vec::new(),
            module_file_extensions: vec!["js".to_string(), "json".to_string()],
            roots: vec![cwd.to_path_buf()],
            test_path_ignore_patterns: vec![
                "/node_modules/".to_string(),
                destination.display().to_string(),
            ],
            test_regex: None,
            transform: BTreeMap::new(),
            bail: true,
        }
    }

    pub fn add_extension(&mut self, extension: &str) {
        if !self.module_file_extensions.iter().any(|e| e == extension) {
            self.module_file_extensions.push(extension.to_string());
        }
    }

    pub fn add_module_directory(&mut self, directory: &str) {
        if !self.module_directories.iter().any(|d| d == directory) {
            self.module_directories.push(directory.to_string());
        }
    }
}

/// Joins positional patterns into one regex, escaping dots.
pub fn pattern_regex(patterns: &[String]) -> Option<String> {
    if patterns.is_empty() {
        return None;
    }
    Some(patterns.join("|").replace('.', "\\."))
}

/// Matches `__tests__` folders and `*.test.<ext>`/`*.spec.<ext>` files for
/// every extension except `json`.
pub fn default_regex(extensions: &[String]) -> String {
    let extensions: Vec<&str> = extensions
        .iter()
        .map(String::as_str)
        .filter(|e| *e != "json")
        .collect();
    format!(
        "(/__tests__/.*|(\\.|/)(test|spec))\\.({})$",
        extensions.join("|")
    )
}

/// Runs the `test` capability of every preset over fresh options.
pub fn assemble_test_options(ctx: &BuildContext, cwd: &Path, patterns: &[String]) -> TestOptions {
    let mut options = TestOptions::new(cwd, &ctx.destination());
    options.test_regex = pattern_regex(patterns);

    for preset in ctx.registry().implementations(&Capability::Test) {
        debug!(preset = preset.name(), "extending test options");
        preset.test(ctx, &mut options);
    }

    if options.test_regex.is_none() {
        options.test_regex = Some(default_regex(&options.module_file_extensions));
    }
    options
}

/// Removes the generated configuration file however the run ends.
struct ConfigFileGuard(PathBuf);

impl Drop for ConfigFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            warn!(path = %self.0.display(), error = %e, "failed to remove test configuration");
        }
    }
}

/// Writes the options next to the project and runs the configured program
/// with `--config <file>`.
///
/// # Errors
/// Fails when no preset configured a program, when the file cannot be
/// written, or when the runner exits non-zero.
#[instrument(skip(ctx))]
pub async fn run_tests(ctx: &BuildContext, cwd: &Path, patterns: &[String]) -> Result<()> {
    let options = assemble_test_options(ctx, cwd, patterns);
    let Some(program) = options.program.clone() else {
        return Err(Error::InvalidConfig(
            "no loaded preset provides a test runner".to_string(),
        ));
    };

    let file = cwd.join(TEST_CONFIG_FILE);
    let contents = serde_json::to_string_pretty(&options)
        .map_err(|e| Error::InvalidConfig(format!("test options: {e}")))?;
    tokio::fs::write(&file, format!("{contents}\n"))
        .await
        .map_err(|e| Error::io(&file, e))?;
    let _guard = ConfigFileGuard(file.clone());

    info!(target: "kiln", program = %program, "running tests");
    let status = Command::new(&program)
        .args(&options.args)
        .arg("--config")
        .arg(&file)
        .envs(&options.env)
        .current_dir(cwd)
        .status()
        .await
        .map_err(|e| Error::Process {
            program: program.clone(),
            message: e.to_string(),
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::compilation(
            "test",
            format!("'{program}' exited with {status}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_become_escaped_alternatives() {
        let regex = pattern_regex(&["src/a.test.js".to_string(), "lib/b.js".to_string()]);
        assert_eq!(regex.as_deref(), Some("src/a\\.test\\.js|lib/b\\.js"));
        assert_eq!(pattern_regex(&[]), None);
    }

    #[test]
    fn default_regex_skips_json() {
        let regex = default_regex(&["js".to_string(), "json".to_string(), "ts".to_string()]);
        assert_eq!(regex, "(/__tests__/.*|(\\.|/)(test|spec))\\.(js|ts)$");
    }

    #[test]
    fn serializes_camel_case_without_process_fields() {
        let mut options = TestOptions::new(Path::new("/work"), Path::new("dist"));
        options.program = Some("jest".to_string());
        options.add_extension("ts");
        options.add_extension("ts");

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["moduleFileExtensions"], serde_json::json!(["js", "json", "ts"]));
        assert_eq!(json["testPathIgnorePatterns"][1], "dist");
        assert!(json.get("program").is_none());
        assert!(json.get("testRegex").is_none());
    }
}
