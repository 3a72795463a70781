//! JSON-lines messages exchanged with external build tools.
//!
//! A tool writes one JSON object per line on stdout:
//!
//! ```text
//! {"type":"start"}
//! {"type":"diagnostic","severity":"warning","message":"unused import","file":"js/app.js","line":3}
//! {"type":"result","succeeded":true,"outputs":["dist/js/app.js"]}
//! ```
//!
//! Lines that are not JSON objects are treated as plain tool output.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::backend::BuildOutcome;
use crate::config::Environment;
use crate::diagnostics::Diagnostic;
use crate::error::{Error, Result};
use crate::watch::BackendEvent;

/// stderr lines kept to explain a failed run.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// A build cycle started.
    Start,
    /// Sources changed; a rebuild is about to start.
    Invalidate,
    Diagnostic(Diagnostic),
    Result {
        succeeded: bool,
        #[serde(default)]
        outputs: Vec<PathBuf>,
    },
}

impl WireMessage {
    /// `None` for blank lines and for lines that are not wire messages.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// The watch event this message stands for.
    pub fn into_event(self) -> BackendEvent {
        match self {
            Self::Start | Self::Invalidate => BackendEvent::Invalidated,
            Self::Diagnostic(diagnostic) => BackendEvent::Diagnostic(diagnostic),
            Self::Result {
                succeeded,
                outputs,
            } => BackendEvent::Completed(BuildOutcome {
                succeeded,
                outputs,
                diagnostics: Vec::new(),
            }),
        }
    }
}

/// The request a subprocess preset reads from stdin for `--build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub task: String,
    pub runner: String,
    pub bundle: serde_json::Value,
    pub destination: PathBuf,
    pub environment: Environment,
    pub watching: bool,
}

/// Folds a stream of wire messages into one [`BuildOutcome`].
#[derive(Debug, Default)]
pub struct OutcomeCollector {
    diagnostics: Vec<Diagnostic>,
    result: Option<(bool, Vec<PathBuf>)>,
}

impl OutcomeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, message: WireMessage) {
        match message {
            WireMessage::Diagnostic(diagnostic) => self.diagnostics.push(diagnostic),
            WireMessage::Result {
                succeeded,
                outputs,
            } => self.result = Some((succeeded, outputs)),
            WireMessage::Start | WireMessage::Invalidate => {}
        }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Combines the reported result with the process exit status. A tool that
    /// exits non-zero or reports an error diagnostic never succeeds.
    ///
    /// Without a result line, `default_output` decides: tools that only write
    /// files succeed with it when it exists, `None` turns the missing line into
    /// a failure.
    pub fn finish(mut self, exited_ok: bool, default_output: Option<&Path>) -> BuildOutcome {
        let (reported, outputs) = match self.result.take() {
            Some(result) => result,
            None => match default_output {
                Some(path) if path.exists() => (true, vec![path.to_path_buf()]),
                Some(_) => (true, Vec::new()),
                None => {
                    self.push(Diagnostic::error("tool exited without reporting a result"));
                    (false, Vec::new())
                }
            },
        };
        let has_errors = self.has_errors();
        BuildOutcome {
            succeeded: reported && exited_ok && !has_errors,
            outputs,
            diagnostics: self.diagnostics,
        }
    }
}

/// A finished tool process.
#[derive(Debug)]
pub struct ToolRun {
    pub collector: OutcomeCollector,
    pub success: bool,
    pub stderr: Vec<String>,
}

impl ToolRun {
    /// A failed run without error diagnostics is explained by its stderr.
    pub fn into_outcome(mut self, program: &str, default_output: Option<&Path>) -> BuildOutcome {
        if !self.success && !self.collector.has_errors() {
            let message = if self.stderr.is_empty() {
                format!("'{program}' exited with a failure status")
            } else {
                self.stderr.join("\n")
            };
            self.collector.push(Diagnostic::error(message));
        }
        self.collector.finish(self.success, default_output)
    }
}

/// Spawns `command`, optionally writes `input` to its stdin, and folds its
/// stdout wire messages until it exits. The process is killed if the
/// returned future is dropped.
pub async fn run_tool(
    mut command: Command,
    program: &str,
    input: Option<String>,
) -> Result<ToolRun> {
    let process_error = |e: std::io::Error| Error::Process {
        program: program.to_string(),
        message: e.to_string(),
    };

    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(process_error)?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(process_error)?;
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let read_stdout = async {
        let mut collector = OutcomeCollector::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match WireMessage::parse(&line) {
                    Some(message) => collector.accept(message),
                    None if line.trim().is_empty() => {}
                    None => debug!(program, "{line}"),
                }
            }
        }
        Ok::<_, std::io::Error>(collector)
    };
    let read_stderr = async {
        let mut tail = Vec::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                debug!(program, "{line}");
                if tail.len() == STDERR_TAIL {
                    tail.remove(0);
                }
                tail.push(line);
            }
        }
        Ok::<_, std::io::Error>(tail)
    };

    let (collector, stderr) =
        tokio::try_join!(read_stdout, read_stderr).map_err(process_error)?;
    let status = child.wait().await.map_err(process_error)?;
    debug!(program, status = %status, "tool exited");
    Ok(ToolRun {
        collector,
        success: status.success(),
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;

    #[test]
    fn parses_diagnostic_lines() {
        let message = WireMessage::parse(
            r#"{"type":"diagnostic","severity":"warning","message":"unused","file":"a.js","line":3}"#,
        )
        .unwrap();
        let WireMessage::Diagnostic(diagnostic) = message else {
            panic!("expected a diagnostic, got {message:?}");
        };
        assert_eq!(diagnostic.severity, Severity::Warning);
        assert_eq!(diagnostic.line, Some(3));
    }

    #[test]
    fn ignores_plain_output() {
        assert_eq!(WireMessage::parse("compiled 3 modules"), None);
        assert_eq!(WireMessage::parse("   "), None);
        assert_eq!(WireMessage::parse(r#"{"type":"unknown"}"#), None);
    }

    #[test]
    fn error_diagnostic_fails_even_with_successful_result() {
        let mut collector = OutcomeCollector::new();
        collector.accept(WireMessage::Diagnostic(Diagnostic::error("boom")));
        collector.accept(WireMessage::Result {
            succeeded: true,
            outputs: vec![PathBuf::from("dist/js/app.js")],
        });

        let outcome = collector.finish(true, Some(Path::new("dist/js/app.js")));
        assert!(!outcome.succeeded);
        assert_eq!(outcome.outputs, vec![PathBuf::from("dist/js/app.js")]);
    }

    #[test]
    fn non_zero_exit_fails_without_result_line() {
        let collector = OutcomeCollector::new();
        let outcome = collector.finish(false, Some(Path::new("does/not/exist.js")));
        assert!(!outcome.succeeded);
        assert!(outcome.outputs.is_empty());
    }

    #[test]
    fn missing_result_line_fails_when_required() {
        let outcome = OutcomeCollector::new().finish(true, None);
        assert!(!outcome.succeeded);
        assert_eq!(
            outcome.failure_message(),
            "tool exited without reporting a result"
        );
    }
}
