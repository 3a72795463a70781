//! Warning/error batches and the reporters they are flushed to.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One warning or error reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            ..Self::warning(message)
        }
    }

    pub fn at(mut self, file: impl Into<PathBuf>, line: Option<usize>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}", file.display())?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
                if let Some(column) = self.column {
                    write!(f, ":{column}")?;
                }
            }
            write!(f, ": ")?;
        }
        f.write_str(&self.message)
    }
}

/// Receives flushed batches. Implementations must treat one call as one
/// atomic unit of output.
pub trait Reporter: Send + Sync + std::fmt::Debug {
    fn report(&self, task: &str, diagnostics: &[Diagnostic]);

    /// Lifecycle messages (`Compiling...`, `Finished ...`).
    fn status(&self, task: &str, message: &str) {
        info!(target: "kiln", task = %task, "{message}");
    }
}

/// Diagnostics accumulated by one task execution or one watch cycle.
///
/// A batch is owned by a single task and flushed exactly once, warnings
/// first, then errors.
#[derive(Debug)]
pub struct DiagnosticBatch {
    task: String,
    items: Vec<Diagnostic>,
}

impl DiagnosticBatch {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            items: Vec::new(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.items.extend(diagnostics);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.items.iter().find(|d| d.is_error())
    }

    /// Hands the whole batch to `reporter` in one call and empties it.
    pub fn flush(&mut self, reporter: &dyn Reporter) {
        if self.items.is_empty() {
            return;
        }
        let (mut ordered, errors): (Vec<_>, Vec<_>) =
            self.items.drain(..).partition(|d| !d.is_error());
        ordered.extend(errors);
        reporter.report(&self.task, &ordered);
    }
}

/// Writes batches as tracing events, one lock per batch so concurrent tasks
/// never interleave their diagnostics.
#[derive(Debug, Default)]
pub struct LogReporter {
    lock: Mutex<()>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for LogReporter {
    fn report(&self, task: &str, diagnostics: &[Diagnostic]) {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for diagnostic in diagnostics {
            match diagnostic.severity {
                Severity::Warning => warn!(target: "kiln", task = %task, "{diagnostic}"),
                Severity::Error => error!(target: "kiln", task = %task, "{diagnostic}"),
            }
        }
    }
}

/// Keeps every flushed batch in memory. Used by tests and by callers that
/// want to render diagnostics themselves.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    batches: Mutex<Vec<(String, Vec<Diagnostic>)>>,
    statuses: Mutex<Vec<(String, String)>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(String, Vec<Diagnostic>)> {
        self.batches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<(String, String)> {
        self.statuses
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, task: &str, diagnostics: &[Diagnostic]) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push((task.to_string(), diagnostics.to_vec()));
        }
    }

    fn status(&self, task: &str, message: &str) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push((task.to_string(), message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_orders_warnings_before_errors_and_empties_batch() {
        let reporter = MemoryReporter::new();
        let mut batch = DiagnosticBatch::new("js_app");
        batch.push(Diagnostic::error("syntax error"));
        batch.push(Diagnostic::warning("unused variable"));
        batch.push(Diagnostic::warning("deprecated api"));

        batch.flush(&reporter);
        batch.flush(&reporter);

        let batches = reporter.batches();
        assert_eq!(batches.len(), 1, "second flush of an empty batch is a no-op");
        let messages: Vec<_> = batches[0].1.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["unused variable", "deprecated api", "syntax error"]);
        assert!(batch.is_empty());
    }

    #[test]
    fn displays_location_when_known() {
        let diagnostic = Diagnostic::warning("missing semicolon").at("js/app.js", Some(3));
        assert_eq!(diagnostic.to_string(), "js/app.js:3: missing semicolon");
    }

    #[test]
    fn deserializes_wire_format() {
        let diagnostic: Diagnostic =
            serde_json::from_str(r#"{"severity":"error","message":"boom"}"#).unwrap();
        assert!(diagnostic.is_error());
        assert_eq!(diagnostic.file, None);
    }
}
