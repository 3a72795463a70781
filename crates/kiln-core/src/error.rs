//! Error types shared by every kiln component.
//!
//! Errors fall into three families: configuration errors are raised while the
//! task graph is constructed, compilation errors travel through a task's own
//! failure channel, and infrastructure errors (ports, filesystem, watchers)
//! surface immediately.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// The family an [`Error`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misconfiguration detected before any task runs.
    Configuration,
    /// A backend reported a failed build.
    Compilation,
    /// The environment could not provide a resource.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Preset cycle detected: {}", .0.join(" -> "))]
    PresetCycle(Vec<String>),

    #[error("unknown preset '{0}'")]
    UnknownPreset(String),

    #[error(
        "Invalid runner '{runner}' for '{bundle}'. Has to be one of [{}].",
        quote_list(.candidates)
    )]
    InvalidRunner {
        runner: String,
        bundle: String,
        candidates: Vec<String>,
    },

    #[error(
        "More than one valid runner exists for '{bundle}'. Has to be one of [{}].",
        quote_list(.candidates)
    )]
    AmbiguousRunner {
        bundle: String,
        candidates: Vec<String>,
    },

    #[error(
        "You have multiple runners, please specify a runner for '{bundle}'. Available runners are [{}].",
        quote_list(.candidates)
    )]
    MultipleRunners {
        bundle: String,
        candidates: Vec<String>,
    },

    #[error("No runner available for '{bundle}' in category '{category}'.")]
    NoRunner { bundle: String, category: String },

    #[error("Failed registering '{preset}' a task with this name already exists")]
    DuplicateTask { preset: String, task: String },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid bundle '{bundle}': {reason}")]
    InvalidBundle { bundle: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration '{}': {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid pipeline entry '{name}': {reason}")]
    Plugin { name: String, reason: String },

    #[error("task '{0}' does not support watch mode")]
    WatchUnsupported(String),

    #[error("task '{task}' failed: {message}")]
    Compilation { task: String, message: String },

    #[error("no free port available in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("io error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("external process '{program}' failed: {message}")]
    Process { program: String, message: String },
}

impl Error {
    /// Classifies the error into the taxonomy used for propagation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Compilation { .. } => ErrorKind::Compilation,
            Self::NoFreePort { .. } | Self::Io { .. } | Self::Watcher(_) | Self::Process { .. } => {
                ErrorKind::Infrastructure
            }
            _ => ErrorKind::Configuration,
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn compilation(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compilation {
            task: task.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Renders `['a', 'b']`-style candidate lists (without the brackets).
pub(crate) fn quote_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("'{item}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_messages_quote_every_candidate() {
        let err = Error::AmbiguousRunner {
            bundle: "myBundle".to_string(),
            candidates: vec!["gulp/babel".to_string(), "gulp/typescript".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "More than one valid runner exists for 'myBundle'. Has to be one of ['gulp/babel', 'gulp/typescript']."
        );
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            Error::UnknownTask("x".to_string()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::compilation("js_app", "boom").kind(),
            ErrorKind::Compilation
        );
        assert_eq!(
            Error::NoFreePort {
                start: 3000,
                end: 3010
            }
            .kind(),
            ErrorKind::Infrastructure
        );
    }
}
