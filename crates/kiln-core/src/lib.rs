//! Core logic of the Kiln build orchestrator.
//!
//! Presets contribute configuration, runners, pipeline plugins, commands and
//! tasks through declared capabilities. This crate composes them into one
//! task graph per invocation and drives it once or in watch mode.

pub mod backend;
pub mod bundle;
pub mod commands;
pub mod config;
pub mod constants;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod pipeline;
pub mod port;
pub mod preset;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod test_runner;
pub mod watch;

pub use backend::{Backend, BuildOutcome, Concurrency, Job, TaskDefinition, WatchHandle, WatchMode};
pub use bundle::Bundle;
pub use commands::{BuiltinCommand, CommandAction, CommandHandler, CommandSpec, CommandTable};
pub use config::{Config, ConfigFragment, Environment, ProjectConfig};
pub use context::{BuildContext, BuildOptions};
pub use diagnostics::{Diagnostic, DiagnosticBatch, LogReporter, MemoryReporter, Reporter, Severity};
pub use error::{Error, ErrorKind, Result};
pub use graph::{TaskGraph, TaskKind, TaskRegistrar, TaskState};
pub use orchestrator::Orchestrator;
pub use pipeline::{PipelineBuilder, PipelineSlot, PluginContribution};
pub use port::PortAllocator;
pub use preset::subprocess::{PresetManifest, SubprocessPreset};
pub use preset::{Capability, Preset};
pub use registry::PresetRegistry;
pub use resolver::{RunnerCandidate, RunnerTable};
pub use test_runner::TestOptions;
pub use watch::{BackendEvent, EventSink, TaskEvent, WatchEvent, WatchSession};
