use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::bundle::Bundle;
use crate::commands::CommandTable;
use crate::config::ConfigFragment;
use crate::context::BuildContext;
use crate::error::Result;
use crate::graph::TaskRegistrar;
use crate::pipeline::PipelineSlot;
use crate::resolver::RunnerTable;
use crate::test_runner::TestOptions;

pub mod subprocess;

/// A function a preset may implement. Presets declare the capabilities they
/// implement; the registry only calls the matching [`Preset`] method on
/// presets that declared it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    DefaultConfig,
    Commands,
    BundleCreator,
    /// Contributes plugins to the pipeline of the named backend.
    Pipeline(String),
    Test,
    Tasks,
}

impl Capability {
    pub fn pipeline(backend: &str) -> Self {
        Self::Pipeline(backend.to_string())
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DefaultConfig => f.write_str("defaultConfig"),
            Self::Commands => f.write_str("commands"),
            Self::BundleCreator => f.write_str("bundleCreator"),
            Self::Pipeline(backend) => write!(f, "pipeline:{backend}"),
            Self::Test => f.write_str("test"),
            Self::Tasks => f.write_str("tasks"),
        }
    }
}

/// A contract for all presets composed into a build.
///
/// Every method has a no-op default; a preset overrides the ones matching the
/// capabilities it declares. Accumulators are shared across the presets of one
/// capability invocation and extended in place, in load order.
pub trait Preset: Send + Sync + std::fmt::Debug {
    /// Unique name of the preset.
    fn name(&self) -> &str;

    /// The set of capabilities this preset implements.
    fn capabilities(&self) -> HashSet<Capability>;

    /// Presets that must be loaded before this one.
    fn presets(&self) -> Vec<Arc<dyn Preset>> {
        Vec::new()
    }

    fn default_config(&self) -> ConfigFragment {
        ConfigFragment::new()
    }

    fn commands(&self, _ctx: &BuildContext, _commands: &mut CommandTable) {}

    /// Offers runners (backend hooks) per bundle category.
    fn bundle_creator(&self, _ctx: &BuildContext, _runners: &mut RunnerTable) {}

    /// Extends the pipeline of the backend named by `slot.backend()`.
    fn pipeline(&self, _ctx: &BuildContext, _bundle: &Bundle, _slot: &mut PipelineSlot<'_>) {}

    fn test(&self, _ctx: &BuildContext, _options: &mut TestOptions) {}

    /// Registers tasks that are not derived from bundles.
    fn tasks(&self, _ctx: &BuildContext, _tasks: &mut TaskRegistrar<'_>) -> Result<()> {
        Ok(())
    }
}
