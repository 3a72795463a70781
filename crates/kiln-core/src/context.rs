use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, Environment, WatchSettings};
use crate::diagnostics::{LogReporter, Reporter};
use crate::error::Result;
use crate::port::PortAllocator;
use crate::registry::PresetRegistry;

/// Invocation-level settings decided by the caller (usually the CLI).
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub watching: bool,
    /// Overrides the configured environment when set.
    pub environment: Option<Environment>,
    /// Raw flags forwarded to presets (`no-cache`, ...). Never interpreted by the core.
    pub flags: Vec<String>,
    pub reporter: Arc<dyn Reporter>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            watching: false,
            environment: None,
            flags: Vec::new(),
            reporter: Arc::new(LogReporter::new()),
        }
    }
}

/// Everything one build invocation shares with presets and backends.
///
/// Created once per invocation and read-only afterwards, so it can be shared
/// across every concurrently running bundle build.
#[derive(Debug)]
pub struct BuildContext {
    registry: PresetRegistry,
    config: Arc<Config>,
    environment: Environment,
    watch: WatchSettings,
    ports: Arc<PortAllocator>,
    options: BuildOptions,
}

impl BuildContext {
    pub fn new(registry: PresetRegistry, config: Config, options: BuildOptions) -> Result<Self> {
        let environment = match options.environment {
            Some(environment) => environment,
            None => config.environment()?,
        };
        let watch = config.watch_settings()?;
        Ok(Self {
            registry,
            config: Arc::new(config),
            environment,
            watch,
            ports: Arc::new(PortAllocator::new(watch.port_base)),
            options,
        })
    }

    pub fn registry(&self) -> &PresetRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn is_watching(&self) -> bool {
        self.options.watching
    }

    pub fn watch_settings(&self) -> WatchSettings {
        self.watch
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.options.reporter
    }

    pub fn destination(&self) -> PathBuf {
        self.config.destination()
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.options.flags.iter().any(|f| f == flag)
    }

    pub fn flags(&self) -> &[String] {
        &self.options.flags
    }

    /// Whether a preset with this name is part of the build.
    pub fn is_loaded(&self, preset: &str) -> bool {
        self.registry.is_loaded(preset)
    }
}
