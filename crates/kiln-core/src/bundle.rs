//! Bundles: named build targets read from the merged configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::{Table, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

/// One or several glob patterns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Patterns {
    One(String),
    Many(Vec<String>),
}

impl Patterns {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(pattern) => vec![pattern],
            Self::Many(patterns) => patterns,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BundleSpec {
    source: Option<Patterns>,
    destination: Option<String>,
    runner: Option<String>,
    format: Option<String>,
    #[serde(default)]
    externals: Vec<String>,
    watch: Option<Patterns>,
    directory: Option<String>,
    #[serde(flatten)]
    extra: Table,
}

/// A named build target. Read-only once collected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bundle {
    pub name: String,
    pub category: String,
    pub task_name: String,
    pub sources: Vec<String>,
    pub destination: String,
    pub runner: Option<String>,
    pub format: Option<String>,
    pub externals: Vec<String>,
    pub watch: Vec<String>,
    pub directory: Option<String>,
    /// Backend-specific keys the core does not interpret.
    pub extra: Table,
}

impl Bundle {
    /// Creates a bundle outside of configuration, mostly for presets and tests.
    pub fn new(category: &str, name: &str, sources: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            task_name: bundle_task_name(category, name),
            sources,
            destination: name.to_string(),
            runner: None,
            format: None,
            externals: Vec::new(),
            watch: Vec::new(),
            directory: None,
            extra: Table::new(),
        }
    }

    pub fn with_runner(mut self, runner: &str) -> Self {
        self.runner = Some(runner.to_string());
        self
    }

    /// Patterns that trigger a rebuild in watch mode.
    pub fn watch_patterns(&self) -> &[String] {
        if self.watch.is_empty() {
            &self.sources
        } else {
            &self.watch
        }
    }

    /// `<root>/<category>[/<directory>]`
    pub fn output_dir(&self, root: &Path) -> PathBuf {
        let dir = root.join(&self.category);
        match &self.directory {
            Some(sub) => dir.join(sub),
            None => dir,
        }
    }

    pub fn output_path(&self, root: &Path) -> PathBuf {
        self.output_dir(root).join(&self.destination)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

fn bundle_task_name(category: &str, name: &str) -> String {
    format!("{category}_{name}")
}

/// Splits a pattern into the directory before its first wildcard component
/// and the rest: `images/**/*.png` gives (`images`, `**/*.png`).
pub fn split_pattern(pattern: &str) -> (PathBuf, String) {
    let components: Vec<&str> = pattern.split('/').collect();
    let mut base = if pattern.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    let mut rest = Vec::new();
    for (i, component) in components.iter().enumerate() {
        let is_last = i + 1 == components.len();
        if rest.is_empty() && !is_last && !component.contains(['*', '?', '[', '{']) {
            base.push(component);
        } else {
            rest.push(*component);
        }
    }
    if base.as_os_str().is_empty() {
        base.push(".");
    }
    (base, rest.join("/"))
}

/// Reads every bundle declared under the sections listed in `bundle_types`.
pub fn collect_bundles(config: &Config) -> Result<Vec<Bundle>> {
    let mut bundles = Vec::new();

    for (key, category) in config.bundle_types()? {
        let Some(section) = config.section(&key) else {
            continue;
        };

        for (name, value) in section {
            let Value::Table(table) = value else {
                return Err(Error::InvalidBundle {
                    bundle: name.clone(),
                    reason: format!("'{key}.{name}' must be a table"),
                });
            };
            let spec: BundleSpec =
                Value::Table(table.clone())
                    .try_into()
                    .map_err(|e: toml::de::Error| Error::InvalidBundle {
                        bundle: name.clone(),
                        reason: e.to_string(),
                    })?;
            let sources = spec.source.map(Patterns::into_vec).unwrap_or_default();
            if sources.is_empty() {
                return Err(Error::InvalidBundle {
                    bundle: name.clone(),
                    reason: "missing 'source'".to_string(),
                });
            }

            bundles.push(Bundle {
                name: name.clone(),
                category: category.clone(),
                task_name: bundle_task_name(&category, name),
                sources,
                destination: spec.destination.unwrap_or_else(|| name.clone()),
                runner: spec.runner,
                format: spec.format,
                externals: spec.externals,
                watch: spec.watch.map(Patterns::into_vec).unwrap_or_default(),
                directory: spec.directory,
                extra: spec.extra,
            });
        }
    }

    let mut per_category: HashMap<String, usize> = HashMap::new();
    for bundle in &bundles {
        *per_category.entry(bundle.category.clone()).or_default() += 1;
    }
    for bundle in &mut bundles {
        if per_category[&bundle.category] == 1 && bundle.name == bundle.category {
            bundle.task_name = bundle.category.clone();
        }
    }

    debug!(count = bundles.len(), "collected bundles");
    Ok(bundles)
}
