use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::{Table, Value};
use tracing::debug;

use crate::constants::{
    BUNDLE_TYPES_KEY, DEFAULT_DEBOUNCE_MS, DEFAULT_DESTINATION, DEFAULT_PORT_BASE, ENV_OVERRIDE,
};
use crate::error::{Error, Result};

/// The user's `kiln.toml`, split into the preset list and everything else.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    pub presets: Vec<String>,
    pub values: Table,
}

impl ProjectConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let values = toml::from_str::<Table>(&text).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_table(values)
    }

    pub fn from_table(mut values: Table) -> Result<Self> {
        let presets = match values.remove("presets") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(name) => Ok(name),
                    other => Err(Error::InvalidConfig(format!(
                        "'presets' entries must be strings, found {}",
                        other.type_str()
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::InvalidConfig(format!(
                    "'presets' must be an array, found {}",
                    other.type_str()
                )))
            }
        };

        Ok(Self { presets, values })
    }
}

/// A preset's default-configuration contribution.
///
/// Values are deep-merged on top of earlier presets. Paths marked with
/// [`ConfigFragment::replace`] overwrite the accumulated value instead of
/// merging into it, which is the only way to drop entries from an array a
/// dependency preset contributed.
#[derive(Debug, Clone, Default)]
pub struct ConfigFragment {
    values: Table,
    replaced: BTreeSet<String>,
}

impl ConfigFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(values: Table) -> Self {
        Self {
            values,
            replaced: BTreeSet::new(),
        }
    }

    /// Sets a value at a dotted path, creating intermediate tables.
    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        insert_path(&mut self.values, path, value.into());
        self
    }

    /// Sets a value that replaces whatever earlier presets put at `path`.
    pub fn replace(mut self, path: &str, value: impl Into<Value>) -> Self {
        insert_path(&mut self.values, path, value.into());
        self.replaced.insert(path.to_string());
        self
    }

    pub fn values(&self) -> &Table {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn insert_path(table: &mut Table, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = table;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        let Value::Table(next) = entry else {
            return;
        };
        current = next;
    }
}

/// How arrays present on both sides of a merge are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayMerge {
    Concat,
    Replace,
}

/// Recursively merges `overlay` into `base`.
///
/// Tables merge key-wise, scalars from `overlay` win, arrays follow `arrays`
/// unless the dotted path is listed in `replaced`.
pub fn merge_tables(
    base: &mut Table,
    overlay: &Table,
    arrays: ArrayMerge,
    replaced: &BTreeSet<String>,
) {
    merge_at(base, overlay, arrays, replaced, "");
}

fn merge_at(
    base: &mut Table,
    overlay: &Table,
    arrays: ArrayMerge,
    replaced: &BTreeSet<String>,
    prefix: &str,
) {
    for (key, value) in overlay {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        if replaced.contains(&path) {
            base.insert(key.clone(), value.clone());
            continue;
        }

        match (base.get_mut(key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_at(existing, incoming, arrays, replaced, &path);
            }
            (Some(Value::Array(existing)), Value::Array(incoming))
                if arrays == ArrayMerge::Concat =>
            {
                existing.extend(incoming.iter().cloned());
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => f.write_str("production"),
            Self::Development => f.write_str("development"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(Error::InvalidConfig(format!(
                "unknown environment '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WatchSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            port_base: DEFAULT_PORT_BASE,
        }
    }
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_port_base() -> u16 {
    DEFAULT_PORT_BASE
}

/// The merged, read-only configuration of one build invocation.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: Table,
}

impl Config {
    /// Folds preset fragments in load order, then lays the project file on top.
    pub fn compose<'a>(
        fragments: impl IntoIterator<Item = &'a ConfigFragment>,
        project: Option<&ProjectConfig>,
    ) -> Self {
        let mut values = Table::new();
        for fragment in fragments {
            merge_tables(
                &mut values,
                &fragment.values,
                ArrayMerge::Concat,
                &fragment.replaced,
            );
        }
        if let Some(project) = project {
            merge_tables(
                &mut values,
                &project.values,
                ArrayMerge::Replace,
                &BTreeSet::new(),
            );
        }
        debug!(keys = values.len(), "composed configuration");
        Self { values }
    }

    pub fn from_table(values: Table) -> Self {
        Self { values }
    }

    pub fn as_table(&self) -> &Table {
        &self.values
    }

    /// Looks up a dotted path such as `exec.js.command`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = current.as_table()?.get(segment)?;
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn section(&self, key: &str) -> Option<&Table> {
        self.values.get(key).and_then(Value::as_table)
    }

    pub fn destination(&self) -> PathBuf {
        PathBuf::from(self.get_str("destination").unwrap_or(DEFAULT_DESTINATION))
    }

    /// The build environment, `KILN_ENV` taking precedence over the file.
    pub fn environment(&self) -> Result<Environment> {
        if let Ok(value) = std::env::var(ENV_OVERRIDE) {
            return value.parse();
        }
        match self.get_str("environment") {
            Some(value) => value.parse(),
            None => Ok(Environment::default()),
        }
    }

    /// `(config key, category)` pairs in declaration order.
    pub fn bundle_types(&self) -> Result<Vec<(String, String)>> {
        let Some(types) = self.values.get(BUNDLE_TYPES_KEY) else {
            return Ok(Vec::new());
        };
        let Value::Table(types) = types else {
            return Err(Error::InvalidConfig(format!(
                "'{BUNDLE_TYPES_KEY}' must be a table"
            )));
        };
        types
            .iter()
            .map(|(key, category)| match category {
                Value::String(category) => Ok((key.clone(), category.clone())),
                other => Err(Error::InvalidConfig(format!(
                    "'{BUNDLE_TYPES_KEY}.{key}' must be a string, found {}",
                    other.type_str()
                ))),
            })
            .collect()
    }

    pub fn watch_settings(&self) -> Result<WatchSettings> {
        match self.values.get("watch") {
            None => Ok(WatchSettings::default()),
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| Error::InvalidConfig(format!("[watch]: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> Table {
        toml::from_str(text).expect("fixture should parse")
    }

    #[test]
    fn later_fragments_win_on_scalars_and_merge_tables() {
        let a = ConfigFragment::from_table(table(
            r#"
            destination = "dist"
            [bundle_types]
            js = "js"
            "#,
        ));
        let b = ConfigFragment::from_table(table(
            r#"
            destination = "build"
            [bundle_types]
            css = "css"
            "#,
        ));

        let cfg = Config::compose([&a, &b], None);
        assert_eq!(cfg.get_str("destination"), Some("build"));
        assert_eq!(
            cfg.bundle_types().unwrap(),
            vec![
                ("js".to_string(), "js".to_string()),
                ("css".to_string(), "css".to_string())
            ]
        );
    }

    #[test]
    fn arrays_concatenate_unless_replaced() {
        let a = ConfigFragment::new().set("exec.categories", vec!["js".to_string()]);
        let b = ConfigFragment::new().set("exec.categories", vec!["css".to_string()]);
        let cfg = Config::compose([&a, &b], None);
        let categories = cfg.get("exec.categories").unwrap().as_array().unwrap();
        assert_eq!(categories.len(), 2);

        let c = ConfigFragment::new().replace("exec.categories", vec!["ts".to_string()]);
        let cfg = Config::compose([&a, &b, &c], None);
        let categories = cfg.get("exec.categories").unwrap().as_array().unwrap();
        assert_eq!(categories, &vec![Value::String("ts".to_string())]);
    }

    #[test]
    fn project_file_overrides_arrays() {
        let preset = ConfigFragment::new().set("exec.categories", vec!["js".to_string()]);
        let project = ProjectConfig::from_table(table(
            r#"
            presets = ["exec"]
            [exec]
            categories = ["css"]
            "#,
        ))
        .unwrap();

        assert_eq!(project.presets, vec!["exec"]);
        let cfg = Config::compose([&preset], Some(&project));
        let categories = cfg.get("exec.categories").unwrap().as_array().unwrap();
        assert_eq!(categories, &vec![Value::String("css".to_string())]);
    }

    #[test]
    fn composing_is_deterministic() {
        let a = ConfigFragment::new().set("a.b", 1_i64);
        let b = ConfigFragment::new().set("a.c", 2_i64);
        let first = Config::compose([&a, &b], None);
        let second = Config::compose([&a, &b], None);
        assert_eq!(first.as_table(), second.as_table());
    }

    #[test]
    fn rejects_non_string_presets() {
        let err = ProjectConfig::from_table(table("presets = [1]")).unwrap_err();
        assert!(err.to_string().contains("'presets' entries must be strings"));
    }

    #[test]
    fn watch_settings_fall_back_to_defaults() {
        let cfg = Config::from_table(table("[watch]\ndebounce_ms = 50"));
        let settings = cfg.watch_settings().unwrap();
        assert_eq!(settings.debounce_ms, 50);
        assert_eq!(settings.port_base, DEFAULT_PORT_BASE);
    }
}
