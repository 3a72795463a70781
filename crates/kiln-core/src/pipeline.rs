//! Weighted plugin pipelines assembled from preset contributions.
//!
//! Every backend that supports plugins owns a [`PipelineBuilder`]. Presets
//! declaring [`Capability::Pipeline`] receive the builder, in load order, and
//! may add, override or remove named entries. [`PipelineBuilder::build`] then
//! orders the entries by weight (stable, so equal weights keep insertion order)
//! and instantiates each one.

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use toml::{Table, Value};
use tracing::debug;

use crate::bundle::Bundle;
use crate::context::BuildContext;
use crate::error::Result;
use crate::preset::Capability;

pub type PluginFactory<T> = Arc<dyn Fn(&Table) -> Result<T> + Send + Sync>;
pub type PluginInit<T> = Arc<dyn Fn(&PluginContribution<T>) -> Result<T> + Send + Sync>;

/// One named pipeline entry.
pub struct PluginContribution<T> {
    pub weight: i32,
    pub plugin: PluginFactory<T>,
    pub options: Table,
    /// Replaces the default `plugin(options)` instantiation when set.
    pub init: Option<PluginInit<T>>,
}

impl<T> PluginContribution<T> {
    pub fn new(plugin: impl Fn(&Table) -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            weight: 0,
            plugin: Arc::new(plugin),
            options: Table::new(),
            init: None,
        }
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn options(mut self, options: Table) -> Self {
        self.options = options;
        self
    }

    pub fn option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn init(
        mut self,
        init: impl Fn(&PluginContribution<T>) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Arc::new(init));
        self
    }

    pub fn instantiate(&self) -> Result<T> {
        match &self.init {
            Some(init) => init(self),
            None => (self.plugin)(&self.options),
        }
    }
}

impl<T> Clone for PluginContribution<T> {
    fn clone(&self) -> Self {
        Self {
            weight: self.weight,
            plugin: Arc::clone(&self.plugin),
            options: self.options.clone(),
            init: self.init.clone(),
        }
    }
}

impl<T> Debug for PluginContribution<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContribution")
            .field("weight", &self.weight)
            .field("options", &self.options)
            .field("init", &self.init.is_some())
            .finish()
    }
}

/// Named entries in insertion order.
pub struct PipelineBuilder<T> {
    entries: Vec<(String, PluginContribution<T>)>,
}

impl<T> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(name, c)| (name, c)))
            .finish()
    }
}

impl<T> PipelineBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, or fully replaces an existing entry of the same name.
    /// A replaced entry keeps its original insertion position.
    pub fn insert(
        &mut self,
        name: &str,
        contribution: PluginContribution<T>,
    ) -> Option<PluginContribution<T>> {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(n, _)| n == name) {
            return Some(std::mem::replace(existing, contribution));
        }
        self.entries.push((name.to_string(), contribution));
        None
    }

    pub fn remove(&mut self, name: &str) -> Option<PluginContribution<T>> {
        let position = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(position).1)
    }

    pub fn get(&self, name: &str) -> Option<&PluginContribution<T>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// For presets that tweak another preset's entry (e.g. merge options)
    /// instead of replacing it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut PluginContribution<T>> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names ordered by ascending weight; ties keep insertion order.
    pub fn ordered_names(&self) -> Vec<&str> {
        self.ordered().into_iter().map(|(name, _)| name).collect()
    }

    fn ordered(&self) -> Vec<(&str, &PluginContribution<T>)> {
        let mut ordered: Vec<_> = self
            .entries
            .iter()
            .map(|(name, c)| (name.as_str(), c))
            .collect();
        ordered.sort_by_key(|(_, c)| c.weight);
        ordered
    }

    /// Instantiates every entry in weight order.
    pub fn build(&self) -> Result<Vec<T>> {
        self.ordered()
            .into_iter()
            .map(|(name, contribution)| {
                debug!(plugin = name, weight = contribution.weight, "instantiating plugin");
                contribution.instantiate()
            })
            .collect()
    }
}

/// The type-erased view of one backend's builder handed to presets.
pub struct PipelineSlot<'a> {
    backend: &'a str,
    builder: &'a mut dyn Any,
}

impl<'a> PipelineSlot<'a> {
    pub fn new<T: 'static>(backend: &'a str, builder: &'a mut PipelineBuilder<T>) -> Self {
        Self { backend, builder }
    }

    pub fn backend(&self) -> &str {
        self.backend
    }

    /// The builder, if the backend's plugins are of type `T`.
    pub fn builder<T: 'static>(&mut self) -> Option<&mut PipelineBuilder<T>> {
        self.builder.downcast_mut::<PipelineBuilder<T>>()
    }
}

/// Runs the `pipeline:<backend>` capability of every preset, in load order,
/// over `builder`, then instantiates the result.
pub fn assemble<T: 'static>(
    ctx: &BuildContext,
    backend: &str,
    bundle: &Bundle,
    mut builder: PipelineBuilder<T>,
) -> Result<Vec<T>> {
    for preset in ctx.registry().implementations(&Capability::pipeline(backend)) {
        debug!(preset = preset.name(), backend, bundle = %bundle.name, "extending pipeline");
        let mut slot = PipelineSlot::new(backend, &mut builder);
        preset.pipeline(ctx, bundle, &mut slot);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(label: &'static str) -> PluginContribution<String> {
        PluginContribution::new(move |_| Ok(label.to_string()))
    }

    #[test]
    fn builds_in_weight_order() {
        let mut builder = PipelineBuilder::new();
        builder.insert("uglify", plugin("uglify").weight(100));
        builder.insert("json", plugin("json").weight(10));
        builder.insert("resolve", plugin("resolve").weight(40));

        assert_eq!(builder.build().unwrap(), vec!["json", "resolve", "uglify"]);
    }

    #[test]
    fn equal_weights_keep_insertion_order() {
        let mut builder = PipelineBuilder::new();
        builder.insert("b", plugin("b"));
        builder.insert("a", plugin("a"));
        builder.insert("c", plugin("c").weight(-1));

        assert_eq!(builder.ordered_names(), vec!["c", "b", "a"]);
    }

    #[test]
    fn override_replaces_entry_in_place() {
        let mut builder = PipelineBuilder::new();
        builder.insert("first", plugin("first"));
        builder.insert("second", plugin("second"));
        let previous = builder.insert("first", plugin("replacement"));

        assert!(previous.is_some());
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.build().unwrap(), vec!["replacement", "second"]);
    }

    #[test]
    fn remove_drops_entry() {
        let mut builder = PipelineBuilder::new();
        builder.insert("a", plugin("a"));
        builder.insert("b", plugin("b"));
        builder.remove("a");

        assert_eq!(builder.ordered_names(), vec!["b"]);
        assert!(builder.remove("missing").is_none());
    }

    #[test]
    fn init_hook_takes_precedence_over_plugin_call() {
        let mut builder = PipelineBuilder::new();
        builder.insert(
            "minify",
            PluginContribution::new(|_| Ok("plugin".to_string()))
                .option("level", 2_i64)
                .init(|c| Ok(format!("init level={}", c.options["level"]))),
        );

        assert_eq!(builder.build().unwrap(), vec!["init level=2"]);
    }

    #[test]
    fn options_reach_factory() {
        let mut builder = PipelineBuilder::new();
        builder.insert(
            "banner",
            PluginContribution::new(|opts: &Table| {
                Ok(opts
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string())
            })
            .option("text", "/* hi */"),
        );

        assert_eq!(builder.build().unwrap(), vec!["/* hi */"]);
    }

    #[test]
    fn slot_downcasts_only_to_matching_type() {
        let mut builder: PipelineBuilder<String> = PipelineBuilder::new();
        let mut slot = PipelineSlot::new("copy", &mut builder);

        assert!(slot.builder::<u32>().is_none());
        slot.builder::<String>()
            .expect("matching type")
            .insert("x", plugin("x"));
        assert_eq!(slot.backend(), "copy");
        assert_eq!(builder.len(), 1);
    }
}
