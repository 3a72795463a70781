use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::{Config, ConfigFragment, ProjectConfig};
use crate::error::{Error, Result};
use crate::preset::{Capability, Preset};

/// The loaded presets of one build, flattened in load order.
///
/// Sub-presets load before the preset that declares them; a preset reachable
/// through several paths loads once, at its first position.
#[derive(Debug, Default, Clone)]
pub struct PresetRegistry {
    presets: Vec<Arc<dyn Preset>>,
}

impl PresetRegistry {
    /// Loads `presets` and, depth-first, every preset they declare.
    ///
    /// # Errors
    /// Returns [`Error::PresetCycle`] if a preset transitively declares itself.
    #[instrument(skip_all)]
    pub fn register(presets: impl IntoIterator<Item = Arc<dyn Preset>>) -> Result<Self> {
        let mut loader = Loader::default();
        for preset in presets {
            loader.visit(preset)?;
        }
        let names: Vec<&str> = loader.loaded.iter().map(|p| p.name()).collect();
        debug!(presets = ?names, "loaded presets");
        Ok(Self {
            presets: loader.loaded,
        })
    }

    pub fn presets(&self) -> &[Arc<dyn Preset>] {
        &self.presets
    }

    /// Names of the loaded presets, in load order.
    pub fn loaded(&self) -> Vec<&str> {
        self.presets.iter().map(|p| p.name()).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.presets.iter().any(|p| p.name() == name)
    }

    /// Presets declaring `capability`, in load order.
    pub fn implementations(&self, capability: &Capability) -> Vec<Arc<dyn Preset>> {
        self.presets
            .iter()
            .filter(|p| p.capabilities().contains(capability))
            .cloned()
            .collect()
    }

    /// Folds the default configuration of every preset, later presets winning.
    pub fn merge_default_config(&self) -> Config {
        self.compose_config(None)
    }

    /// Preset defaults overlaid by the project's own configuration.
    pub fn compose_config(&self, project: Option<&ProjectConfig>) -> Config {
        let fragments: Vec<ConfigFragment> = self
            .implementations(&Capability::DefaultConfig)
            .iter()
            .map(|p| p.default_config())
            .collect();
        Config::compose(&fragments, project)
    }
}

#[derive(Default)]
struct Loader {
    loaded: Vec<Arc<dyn Preset>>,
    seen: HashSet<String>,
    stack: Vec<String>,
}

impl Loader {
    fn visit(&mut self, preset: Arc<dyn Preset>) -> Result<()> {
        let name = preset.name().to_string();
        if let Some(start) = self.stack.iter().position(|n| *n == name) {
            let mut path = self.stack[start..].to_vec();
            path.push(name);
            return Err(Error::PresetCycle(path));
        }
        if self.seen.contains(&name) {
            return Ok(());
        }

        self.stack.push(name.clone());
        for sub in preset.presets() {
            self.visit(sub)?;
        }
        self.stack.pop();

        self.seen.insert(name);
        self.loaded.push(preset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct MockPreset {
        name: &'static str,
        caps: Vec<Capability>,
        subs: Vec<&'static str>,
        dest: Option<&'static str>,
    }

    impl MockPreset {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                caps: Vec::new(),
                subs: Vec::new(),
                dest: None,
            }
        }

        fn with_subs(mut self, subs: &[&'static str]) -> Self {
            self.subs = subs.to_vec();
            self
        }

        fn with_destination(mut self, dest: &'static str) -> Self {
            self.caps.push(Capability::DefaultConfig);
            self.dest = Some(dest);
            self
        }

        fn arc(self) -> Arc<dyn Preset> {
            Arc::new(self)
        }
    }

    // Sub-presets are built by name so tests can express cycles.
    fn named(name: &'static str) -> MockPreset {
        match name {
            "babel" => MockPreset::new("babel").with_subs(&["eslint"]),
            "cycle-a" => MockPreset::new("cycle-a").with_subs(&["cycle-b"]),
            "cycle-b" => MockPreset::new("cycle-b").with_subs(&["cycle-a"]),
            other => MockPreset::new(other),
        }
    }

    impl Preset for MockPreset {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> HashSet<Capability> {
            self.caps.iter().cloned().collect()
        }

        fn presets(&self) -> Vec<Arc<dyn Preset>> {
            self.subs.iter().map(|s| named(s).arc()).collect()
        }

        fn default_config(&self) -> ConfigFragment {
            match self.dest {
                Some(dest) => ConfigFragment::new().set("destination", dest),
                None => ConfigFragment::new(),
            }
        }
    }

    #[test]
    fn loads_sub_presets_before_their_parent() {
        let registry =
            PresetRegistry::register(vec![named("babel").arc(), named("images").arc()]).unwrap();
        assert_eq!(registry.loaded(), vec!["eslint", "babel", "images"]);
    }

    #[test]
    fn loads_shared_sub_preset_once() {
        let registry = PresetRegistry::register(vec![
            MockPreset::new("ts").with_subs(&["eslint"]).arc(),
            named("babel").arc(),
        ])
        .unwrap();
        assert_eq!(registry.loaded(), vec!["eslint", "ts", "babel"]);
        assert!(registry.is_loaded("eslint"));
        assert!(!registry.is_loaded("webpack"));
    }

    #[test]
    fn reports_cycle_path() {
        let err = PresetRegistry::register(vec![named("cycle-a").arc()]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Preset cycle detected: cycle-a -> cycle-b -> cycle-a"
        );
    }

    #[test]
    fn implementations_follow_load_order() {
        let registry = PresetRegistry::register(vec![
            MockPreset::new("first").with_destination("a").arc(),
            MockPreset::new("plain").arc(),
            MockPreset::new("second").with_destination("b").arc(),
        ])
        .unwrap();

        let names: Vec<_> = registry
            .implementations(&Capability::DefaultConfig)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn implementations_are_deterministic() {
        let presets = vec![
            MockPreset::new("first").with_destination("a").arc(),
            named("babel").with_destination("b").arc(),
            MockPreset::new("second").with_destination("c").arc(),
        ];
        let registry = PresetRegistry::register(presets.clone()).unwrap();

        let first = registry.implementations(&Capability::DefaultConfig);
        let second = registry.implementations(&Capability::DefaultConfig);
        assert_eq!(first.len(), 3);
        assert!(first.iter().zip(&second).all(|(a, b)| Arc::ptr_eq(a, b)));

        let again = PresetRegistry::register(presets).unwrap();
        assert_eq!(again.loaded(), registry.loaded());
        assert_eq!(
            again.merge_default_config().as_table(),
            registry.merge_default_config().as_table()
        );
    }

    #[test]
    fn later_preset_defaults_win() {
        let registry = PresetRegistry::register(vec![
            MockPreset::new("first").with_destination("a").arc(),
            MockPreset::new("second").with_destination("b").arc(),
        ])
        .unwrap();

        let config = registry.merge_default_config();
        assert_eq!(config.get_str("destination"), Some("b"));
    }

    #[test]
    fn empty_registry_has_empty_config() {
        let registry = PresetRegistry::register(Vec::new()).unwrap();
        assert!(registry.loaded().is_empty());
        assert!(registry.merge_default_config().as_table().is_empty());
    }
}
