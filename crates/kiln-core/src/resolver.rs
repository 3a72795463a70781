//! Runner tables and the selection of one runner per bundle.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::backend::Backend;
use crate::bundle::Bundle;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::preset::Capability;

/// A backend hook offered for a category under a runner identifier.
#[derive(Debug, Clone)]
pub struct RunnerCandidate {
    /// `backend` or `backend/flavour`, e.g. `gulp/babel`.
    pub id: String,
    /// The preset that contributed this runner.
    pub preset: String,
    pub backend: Arc<dyn Backend>,
}

impl RunnerCandidate {
    /// The segment before the first `/`.
    pub fn backend_segment(&self) -> &str {
        backend_segment(&self.id)
    }
}

fn backend_segment(id: &str) -> &str {
    id.split('/').next().unwrap_or(id)
}

/// Runner candidates per category, accumulated across presets.
#[derive(Debug, Default)]
pub struct RunnerTable {
    categories: Vec<(String, Vec<RunnerCandidate>)>,
    contributor: String,
}

impl RunnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers `backend` for `category`. A runner id already offered by an
    /// earlier preset is replaced and keeps its position.
    pub fn add(&mut self, category: &str, runner: &str, backend: Arc<dyn Backend>) {
        let candidate = RunnerCandidate {
            id: runner.to_string(),
            preset: self.contributor.clone(),
            backend,
        };
        let index = match self.categories.iter().position(|(c, _)| c == category) {
            Some(index) => index,
            None => {
                self.categories.push((category.to_string(), Vec::new()));
                self.categories.len() - 1
            }
        };
        let candidates = &mut self.categories[index].1;
        match candidates.iter_mut().find(|c| c.id == runner) {
            Some(existing) => {
                debug!(runner, category, "runner overridden by later preset");
                *existing = candidate;
            }
            None => candidates.push(candidate),
        }
    }

    pub fn candidates(&self, category: &str) -> &[RunnerCandidate] {
        self.categories
            .iter()
            .find(|(c, _)| c == category)
            .map(|(_, candidates)| candidates.as_slice())
            .unwrap_or_default()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|(c, _)| c.as_str())
    }
}

/// Runs the `bundleCreator` capability of every preset, in load order.
#[instrument(skip_all)]
pub fn collect_runners(ctx: &BuildContext) -> RunnerTable {
    let mut table = RunnerTable::new();
    for preset in ctx.registry().implementations(&Capability::BundleCreator) {
        table.contributor = preset.name().to_string();
        preset.bundle_creator(ctx, &mut table);
    }
    table.contributor.clear();
    table
}

/// Picks the runner for `bundle` among `candidates` (the runners offered for
/// its category).
///
/// An explicit runner selects the candidate with that exact id, otherwise
/// the candidates sharing it as backend segment (`gulp` matches
/// `gulp/babel`). Without one, a sole candidate is chosen.
///
/// # Errors
/// Every failure is a configuration error naming the bundle and the ids it
/// could have used.
pub fn resolve_runner<'a>(
    bundle: &Bundle,
    candidates: &'a [RunnerCandidate],
) -> Result<&'a RunnerCandidate> {
    let ids = || candidates.iter().map(|c| c.id.clone()).collect::<Vec<_>>();

    if let Some(runner) = &bundle.runner {
        if let Some(exact) = candidates.iter().find(|c| c.id == *runner) {
            return Ok(exact);
        }
        let matching: Vec<&RunnerCandidate> = candidates
            .iter()
            .filter(|c| c.backend_segment() == runner)
            .collect();
        return match matching.as_slice() {
            [single] => Ok(single),
            [] => Err(Error::InvalidRunner {
                runner: runner.clone(),
                bundle: bundle.name.clone(),
                candidates: ids(),
            }),
            many => Err(Error::AmbiguousRunner {
                bundle: bundle.name.clone(),
                candidates: many.iter().map(|c| c.id.clone()).collect(),
            }),
        };
    }

    match candidates {
        [] => Err(Error::NoRunner {
            bundle: bundle.name.clone(),
            category: bundle.category.clone(),
        }),
        [single] => Ok(single),
        many if distinct_backends_each_unique(many) => Err(Error::MultipleRunners {
            bundle: bundle.name.clone(),
            candidates: ids(),
        }),
        _ => Err(Error::AmbiguousRunner {
            bundle: bundle.name.clone(),
            candidates: ids(),
        }),
    }
}

/// True when every backend segment appears exactly once.
fn distinct_backends_each_unique(candidates: &[RunnerCandidate]) -> bool {
    candidates.iter().all(|c| {
        candidates
            .iter()
            .filter(|o| o.backend_segment() == c.backend_segment())
            .count()
            == 1
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Job, TaskDefinition};

    #[derive(Debug)]
    struct NullBackend;

    impl Backend for NullBackend {
        fn name(&self) -> &str {
            "null"
        }

        fn prepare(&self, _ctx: &BuildContext, _task: TaskDefinition) -> Result<Arc<dyn Job>> {
            Err(Error::InvalidConfig("not buildable".to_string()))
        }
    }

    fn table(ids: &[&str]) -> RunnerTable {
        let mut table = RunnerTable::new();
        for id in ids {
            table.add("js", id, Arc::new(NullBackend));
        }
        table
    }

    fn bundle(runner: Option<&str>) -> Bundle {
        let bundle = Bundle::new("js", "myBundle", vec!["js/app.js".to_string()]);
        match runner {
            Some(runner) => bundle.with_runner(runner),
            None => bundle,
        }
    }

    #[test]
    fn selects_sole_candidate() {
        let table = table(&["webpack"]);
        let selected = resolve_runner(&bundle(None), table.candidates("js")).unwrap();
        assert_eq!(selected.id, "webpack");
    }

    #[test]
    fn explicit_runner_matches_full_id() {
        let table = table(&["gulp/babel", "webpack"]);
        let selected = resolve_runner(&bundle(Some("webpack")), table.candidates("js")).unwrap();
        assert_eq!(selected.id, "webpack");
    }

    #[test]
    fn explicit_runner_matches_backend_segment() {
        let table = table(&["gulp/typescript", "webpack"]);
        let selected = resolve_runner(&bundle(Some("gulp")), table.candidates("js")).unwrap();
        assert_eq!(selected.id, "gulp/typescript");
    }

    #[test]
    fn explicit_exact_id_beats_segment_match() {
        let table = table(&["webpack", "webpack/legacy"]);
        let selected = resolve_runner(&bundle(Some("webpack")), table.candidates("js")).unwrap();
        assert_eq!(selected.id, "webpack");

        let selected =
            resolve_runner(&bundle(Some("webpack/legacy")), table.candidates("js")).unwrap();
        assert_eq!(selected.id, "webpack/legacy");
    }

    #[test]
    fn unknown_explicit_runner_lists_candidates() {
        let table = table(&["gulp/babel", "gulp/typescript"]);
        let err = resolve_runner(&bundle(Some("someRunner")), table.candidates("js")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid runner 'someRunner' for 'myBundle'. Has to be one of ['gulp/babel', 'gulp/typescript']."
        );
    }

    #[test]
    fn backend_segment_matching_several_is_ambiguous() {
        let table = table(&["gulp/babel", "gulp/typescript"]);
        let err = resolve_runner(&bundle(Some("gulp")), table.candidates("js")).unwrap_err();
        assert!(matches!(err, Error::AmbiguousRunner { .. }));
        assert!(err
            .to_string()
            .starts_with("More than one valid runner exists for 'myBundle'."));
    }

    #[test]
    fn distinct_backends_without_runner_ask_for_one() {
        let table = table(&["gulp/babel", "webpack"]);
        let err = resolve_runner(&bundle(None), table.candidates("js")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "You have multiple runners, please specify a runner for 'myBundle'. Available runners are ['gulp/babel', 'webpack']."
        );
    }

    #[test]
    fn shared_backend_without_runner_is_ambiguous() {
        let table = table(&["gulp/babel", "gulp/typescript"]);
        let err = resolve_runner(&bundle(None), table.candidates("js")).unwrap_err();
        assert!(matches!(err, Error::AmbiguousRunner { .. }));
    }

    #[test]
    fn no_candidates_is_reported() {
        let table = table(&[]);
        let err = resolve_runner(&bundle(None), table.candidates("js")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No runner available for 'myBundle' in category 'js'."
        );
    }

    #[test]
    fn later_offer_replaces_in_place() {
        let mut table = RunnerTable::new();
        table.contributor = "first".to_string();
        table.add("js", "webpack", Arc::new(NullBackend));
        table.add("js", "rollup", Arc::new(NullBackend));
        table.contributor = "second".to_string();
        table.add("js", "webpack", Arc::new(NullBackend));

        let candidates = table.candidates("js");
        let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["webpack", "rollup"]);
        assert_eq!(candidates[0].preset, "second");
    }
}
